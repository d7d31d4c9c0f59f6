//! Gateway configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Gateway configuration, loaded from YAML with defaults for every field
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the REST API listens on
    pub listen: SocketAddr,

    /// Directory holding the `.storage/` rule files
    pub data_dir: PathBuf,

    /// Entries retained in the execution trace ring
    pub trace_capacity: usize,

    /// Seconds a command waits for its transport acknowledgement
    pub command_timeout_secs: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8087).into(),
            data_dir: PathBuf::from("data"),
            trace_capacity: 500,
            command_timeout_secs: 10.0,
        }
    }
}

impl GatewayConfig {
    /// Load from a YAML file, or fall back to defaults when no path given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}
