//! meshgate gateway
//!
//! Main entry point: wires the device shadow, rule engine, command
//! dispatcher, and REST API together and runs until ctrl-c.

mod config;

use anyhow::Result;
use mg_api::AppState;
use mg_rules::{EngineSettings, RuleEngine};
use mg_shadow::{DeviceShadow, QueuedDispatcher};
use mg_storage::FileRuleStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::GatewayConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = GatewayConfig::load(config_path.as_deref())?;

    info!("Starting meshgate");

    let shadow = Arc::new(DeviceShadow::new());
    let (dispatcher, mut outbound) = QueuedDispatcher::channel();
    let store = Arc::new(FileRuleStore::new(&config.data_dir));

    let engine = Arc::new(RuleEngine::with_settings(
        shadow.clone(),
        Arc::new(dispatcher),
        store,
        EngineSettings {
            trace_capacity: config.trace_capacity,
            command_timeout: Duration::from_secs_f64(config.command_timeout_secs),
        },
    ));

    let loaded = engine.load().await?;
    info!("Loaded {} rules", loaded);

    engine.clone().start();

    // Drain the outbound queue. The mesh radio transport attaches here;
    // until one is wired in, deliveries are logged and acknowledged.
    tokio::spawn(async move {
        while let Some(request) = outbound.recv().await {
            info!(
                ieee = %request.command.target_ieee,
                command = %request.command.command,
                "Delivering command to mesh transport"
            );
            request.acknowledge();
        }
    });

    let state = AppState {
        engine: engine.clone(),
        shadow,
    };
    let app = mg_api::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!("API listening on {}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
            engine.stop();
        })
        .await?;

    Ok(())
}
