//! Collaborator seams between the rule engine and the surrounding system
//!
//! The engine never talks to the mesh directly. It reads device state
//! through [`StateProvider`] and sends commands through [`CommandSink`];
//! both are shared freely across evaluation and sequence tasks and must
//! be safe for concurrent use.

use async_trait::async_trait;
use mg_core::{AttrType, AttrValue, AttributeChanged, Ieee};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Read access to device state plus the change feed
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Current value and declared type of a device attribute
    async fn attribute(&self, ieee: Ieee, attribute: &str) -> Option<(AttrValue, AttrType)>;

    /// Subscribe to the attribute-change feed
    fn subscribe(&self) -> broadcast::Receiver<AttributeChanged>;
}

/// A command on its way to a mesh device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    /// Target device
    pub target_ieee: Ieee,

    /// Command name from the device's command catalog
    pub command: String,

    /// Command payload, if the command takes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<AttrValue>,

    /// Endpoint for multi-endpoint devices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<u8>,
}

/// Errors surfaced by the command transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("transport rejected command: {0}")]
    Rejected(String),

    #[error("mesh transport unavailable")]
    Unavailable,

    #[error("no acknowledgement from transport")]
    NoAck,
}

/// Outbound command dispatch with transport acknowledgement
///
/// `send_command` resolves once the transport has acknowledged (or
/// rejected) the delivery. Callers bound the wait with their own timeout;
/// delivery is best-effort, not exactly-once.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, command: OutboundCommand) -> Result<(), DispatchError>;
}
