//! Queued command dispatcher
//!
//! Bridges the engine's `CommandSink` calls onto an mpsc queue drained by
//! the mesh transport task. Each request carries a oneshot channel the
//! transport answers once the radio has acknowledged delivery.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::provider::{CommandSink, DispatchError, OutboundCommand};

/// Default depth of the outbound command queue
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// One queued command plus its acknowledgement channel
#[derive(Debug)]
pub struct DispatchRequest {
    /// The command to deliver
    pub command: OutboundCommand,

    /// Answered by the transport with the delivery result
    pub ack: oneshot::Sender<Result<(), DispatchError>>,
}

impl DispatchRequest {
    /// Acknowledge successful delivery
    pub fn acknowledge(self) {
        let _ = self.ack.send(Ok(()));
    }

    /// Report a failed delivery
    pub fn reject(self, error: DispatchError) {
        let _ = self.ack.send(Err(error));
    }
}

/// `CommandSink` backed by an mpsc queue to the transport task
#[derive(Clone)]
pub struct QueuedDispatcher {
    tx: mpsc::Sender<DispatchRequest>,
}

impl QueuedDispatcher {
    /// Create a dispatcher and the receiver the transport task drains
    pub fn channel() -> (Self, mpsc::Receiver<DispatchRequest>) {
        Self::with_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Create a dispatcher with a specific queue depth
    pub fn with_depth(depth: usize) -> (Self, mpsc::Receiver<DispatchRequest>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CommandSink for QueuedDispatcher {
    async fn send_command(&self, command: OutboundCommand) -> Result<(), DispatchError> {
        let (ack_tx, ack_rx) = oneshot::channel();

        debug!(ieee = %command.target_ieee, command = %command.command, "Queueing outbound command");

        self.tx
            .send(DispatchRequest {
                command,
                ack: ack_tx,
            })
            .await
            .map_err(|_| DispatchError::Unavailable)?;

        // Transport dropped the request without answering
        ack_rx.await.map_err(|_| DispatchError::NoAck)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mg_core::{AttrValue, Ieee};

    fn command(name: &str) -> OutboundCommand {
        OutboundCommand {
            target_ieee: Ieee::new(0xAA),
            command: name.to_string(),
            value: Some(AttrValue::Int(200)),
            endpoint_id: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_acknowledged() {
        let (dispatcher, mut rx) = QueuedDispatcher::channel();

        let transport = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.command.command, "set_level");
            request.acknowledge();
        });

        dispatcher.send_command(command("set_level")).await.unwrap();
        transport.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_rejected() {
        let (dispatcher, mut rx) = QueuedDispatcher::channel();

        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            request.reject(DispatchError::Rejected("device offline".to_string()));
        });

        let err = dispatcher.send_command(command("on")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_dispatch_dropped_request_is_no_ack() {
        let (dispatcher, mut rx) = QueuedDispatcher::channel();

        tokio::spawn(async move {
            // Drop the request without answering the ack channel
            let _ = rx.recv().await;
        });

        let err = dispatcher.send_command(command("on")).await.unwrap_err();
        assert_eq!(err, DispatchError::NoAck);
    }

    #[tokio::test]
    async fn test_dispatch_closed_queue_is_unavailable() {
        let (dispatcher, rx) = QueuedDispatcher::channel();
        drop(rx);

        let err = dispatcher.send_command(command("on")).await.unwrap_err();
        assert_eq!(err, DispatchError::Unavailable);
    }
}
