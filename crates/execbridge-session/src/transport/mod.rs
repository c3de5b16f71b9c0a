//! Event transport seam between sessions and the remote peer.
//!
//! A session subscribes to one inbound event for stdin data and emits its
//! output and exit notifications as named events with two string payloads.

mod local;
mod relay;

pub use local::{EmittedEvent, LocalTransport};
pub use relay::RelayHandler;

use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Failed to subscribe to {event}: {reason}")]
    Subscribe { event: String, reason: String },
}

/// Duplex event channel to a remote peer.
pub trait Transport: Send + Sync {
    /// Subscribe to an inbound event. Messages arrive in delivery order and
    /// the receiver ends when the transport drops the subscription.
    fn subscribe(&self, event: &str) -> Result<mpsc::UnboundedReceiver<String>, TransportError>;

    /// Emit an outbound event with two string payloads.
    fn emit(&self, event: &str, first: &str, second: &str) -> Result<(), TransportError>;
}
