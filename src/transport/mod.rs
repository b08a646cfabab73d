//! Transport layer: a broadcast-fanout pipe bound to a named topic.
//!
//! Every participant in a session publishes to and subscribes from the same
//! topic; session affinity is enforced one layer up by the frame envelope's
//! session UUID filter, not by the transport.

pub mod memory;

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use memory::{MemoryMedium, MemoryTopic};

/// Identity of one fanout topic shared by all peers of a session.
pub type TopicId = Uuid;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("topic binding released")]
    Closed,
    #[error("underlying link down: {0}")]
    LinkDown(String),
}

/// Low-level channel lifecycle events, reported asynchronously.
///
/// `Dropped` means the underlying medium failed, not that anyone asked to
/// disconnect; the owner is expected to hold its peers in a recovering state
/// until `Recovered` arrives.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Dropped { reason: String },
    Recovered,
}

/// A bidirectional broadcast-fanout pipe bound to one topic.
///
/// `publish` fans a frame out to every subscriber of the topic, including the
/// publisher itself. `disconnect` releases the binding; peers still attached
/// must be torn down by the owner first.
pub trait TransportChannel: Send + Sync {
    fn topic(&self) -> TopicId;
    fn connect(&self) -> Result<(), TransportError>;
    fn publish(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
    fn disconnect(&self);
}
