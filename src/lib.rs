pub mod game;
pub mod queue;
pub mod service;
pub mod session;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use service::{ConnectionService, InboundMessage, ServiceConfig, ServiceEvent};
pub use session::{PeerState, SessionError};
pub use transport::{TransportChannel, TransportError, TransportEvent};
