//! WireGuard transport-data layer
//!
//! Only the data plane lives here: the type 4 wire header, packet sealing,
//! and the anti-replay window. Handshakes are the engine's business.

pub mod messages;
pub mod transport;

pub use messages::{MessageType, TransportHeader};
pub use transport::{ReplayWindow, TransportState};
