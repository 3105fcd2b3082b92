//! Settings parsing for the tunnel engine
//!
//! The controller accepts the settings string in either of the two grammars
//! WireGuard tooling speaks:
//! - wg-quick style `.conf` files with `[Interface]` and `[Peer]` sections
//! - the wireguard-go UAPI `key=value` protocol

mod parser;
mod uapi;

pub use parser::{InterfaceConfig, PeerConfig, WireGuardConfig};
