//! MinnowVPN packet-tunnel extension
//!
//! Session controller that sits between a packet-tunnel host (which owns the
//! virtual interface) and a WireGuard engine (which owns the protocol).
//!
//! # Features
//!
//! - One tunnel session per controller, guarded by a single async lock
//! - Settings in wg-quick INI or wireguard-go UAPI form
//! - Packet pump between the host flow and the engine on its own task
//! - Automatic teardown when the host packet channel fails
//! - Bundled loopback engine running real transport encryption
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use minnowvpn_extension::{ChannelPacketFlow, LoopbackEngine, TunnelController};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = std::fs::read_to_string("wireguard.conf")?;
//!     let (flow, _host) = ChannelPacketFlow::pair(64);
//!
//!     let controller = TunnelController::new(LoopbackEngine::new());
//!     controller.set_packet_flow(Arc::new(flow)).await?;
//!     controller.turn_on("utun3", &settings).await?;
//!     controller.start_reading_packets().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod flow;
pub mod netinfo;
pub mod protocol;
pub mod tunnel;

pub use config::WireGuardConfig;
pub use controller::{ControllerState, SessionEvent, SessionStatus, TunnelController};
pub use engine::{Engine, EngineHandle, LoopbackEngine, TransferStats};
pub use error::ExtensionError;
pub use flow::{ChannelPacketFlow, HostEndpoint, IpFamily, PacketFlow};
pub use tunnel::TunPacketFlow;
