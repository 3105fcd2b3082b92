//! WireGuard engine boundary
//!
//! The controller never speaks the WireGuard protocol itself. It hands the
//! parsed settings to an [`Engine`], receives an [`EngineHandle`] for the
//! created interface, and shuttles packets through that handle.

pub mod loopback;

use std::net::IpAddr;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::WireGuardConfig;
use crate::error::EngineError;

pub use loopback::{LoopbackEngine, LoopbackHandle};

/// Traffic counters reported by an engine interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub reassert_count: u64,
}

/// A WireGuard implementation able to bring up tunnel interfaces
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    type Handle: EngineHandle;

    /// Version identifier of the engine
    fn version() -> String;

    /// Best-effort local address, for diagnostics
    fn detect_address() -> Option<IpAddr> {
        crate::netinfo::detect_address()
    }

    /// Bring up an interface named `interface_name` running `config`
    async fn create_interface(
        &self,
        interface_name: &str,
        config: &WireGuardConfig,
    ) -> Result<Self::Handle, EngineError>;
}

/// A live engine interface.
///
/// `recv` must be cancel-safe; the packet pump polls it alongside the host
/// channel.
#[async_trait]
pub trait EngineHandle: Send + Sync + 'static {
    fn interface_name(&self) -> &str;

    /// Hand an outbound packet from the host to the engine
    async fn send(&self, packet: &[u8]) -> Result<(), EngineError>;

    /// Wait for the next decrypted inbound packet
    async fn recv(&self) -> Result<Vec<u8>, EngineError>;

    /// Re-apply interface and socket bindings, keeping session keys
    async fn reassert(&self) -> Result<(), EngineError>;

    /// Bring the interface down; `recv` returns [`EngineError::Closed`] afterwards
    async fn teardown(&self) -> Result<(), EngineError>;

    fn stats(&self) -> TransferStats;
}
