//! Host packet channel
//!
//! The host owns the virtual interface and hands the controller a
//! bidirectional packet flow: outbound packets (leaving the device, to be
//! encrypted) are read from it, inbound packets (decrypted by the engine) are
//! written back to it.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::error::ChannelError;

/// Address family of a raw IP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Detect the family from the IP version nibble
    pub fn of_packet(packet: &[u8]) -> Option<Self> {
        match packet.first()? >> 4 {
            4 => Some(Self::V4),
            6 => Some(Self::V6),
            _ => None,
        }
    }

    /// Platform protocol number the host expects alongside written packets
    pub fn protocol_number(self) -> i32 {
        match self {
            #[cfg(unix)]
            Self::V4 => libc::AF_INET,
            #[cfg(unix)]
            Self::V6 => libc::AF_INET6,
            #[cfg(not(unix))]
            Self::V4 => 2,
            #[cfg(not(unix))]
            Self::V6 => 23,
        }
    }
}

/// Bidirectional packet channel provided by the host.
///
/// `read_packet` must be cancel-safe: the packet pump races it against the
/// engine and the shutdown signal.
#[async_trait]
pub trait PacketFlow: Send + Sync {
    /// Wait for the next outbound packet
    async fn read_packet(&self) -> Result<Vec<u8>, ChannelError>;

    /// Deliver an inbound packet to the host
    async fn write_packet(&self, packet: &[u8], family: IpFamily) -> Result<(), ChannelError>;
}

/// In-process packet flow backed by tokio channels
pub struct ChannelPacketFlow {
    outbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    inbound: mpsc::Sender<(Vec<u8>, IpFamily)>,
}

/// The host's side of a [`ChannelPacketFlow`]
pub struct HostEndpoint {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<(Vec<u8>, IpFamily)>,
}

impl ChannelPacketFlow {
    /// Create a flow and the host endpoint driving it.
    ///
    /// Dropping the endpoint closes the channel in both directions.
    pub fn pair(capacity: usize) -> (Self, HostEndpoint) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

        (
            Self {
                outbound: Mutex::new(outbound_rx),
                inbound: inbound_tx,
            },
            HostEndpoint {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
        )
    }
}

#[async_trait]
impl PacketFlow for ChannelPacketFlow {
    async fn read_packet(&self) -> Result<Vec<u8>, ChannelError> {
        self.outbound.lock().await.recv().await.ok_or(ChannelError::Closed)
    }

    async fn write_packet(&self, packet: &[u8], family: IpFamily) -> Result<(), ChannelError> {
        self.inbound
            .send((packet.to_vec(), family))
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

impl HostEndpoint {
    /// Queue a packet leaving the virtual interface
    pub async fn inject(&self, packet: Vec<u8>) -> Result<(), ChannelError> {
        self.outbound
            .send(packet)
            .await
            .map_err(|e| ChannelError::WriteFailed {
                reason: e.to_string(),
            })
    }

    /// Next packet the controller delivered to the host
    pub async fn next_inbound(&mut self) -> Option<(Vec<u8>, IpFamily)> {
        self.inbound.recv().await
    }
}
