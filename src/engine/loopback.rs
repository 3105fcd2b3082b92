//! Loopback WireGuard engine
//!
//! Seals every outbound packet as a transport data message, hands it to a
//! local reflector playing the peer, and opens the reflected message as the
//! inbound packet. Keys come from the configured static keys, so both
//! directions run real ChaCha20-Poly1305 with replay protection, but no
//! handshake or socket is involved.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::config::WireGuardConfig;
use crate::crypto::{blake2s, x25519};
use crate::engine::{Engine, EngineHandle, TransferStats};
use crate::error::{EngineError, ExtensionError};
use crate::protocol::TransportState;

/// Messages in flight between the engine and its reflector
const WIRE_QUEUE_DEPTH: usize = 256;

/// Engine that reflects sealed traffic back to the host
#[derive(Debug, Default, Clone)]
pub struct LoopbackEngine {
    /// Interface names currently up on this engine
    interfaces: Arc<StdMutex<HashSet<String>>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an interface with this name is up
    pub fn is_active(&self, interface_name: &str) -> bool {
        self.interfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(interface_name)
    }
}

#[async_trait]
impl Engine for LoopbackEngine {
    type Handle = LoopbackHandle;

    fn version() -> String {
        format!("loopback-{}", env!("CARGO_PKG_VERSION"))
    }

    async fn create_interface(
        &self,
        interface_name: &str,
        config: &WireGuardConfig,
    ) -> Result<LoopbackHandle, EngineError> {
        {
            let mut interfaces = self
                .interfaces
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !interfaces.insert(interface_name.to_string()) {
                return Err(EngineError::CreateFailed {
                    interface: interface_name.to_string(),
                    reason: "interface name already in use".to_string(),
                });
            }
        }

        let (sending_key, receiving_key) = derive_keys(config);
        let (wire_tx, wire_rx) = mpsc::channel(WIRE_QUEUE_DEPTH);

        tracing::info!(
            "Loopback interface {} up ({} peer(s))",
            interface_name,
            config.peers.len()
        );

        Ok(LoopbackHandle {
            interface_name: interface_name.to_string(),
            registry: Arc::clone(&self.interfaces),
            local_index: rand::random(),
            remote_index: rand::random(),
            local: StdMutex::new(TransportState::new(sending_key, receiving_key)),
            reflector: StdMutex::new(TransportState::new(receiving_key, sending_key)),
            wire_tx: StdMutex::new(Some(wire_tx)),
            wire_rx: Mutex::new(wire_rx),
            closed: AtomicBool::new(false),
            bind_generation: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }
}

/// Static-key session keys: DH with the first peer (or ourselves), mixed with
/// that peer's preshared key.
fn derive_keys(config: &WireGuardConfig) -> ([u8; 32], [u8; 32]) {
    let peer = config.peers.first();
    let peer_public = peer
        .map(|p| p.public_key)
        .unwrap_or_else(|| config.public_key());
    let psk = peer.and_then(|p| p.preshared_key).unwrap_or([0u8; 32]);

    let shared = x25519::dh(&config.interface.private_key, &peer_public);
    blake2s::kdf2(&shared, &psk)
}

#[derive(Debug, Default)]
struct Counters {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    reasserts: AtomicU64,
}

/// A loopback interface
pub struct LoopbackHandle {
    interface_name: String,
    registry: Arc<StdMutex<HashSet<String>>>,
    local_index: u32,
    remote_index: u32,
    /// Our side of the session
    local: StdMutex<TransportState>,
    /// The peer's side, with keys swapped
    reflector: StdMutex<TransportState>,
    wire_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    wire_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
    bind_generation: AtomicU64,
    counters: Counters,
}

impl LoopbackHandle {
    /// Number of times the interface has been rebound
    pub fn bind_generation(&self) -> u64 {
        self.bind_generation.load(Ordering::SeqCst)
    }

    /// Next counter our side will seal with
    pub fn sending_counter(&self) -> u64 {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sending_counter
    }

    /// Peer side: open a message from us and seal the reply
    fn reflect(&self, message: &[u8]) -> Result<Vec<u8>, ExtensionError> {
        let mut reflector = self.reflector.lock().unwrap_or_else(PoisonError::into_inner);
        let plaintext = reflector.decrypt(message)?;
        reflector.encrypt(self.local_index, &plaintext)
    }

    /// Turn a dequeued wire message into the inbound packet, if any
    fn open_reflected(&self, message: &[u8]) -> Option<Vec<u8>> {
        let reply = match self.reflect(message) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::trace!("Reflector dropped message: {}", e);
                return None;
            }
        };

        let opened = self
            .local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decrypt(&reply);
        match opened {
            // Keepalives carry no packet
            Ok(plaintext) if plaintext.is_empty() => None,
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                tracing::trace!("Dropped inbound message: {}", e);
                None
            }
        }
    }

    fn release_name(&self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.interface_name);
    }
}

#[async_trait]
impl EngineHandle for LoopbackHandle {
    fn interface_name(&self) -> &str {
        &self.interface_name
    }

    async fn send(&self, packet: &[u8]) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }

        let message = self
            .local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .encrypt(self.remote_index, packet)
            .map_err(|e| EngineError::SendFailed {
                reason: e.to_string(),
            })?;

        let wire = self
            .wire_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::Closed)?;

        // A full queue drops the packet, like a saturated NIC
        wire.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::SendFailed {
                reason: "wire queue full".to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => EngineError::Closed,
        })?;

        self.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .tx_bytes
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, EngineError> {
        let mut wire_rx = self.wire_rx.lock().await;

        loop {
            let Some(message) = wire_rx.recv().await else {
                return Err(EngineError::Closed);
            };
            if self.closed.load(Ordering::SeqCst) {
                return Err(EngineError::Closed);
            }

            // Everything after the dequeue is synchronous, so a cancelled
            // recv never loses a message
            let Some(plaintext) = self.open_reflected(&message) else {
                continue;
            };

            self.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
            self.counters
                .rx_bytes
                .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
            return Ok(plaintext);
        }
    }

    async fn reassert(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }

        let generation = self.bind_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.reasserts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Rebound loopback interface {} (generation {})",
            self.interface_name,
            generation
        );
        Ok(())
    }

    async fn teardown(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.wire_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.release_name();
        tracing::info!("Loopback interface {} down", self.interface_name);
        Ok(())
    }

    fn stats(&self) -> TransferStats {
        TransferStats {
            tx_packets: self.counters.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.counters.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.counters.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.counters.rx_bytes.load(Ordering::Relaxed),
            reassert_count: self.counters.reasserts.load(Ordering::Relaxed),
        }
    }
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        // After teardown the name may already belong to a newer interface
        if !self.closed.load(Ordering::SeqCst) {
            self.release_name();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SETTINGS: &str = "[Interface]\n\
        PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n\
        [Peer]\n\
        PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n\
        Endpoint = 1.2.3.4:51820\n";

    fn config() -> WireGuardConfig {
        WireGuardConfig::parse_settings(SETTINGS).unwrap()
    }

    #[tokio::test]
    async fn test_packet_reflects() {
        let engine = LoopbackEngine::new();
        let handle = engine.create_interface("utun3", &config()).await.unwrap();

        let packet = vec![0x45, 0, 0, 20, 1, 2, 3, 4];
        handle.send(&packet).await.unwrap();
        assert_eq!(handle.recv().await.unwrap(), packet);

        let stats = handle.stats();
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.rx_packets, 1);
        assert_eq!(stats.tx_bytes, packet.len() as u64);
    }

    #[tokio::test]
    async fn test_keepalive_not_delivered() {
        let engine = LoopbackEngine::new();
        let handle = engine.create_interface("utun3", &config()).await.unwrap();

        handle.send(&[]).await.unwrap();
        handle.send(&[0x60, 1]).await.unwrap();
        assert_eq!(handle.recv().await.unwrap(), vec![0x60, 1]);
    }

    #[tokio::test]
    async fn test_duplicate_interface_name() {
        let engine = LoopbackEngine::new();
        let _first = engine.create_interface("utun3", &config()).await.unwrap();

        let second = engine.create_interface("utun3", &config()).await;
        assert!(matches!(second, Err(EngineError::CreateFailed { .. })));

        // Other names are fine
        assert!(engine.create_interface("utun4", &config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_teardown_frees_name_and_closes() {
        let engine = LoopbackEngine::new();
        let handle = engine.create_interface("utun3", &config()).await.unwrap();
        assert!(engine.is_active("utun3"));

        handle.teardown().await.unwrap();
        assert!(!engine.is_active("utun3"));
        assert!(matches!(handle.recv().await, Err(EngineError::Closed)));
        assert!(matches!(handle.send(&[0x45]).await, Err(EngineError::Closed)));
        assert!(matches!(handle.reassert().await, Err(EngineError::Closed)));

        // Second teardown is harmless
        handle.teardown().await.unwrap();
        assert!(engine.create_interface("utun3", &config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handle_frees_name() {
        let engine = LoopbackEngine::new();
        let handle = engine.create_interface("utun3", &config()).await.unwrap();
        drop(handle);
        assert!(!engine.is_active("utun3"));
    }

    #[tokio::test]
    async fn test_reassert_keeps_session_state() {
        let engine = LoopbackEngine::new();
        let handle = engine.create_interface("utun3", &config()).await.unwrap();

        handle.send(&[0x45, 1]).await.unwrap();
        handle.recv().await.unwrap();
        assert_eq!(handle.sending_counter(), 1);

        handle.reassert().await.unwrap();
        assert_eq!(handle.bind_generation(), 1);
        assert_eq!(handle.sending_counter(), 1);

        handle.send(&[0x45, 2]).await.unwrap();
        assert_eq!(handle.recv().await.unwrap(), vec![0x45, 2]);
        assert_eq!(handle.stats().reassert_count, 1);
    }

    #[tokio::test]
    async fn test_recv_waits_for_traffic() {
        let engine = LoopbackEngine::new();
        let handle = engine.create_interface("utun3", &config()).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), handle.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_recv_keeps_messages() {
        let engine = LoopbackEngine::new();
        let handle = engine.create_interface("utun3", &config()).await.unwrap();

        for marker in 0..32u8 {
            handle.send(&[0x45, marker]).await.unwrap();
        }

        // Drop plenty of recv futures along the way; nothing may go missing
        let mut received = Vec::new();
        while received.len() < 32 {
            tokio::select! {
                packet = handle.recv() => received.push(packet.unwrap()),
                _ = tokio::task::yield_now() => {}
            }
        }

        let expected: Vec<Vec<u8>> = (0..32u8).map(|marker| vec![0x45, marker]).collect();
        assert_eq!(received, expected);
        assert_eq!(handle.stats().rx_packets, 32);
    }

    #[test]
    fn test_preshared_key_changes_keys() {
        let mut with_psk = config();
        with_psk.peers[0].preshared_key = Some([9u8; 32]);
        assert_ne!(derive_keys(&config()), derive_keys(&with_psk));
    }

    #[test]
    fn test_version() {
        assert!(LoopbackEngine::version().starts_with("loopback-"));
    }
}
