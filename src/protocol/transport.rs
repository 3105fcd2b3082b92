//! Transport sealing for WireGuard data packets
//!
//! Seals IP packets into type 4 messages with ChaCha20-Poly1305 and opens
//! them again behind a sliding anti-replay window.

use crate::crypto::aead;
use crate::error::{CryptoError, ExtensionError, ProtocolError};
use crate::protocol::messages::TransportHeader;

/// Counter limit after which a key must not be used
/// (REJECT_AFTER_MESSAGES = 2^64 - 2^13 - 1)
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 8192;

/// Size of the anti-replay window in packets
const WINDOW_SIZE: u64 = 128;

/// Seal an IP packet into a complete transport message
pub fn encrypt_packet(
    key: &[u8; 32],
    counter: u64,
    receiver_index: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, ExtensionError> {
    if counter >= REJECT_AFTER_MESSAGES {
        return Err(ProtocolError::SessionExpired.into());
    }

    let ciphertext = aead::encrypt(key, counter, plaintext, &[])?;
    Ok(TransportHeader::build_message(receiver_index, counter, &ciphertext))
}

/// Open a transport message, returning (header, plaintext)
pub fn decrypt_packet(
    key: &[u8; 32],
    packet: &[u8],
) -> Result<(TransportHeader, Vec<u8>), ExtensionError> {
    if packet.len() < TransportHeader::MIN_SIZE {
        return Err(ProtocolError::InvalidMessageLength {
            expected: TransportHeader::MIN_SIZE,
            got: packet.len(),
        }
        .into());
    }

    let header = TransportHeader::from_bytes(packet)?;
    if header.counter >= REJECT_AFTER_MESSAGES {
        return Err(CryptoError::Decryption.into());
    }

    let plaintext = aead::decrypt(key, header.counter, TransportHeader::payload(packet), &[])?;
    Ok((header, plaintext))
}

/// Sliding-window bitmap of received counters.
///
/// Bit N of `bitmap` stands for counter `highest - N`.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: u64,
    bitmap: u128,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `counter` if it is fresh and record it
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if self.bitmap == 0 {
            self.highest = counter;
            self.bitmap = 1;
            return true;
        }

        if counter > self.highest {
            let shift = counter - self.highest;
            self.bitmap = if shift >= WINDOW_SIZE {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = counter;
            return true;
        }

        let diff = self.highest - counter;
        if diff >= WINDOW_SIZE {
            return false;
        }

        let bit = 1u128 << diff;
        if self.bitmap & bit != 0 {
            false
        } else {
            self.bitmap |= bit;
            true
        }
    }
}

/// Keys, counter and replay window for one direction pair
#[derive(Debug, Clone)]
pub struct TransportState {
    pub sending_key: [u8; 32],
    pub receiving_key: [u8; 32],
    pub sending_counter: u64,
    pub replay_window: ReplayWindow,
}

impl TransportState {
    pub fn new(sending_key: [u8; 32], receiving_key: [u8; 32]) -> Self {
        Self {
            sending_key,
            receiving_key,
            sending_counter: 0,
            replay_window: ReplayWindow::new(),
        }
    }

    /// Seal a packet with the next counter
    pub fn encrypt(&mut self, receiver_index: u32, plaintext: &[u8]) -> Result<Vec<u8>, ExtensionError> {
        let message = encrypt_packet(&self.sending_key, self.sending_counter, receiver_index, plaintext)?;
        self.sending_counter += 1;
        Ok(message)
    }

    /// Open a packet, rejecting replays
    pub fn decrypt(&mut self, packet: &[u8]) -> Result<Vec<u8>, ExtensionError> {
        let (header, plaintext) = decrypt_packet(&self.receiving_key, packet)?;

        // Only authenticated counters may move the window
        if !self.replay_window.check_and_update(header.counter) {
            return Err(ProtocolError::ReplayDetected {
                counter: header.counter,
            }
            .into());
        }

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [42u8; 32];
        let plaintext = b"Hello, WireGuard!";

        let encrypted = encrypt_packet(&key, 0, 12345, plaintext).unwrap();
        assert_eq!(encrypted[0], 4);
        assert_eq!(&encrypted[4..8], &12345u32.to_le_bytes());

        let (header, decrypted) = decrypt_packet(&key, &encrypted).unwrap();
        assert_eq!(header.counter, 0);
        assert_eq!(header.receiver_index, 12345);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_expired_counter() {
        let result = encrypt_packet(&[0u8; 32], REJECT_AFTER_MESSAGES, 1, b"late");
        assert!(matches!(
            result,
            Err(ExtensionError::Protocol(ProtocolError::SessionExpired))
        ));
    }

    #[test]
    fn test_truncated_message() {
        let result = decrypt_packet(&[0u8; 32], &[4, 0, 0, 0, 1, 0, 0, 0]);
        assert!(matches!(
            result,
            Err(ExtensionError::Protocol(ProtocolError::InvalidMessageLength { .. }))
        ));
    }

    #[test]
    fn test_replay_window_basic() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(0));
        assert!(!window.check_and_update(0));

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(5));
        assert!(window.check_and_update(10));

        assert!(!window.check_and_update(5));
        assert!(!window.check_and_update(10));
    }

    #[test]
    fn test_replay_window_out_of_order() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(5));
        assert!(window.check_and_update(3));
        assert!(window.check_and_update(7));
        assert!(window.check_and_update(4));

        assert!(!window.check_and_update(3));
        assert!(!window.check_and_update(4));
        assert!(!window.check_and_update(7));

        // 6 was never seen
        assert!(window.check_and_update(6));
    }

    #[test]
    fn test_replay_window_outside_window() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(200));
        assert!(!window.check_and_update(0));
        assert!(!window.check_and_update(50));
        assert!(window.check_and_update(200 - WINDOW_SIZE + 1));
    }

    #[test]
    fn test_transport_state_pair() {
        let mut sender = TransportState::new([1u8; 32], [2u8; 32]);
        let mut receiver = TransportState::new([2u8; 32], [1u8; 32]);

        let msg1 = sender.encrypt(100, b"packet 1").unwrap();
        let msg2 = sender.encrypt(100, b"packet 2").unwrap();
        assert_eq!(sender.sending_counter, 2);

        assert_eq!(receiver.decrypt(&msg1).unwrap(), b"packet 1");
        assert_eq!(receiver.decrypt(&msg2).unwrap(), b"packet 2");

        assert!(matches!(
            receiver.decrypt(&msg1),
            Err(ExtensionError::Protocol(ProtocolError::ReplayDetected { counter: 0 }))
        ));
    }

    #[test]
    fn test_forged_packet_does_not_move_window() {
        let mut sender = TransportState::new([1u8; 32], [0u8; 32]);
        let mut receiver = TransportState::new([0u8; 32], [1u8; 32]);

        let mut forged = sender.encrypt(7, b"data").unwrap();
        let last = forged.len() - 1;
        forged[last] ^= 0xff;
        assert!(receiver.decrypt(&forged).is_err());

        // The genuine packet with the same counter still opens
        sender.sending_counter = 0;
        let genuine = sender.encrypt(7, b"data").unwrap();
        assert_eq!(receiver.decrypt(&genuine).unwrap(), b"data");
    }
}
