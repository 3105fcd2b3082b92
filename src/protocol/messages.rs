//! WireGuard message wire formats
//!
//! ```text
//! type(1) | reserved(3) | receiver_index(4) | counter(8, LE) | payload
//! ```

use crate::error::ProtocolError;

/// WireGuard message types.
///
/// Handshake and cookie types are only recognised so they can be rejected;
/// key exchange belongs to the engine, not this crate.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// Header of a transport data message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    /// Size of the transport header (not including encrypted payload)
    pub const SIZE: usize = 16;

    /// Minimum size of a transport message (header + auth tag)
    pub const MIN_SIZE: usize = Self::SIZE + 16;

    /// Build a transport message around an encrypted payload
    pub fn build_message(receiver_index: u32, counter: u64, encrypted_payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + encrypted_payload.len());

        buf.push(MessageType::TransportData as u8);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(encrypted_payload);

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let Some(header) = data.get(..Self::SIZE) else {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        };

        if MessageType::try_from(header[0])? != MessageType::TransportData {
            return Err(ProtocolError::InvalidMessageType { msg_type: header[0] });
        }

        let mut index = [0u8; 4];
        index.copy_from_slice(&header[4..8]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&header[8..16]);

        Ok(Self {
            receiver_index: u32::from_le_bytes(index),
            counter: u64::from_le_bytes(counter),
        })
    }

    /// Encrypted payload of a transport message
    pub fn payload(data: &[u8]) -> &[u8] {
        data.get(Self::SIZE..).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_build() {
        let payload = vec![0xAA; 100];
        let msg = TransportHeader::build_message(42, 1234, &payload);

        assert_eq!(msg[0], 4);
        assert_eq!(&msg[1..4], &[0, 0, 0]);
        assert_eq!(msg.len(), TransportHeader::SIZE + payload.len());

        let header = TransportHeader::from_bytes(&msg).unwrap();
        assert_eq!(header.receiver_index, 42);
        assert_eq!(header.counter, 1234);
        assert_eq!(TransportHeader::payload(&msg), &payload[..]);
    }

    #[test]
    fn test_rejects_handshake_messages() {
        let mut data = [0u8; 148];
        data[0] = MessageType::HandshakeInitiation as u8;
        assert!(matches!(
            TransportHeader::from_bytes(&data),
            Err(ProtocolError::InvalidMessageType { msg_type: 1 })
        ));
    }

    #[test]
    fn test_invalid_message_type() {
        let data = [99u8; 100];
        assert!(TransportHeader::from_bytes(&data).is_err());
        assert!(MessageType::try_from(0).is_err());
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(
            TransportHeader::from_bytes(&[4, 0, 0]),
            Err(ProtocolError::InvalidMessageLength { expected: 16, got: 3 })
        ));
        assert!(TransportHeader::payload(&[4, 0]).is_empty());
    }
}
