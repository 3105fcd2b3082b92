//! X25519 keys for WireGuard
//!
//! Key generation, public key derivation and Diffie-Hellman over Curve25519.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Generate a new X25519 keypair
///
/// Returns (private_key, public_key)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Shared secret from our private key and their public key
pub fn dh(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(*public_key);
    secret.diffie_hellman(&public).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let (private, public) = generate_keypair();
        assert!(!public.iter().all(|&b| b == 0));
        assert_eq!(public_key(&private), public);
    }

    #[test]
    fn test_dh_shared_secret() {
        let (alice_private, alice_public) = generate_keypair();
        let (bob_private, bob_public) = generate_keypair();

        assert_eq!(dh(&alice_private, &bob_public), dh(&bob_private, &alice_public));
    }

    #[test]
    fn test_public_key_derivation() {
        // RFC 7748 section 6.1
        let private = [
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ];

        let expected_public = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];

        assert_eq!(public_key(&private), expected_public);
    }
}
