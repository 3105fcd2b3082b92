//! Cryptographic primitives used by the loopback engine and key tooling
//!
//! - ChaCha20-Poly1305 transport sealing (aead)
//! - HMAC-BLAKE2s key derivation (blake2s)
//! - X25519 keys and Diffie-Hellman (x25519)

pub mod aead;
pub mod blake2s;
pub mod x25519;
