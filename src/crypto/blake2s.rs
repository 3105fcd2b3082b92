//! HMAC-BLAKE2s key derivation
//!
//! The WireGuard KDF: HMAC with BLAKE2s-256 in the standard RFC 2104
//! construction, chained to produce multiple 32-byte outputs.

use blake2::{digest::FixedOutput, Blake2s256};
use hmac::{Mac, SimpleHmac};

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 output
pub const HASH_LEN: usize = 32;

/// HMAC-BLAKE2s over `data`
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = <HmacBlake2s as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize_fixed().into()
}

/// KDF2: two chained 32-byte keys from `input` under `key`
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = hmac(key, input);

    let t1 = hmac(&temp, &[0x01]);

    let mut t2_input = [0u8; HASH_LEN + 1];
    t2_input[..HASH_LEN].copy_from_slice(&t1);
    t2_input[HASH_LEN] = 0x02;
    let t2 = hmac(&temp, &t2_input);

    (t1, t2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf2_outputs_differ() {
        let (a, b) = kdf2(&[0u8; 32], b"input");
        assert_ne!(a, b);
        assert_ne!(a, [0u8; 32]);
    }

    #[test]
    fn test_kdf2_is_deterministic() {
        assert_eq!(kdf2(&[1u8; 32], b"x"), kdf2(&[1u8; 32], b"x"));
        assert_ne!(kdf2(&[1u8; 32], b"x"), kdf2(&[2u8; 32], b"x"));
    }

    #[test]
    fn test_hmac_key_lengths() {
        // Long keys are hashed first, so both must work
        assert_eq!(hmac(&[0u8; 16], b"data").len(), HASH_LEN);
        assert_eq!(hmac(&[0u8; 128], b"data").len(), HASH_LEN);
    }
}
