//! Secure random number generation.
//!
//! Accessory key salts come from the operating system's entropy source.

use rand_core::{OsRng, RngCore};

use super::SALT_SIZE;

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Fresh accessory key salt for one TCP setup.
    pub fn key_salt() -> [u8; SALT_SIZE] {
        Self::bytes()
    }
}
