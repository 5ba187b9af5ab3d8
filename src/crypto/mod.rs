//! Cryptographic primitives for HomeKit Data Stream.
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD, one-shot and incremental
//! - HKDF-SHA512 derivation of the directional stream keys
//! - Secure random number generation for key salts
//!
//! All secret material is zeroized on drop.

mod aead;
mod kdf;
mod random;
mod stream;

pub use aead::{Aead, AeadKey, Nonce};
pub use kdf::{Hkdf, StreamKeys, READ_KEY_INFO, WRITE_KEY_INFO};
pub use random::SecureRandom;
pub use stream::StreamingAead;

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of a controller or accessory key salt
pub const SALT_SIZE: usize = 32;
