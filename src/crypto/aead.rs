//! Authenticated Encryption with Associated Data (AEAD).
//!
//! ChaCha20-Poly1305 with a 96-bit nonce built from a 64-bit frame counter.
//! [`Aead`] seals or opens a whole frame at once; the incremental variant
//! used while a frame trickles in over a socket lives in `stream.rs`.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A nonce for AEAD operations.
///
/// The first 4 bytes are zero and the last 8 bytes carry the little-endian
/// frame counter of one stream direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from a 64-bit counter value.
    pub fn new(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..12].copy_from_slice(&counter.to_le_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Get the current counter value.
    pub fn counter(&self) -> u64 {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[4..12]);
        u64::from_le_bytes(counter)
    }

    /// Advance to the next counter value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonceExhausted`] instead of wrapping around.
    pub fn increment(&mut self) -> Result<()> {
        let next = self.counter().checked_add(1).ok_or(Error::NonceExhausted)?;
        self.0[4..12].copy_from_slice(&next.to_le_bytes());
        Ok(())
    }
}

impl From<u64> for Nonce {
    fn from(counter: u64) -> Self {
        Self::new(counter)
    }
}

/// One-shot ChaCha20-Poly1305 AEAD cipher.
pub struct Aead {
    cipher: ChaCha20Poly1305,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt plaintext with associated authenticated data.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        self.cipher
            .encrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext || tag with associated authenticated data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the tag does not verify.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        self.cipher
            .decrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::Authentication)
    }

    /// Decrypt a detached ciphertext in place, verifying `tag`.
    ///
    /// The buffer is left untouched when authentication fails.
    pub fn decrypt_detached(
        &self,
        nonce: &Nonce,
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<()> {
        self.cipher
            .decrypt_in_place_detached(nonce.as_bytes().into(), aad, buffer, tag.into())
            .map_err(|_| Error::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AeadKey {
        AeadKey::from_bytes([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
            0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
        ])
    }

    #[test]
    fn test_encrypt_decrypt() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::new(0);

        let plaintext = b"hello, world\0";
        let aad = [0x01, 0x00, 0x00, 0x0d];

        let ciphertext = aead.encrypt(&nonce, plaintext, &aad).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = aead.decrypt(&nonce, &ciphertext, &aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_tampered_header_fails() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::new(3);

        let ciphertext = aead.encrypt(&nonce, b"payload", &[0x01, 0, 0, 7]).unwrap();
        let result = aead.decrypt(&nonce, &ciphertext, &[0x01, 0, 0, 8]);

        assert!(matches!(result, Err(Error::Authentication)));
    }

    #[test]
    fn test_decrypt_detached_leaves_buffer_on_failure() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::new(0);

        let sealed = aead.encrypt(&nonce, b"secret data", b"").unwrap();
        let (body, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag);

        let mut wrong = body.to_vec();
        let wrong_aead = Aead::new(&AeadKey::from_bytes([0x42u8; KEY_SIZE]));
        assert!(wrong_aead
            .decrypt_detached(&nonce, b"", &mut wrong, &tag_bytes)
            .is_err());
        assert_eq!(wrong, body);

        let mut right = body.to_vec();
        aead.decrypt_detached(&nonce, b"", &mut right, &tag_bytes)
            .unwrap();
        assert_eq!(right, b"secret data");
    }

    #[test]
    fn test_nonce_layout_and_increment() {
        let mut nonce = Nonce::new(0);
        assert_eq!(nonce.as_bytes(), &[0u8; NONCE_SIZE]);

        nonce.increment().unwrap();
        assert_eq!(nonce.counter(), 1);
        assert_eq!(nonce.as_bytes()[4], 1);

        let nonce = Nonce::new(0x0102);
        assert_eq!(&nonce.as_bytes()[..6], &[0, 0, 0, 0, 0x02, 0x01]);
    }

    #[test]
    fn test_nonce_exhaustion() {
        let mut nonce = Nonce::new(u64::MAX);
        assert!(matches!(nonce.increment(), Err(Error::NonceExhausted)));
        assert_eq!(nonce.counter(), u64::MAX);
    }
}
