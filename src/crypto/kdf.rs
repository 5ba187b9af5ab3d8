//! Key Derivation Functions.
//!
//! Uses HKDF with SHA-512 to derive the two directional Data Stream keys
//! from the HAP session's shared secret.

use hkdf::Hkdf as HkdfImpl;
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{AeadKey, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};

/// Info string for the accessory-to-controller key.
pub const READ_KEY_INFO: &[u8] = b"HDS-Read-Encryption-Key";

/// Info string for the controller-to-accessory key.
pub const WRITE_KEY_INFO: &[u8] = b"HDS-Write-Encryption-Key";

/// HKDF key derivation using SHA-512.
pub struct Hkdf {
    prk: HkdfImpl<Sha512>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    ///
    /// # Arguments
    ///
    /// * `salt` - Optional salt
    /// * `ikm` - Input keying material (the session's shared secret)
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand the PRK to produce output keying material.
    pub fn expand(&self, info: &[u8], len: usize) -> Result<Vec<u8>> {
        let mut okm = vec![0u8; len];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(okm)
    }

    /// Expand to a fixed-size array.
    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N]> {
        let mut okm = [0u8; N];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(okm)
    }

    /// Derive an AEAD key.
    pub fn derive_aead_key(&self, info: &[u8]) -> Result<AeadKey> {
        let mut key_bytes = self.expand_fixed::<KEY_SIZE>(info)?;
        let key = AeadKey::from_bytes(key_bytes);
        key_bytes.zeroize();
        Ok(key)
    }
}

/// Directional keys of one TCP Data Stream.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StreamKeys {
    accessory_to_controller: [u8; KEY_SIZE],
    controller_to_accessory: [u8; KEY_SIZE],
}

impl StreamKeys {
    /// Derive both directional keys.
    ///
    /// The HKDF salt is `controller_salt || accessory_salt`; the input keying
    /// material is the shared secret of the HAP session that set up the stream.
    pub fn derive(
        shared_secret: &[u8],
        controller_salt: &[u8; SALT_SIZE],
        accessory_salt: &[u8; SALT_SIZE],
    ) -> Result<Self> {
        let mut salt = [0u8; 2 * SALT_SIZE];
        salt[..SALT_SIZE].copy_from_slice(controller_salt);
        salt[SALT_SIZE..].copy_from_slice(accessory_salt);

        let hkdf = Hkdf::new(Some(&salt), shared_secret);
        salt.zeroize();

        Ok(Self {
            accessory_to_controller: hkdf.expand_fixed(READ_KEY_INFO)?,
            controller_to_accessory: hkdf.expand_fixed(WRITE_KEY_INFO)?,
        })
    }

    /// Key for frames sent by the accessory.
    pub fn accessory_to_controller(&self) -> AeadKey {
        AeadKey::from_bytes(self.accessory_to_controller)
    }

    /// Key for frames sent by the controller.
    pub fn controller_to_accessory(&self) -> AeadKey {
        AeadKey::from_bytes(self.controller_to_accessory)
    }
}
