//! Incremental ChaCha20-Poly1305.
//!
//! A TCP frame arrives (or leaves) in pieces whose sizes are chosen by the
//! socket and by the delegate. [`StreamingAead`] keeps the cipher position
//! and the Poly1305 state between those pieces so that each byte is
//! processed exactly once, and the resulting tag is identical to the one
//! produced by a one-shot RFC 8439 seal over the whole frame.

use chacha20::{
    cipher::{KeyIvInit, StreamCipher, StreamCipherSeek},
    ChaCha20,
};
use poly1305::{
    universal_hash::{KeyInit, UniversalHash},
    Block, Poly1305,
};
use subtle::ConstantTimeEq;

use crate::crypto::{AeadKey, Nonce, TAG_SIZE};
use crate::error::{Error, Result};

const BLOCK_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Aad,
    Ciphertext,
}

/// Streaming AEAD context for one frame in one direction.
pub struct StreamingAead {
    cipher: ChaCha20,
    mac: Poly1305,
    pending: [u8; BLOCK_SIZE],
    pending_len: usize,
    phase: Phase,
    aad_len: u64,
    ct_len: u64,
}

impl StreamingAead {
    /// Start a new frame with the given key and nonce.
    pub fn new(key: &AeadKey, nonce: &Nonce) -> Self {
        let mut cipher = ChaCha20::new(key.as_bytes().into(), nonce.as_bytes().into());

        // Block 0 of the keystream keys Poly1305; payload starts at block 1.
        let mut block0 = [0u8; 64];
        cipher.apply_keystream(&mut block0);
        let mac = Poly1305::new(poly1305::Key::from_slice(&block0[..32]));
        block0.iter_mut().for_each(|b| *b = 0);

        Self {
            cipher,
            mac,
            pending: [0u8; BLOCK_SIZE],
            pending_len: 0,
            phase: Phase::Aad,
            aad_len: 0,
            ct_len: 0,
        }
    }

    /// Authenticate additional data. Must precede any payload bytes.
    pub fn update_aad(&mut self, aad: &[u8]) {
        assert_eq!(self.phase, Phase::Aad, "associated data after payload");
        self.absorb(aad);
        self.aad_len += aad.len() as u64;
    }

    /// Encrypt `buf` in place and authenticate the ciphertext.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.begin_ciphertext();
        self.cipher.apply_keystream(buf);
        self.absorb(buf);
        self.ct_len += buf.len() as u64;
    }

    /// Authenticate the ciphertext in `buf` and decrypt it in place.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.begin_ciphertext();
        self.absorb(buf);
        self.ct_len += buf.len() as u64;
        self.cipher.apply_keystream(buf);
    }

    /// Authenticate and discard ciphertext without producing plaintext.
    ///
    /// The keystream moves past the skipped bytes, so a later `decrypt`
    /// lines up with its position in the frame.
    pub fn skip(&mut self, buf: &[u8]) {
        self.begin_ciphertext();
        self.absorb(buf);
        self.ct_len += buf.len() as u64;
        let pos: u64 = self.cipher.current_pos();
        self.cipher.seek(pos + buf.len() as u64);
    }

    /// Finish the frame and return the authentication tag.
    pub fn finalize(mut self) -> [u8; TAG_SIZE] {
        self.begin_ciphertext();
        self.flush_padded();

        let mut lengths = Block::default();
        lengths[..8].copy_from_slice(&self.aad_len.to_le_bytes());
        lengths[8..].copy_from_slice(&self.ct_len.to_le_bytes());
        self.mac.update(&[lengths]);

        let tag = self.mac.clone().finalize();
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        out
    }

    /// Finish the frame and compare against a received tag in constant time.
    pub fn verify(self, tag: &[u8; TAG_SIZE]) -> Result<()> {
        let computed = self.finalize();
        if computed[..].ct_eq(&tag[..]).into() {
            Ok(())
        } else {
            Err(Error::Authentication)
        }
    }

    fn begin_ciphertext(&mut self) {
        if self.phase == Phase::Aad {
            self.flush_padded();
            self.phase = Phase::Ciphertext;
        }
    }

    fn absorb(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let n = (BLOCK_SIZE - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + n].copy_from_slice(&data[..n]);
            self.pending_len += n;
            data = &data[n..];
            if self.pending_len < BLOCK_SIZE {
                return;
            }
            let block = Block::clone_from_slice(&self.pending);
            self.mac.update(&[block]);
            self.pending_len = 0;
        }

        let full = data.len() - data.len() % BLOCK_SIZE;
        for chunk in data[..full].chunks_exact(BLOCK_SIZE) {
            self.mac.update(&[Block::clone_from_slice(chunk)]);
        }

        let rest = &data[full..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn flush_padded(&mut self) {
        if self.pending_len > 0 {
            self.pending[self.pending_len..].fill(0);
            let block = Block::clone_from_slice(&self.pending);
            self.mac.update(&[block]);
            self.pending_len = 0;
        }
    }
}

impl Drop for StreamingAead {
    fn drop(&mut self) {
        self.pending.fill(0);
    }
}
