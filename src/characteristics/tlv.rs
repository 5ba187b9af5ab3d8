//! TLV8 codec.
//!
//! Wire format of one item:
//! ```text
//! ┌──────────┬────────────┬───────────────────┐
//! │ Type (1) │ Length (1) │ Value (0..=255)   │
//! └──────────┴────────────┴───────────────────┘
//! ```
//! Values longer than 255 bytes are split into consecutive fragments of the
//! same type; every fragment but the last is exactly 255 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Largest value carried by a single fragment.
pub const MAX_FRAGMENT_LEN: usize = 255;

/// A decoded item with its fragments joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u8,
    pub value: Vec<u8>,
}

/// Decode all items of `data`.
pub fn decode(mut data: &[u8]) -> Result<Vec<Tlv>> {
    let mut items: Vec<Tlv> = Vec::new();
    let mut continues = false;

    while data.has_remaining() {
        if data.remaining() < 2 {
            return Err(Error::invalid_data("truncated TLV header"));
        }
        let tlv_type = data.get_u8();
        let len = data.get_u8() as usize;
        if data.remaining() < len {
            return Err(Error::invalid_data(format!(
                "TLV 0x{:02x} declares {} bytes, {} available",
                tlv_type,
                len,
                data.remaining()
            )));
        }
        let value = &data[..len];

        match items.last_mut() {
            Some(last) if continues && last.tlv_type == tlv_type => last.value.extend_from_slice(value),
            _ => items.push(Tlv {
                tlv_type,
                value: value.to_vec(),
            }),
        }
        continues = len == MAX_FRAGMENT_LEN;
        data.advance(len);
    }

    Ok(items)
}

/// Pick the values of `types` out of `data`.
///
/// Items of other types are skipped. A requested type that appears twice is
/// rejected.
pub fn get_all<const N: usize>(data: &[u8], types: [u8; N]) -> Result<[Option<Vec<u8>>; N]> {
    let mut values: [Option<Vec<u8>>; N] = std::array::from_fn(|_| None);

    for item in decode(data)? {
        let Some(i) = types.iter().position(|&t| t == item.tlv_type) else {
            tracing::debug!("Ignoring unexpected TLV item 0x{:02x} ({} bytes).", item.tlv_type, item.value.len());
            continue;
        };
        if values[i].is_some() {
            return Err(Error::invalid_data(format!("duplicate TLV item 0x{:02x}", item.tlv_type)));
        }
        values[i] = Some(item.value);
    }

    Ok(values)
}

/// Read a little-endian unsigned integer of at most `max_len` bytes.
pub fn read_uint(value: &[u8], max_len: usize) -> Option<u64> {
    if value.len() > max_len || value.len() > 8 {
        return None;
    }
    Some(
        value
            .iter()
            .rev()
            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte)),
    )
}

/// Bounded TLV8 encoder.
#[derive(Debug)]
pub struct TlvWriter {
    buf: BytesMut,
    limit: usize,
}

impl Default for TlvWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Writer that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append one item, fragmenting long values.
    ///
    /// # Errors
    ///
    /// `OutOfResources` if the item does not fit; nothing is written then.
    pub fn append(&mut self, tlv_type: u8, value: &[u8]) -> Result<()> {
        let fragments = ((value.len() + MAX_FRAGMENT_LEN - 1) / MAX_FRAGMENT_LEN).max(1);
        let needed = value.len() + 2 * fragments;
        if self.limit.saturating_sub(self.buf.len()) < needed {
            return Err(Error::OutOfResources);
        }

        self.buf.reserve(needed);
        if value.is_empty() {
            self.buf.put_u8(tlv_type);
            self.buf.put_u8(0);
            return Ok(());
        }
        for fragment in value.chunks(MAX_FRAGMENT_LEN) {
            self.buf.put_u8(tlv_type);
            self.buf.put_u8(fragment.len() as u8);
            self.buf.put_slice(fragment);
        }
        Ok(())
    }

    /// Append an item whose value is itself a TLV8 list.
    pub fn append_nested(&mut self, tlv_type: u8, build: impl FnOnce(&mut TlvWriter) -> Result<()>) -> Result<()> {
        let mut nested = TlvWriter::new();
        build(&mut nested)?;
        self.append(tlv_type, &nested.buf)
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
