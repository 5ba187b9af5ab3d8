//! Data Stream frame header.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────────────┬──────────────┬───────────────┐
//! │ Type (1) │ Payload Length (3, BE)   │ Payload      │ Auth Tag (16) │
//! └──────────┴──────────────────────────┴──────────────┴───────────────┘
//! ```
//! The tag is only present on encrypted (TCP) frames; the header is the AAD.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::{AUTH_TAG_LEN, FRAME_HEADER_LEN, MAX_PAYLOAD_BYTES};

/// Frame types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Plaintext payload, carried inside an already secure HAP session
    Unencrypted = 0x00,
    /// ChaCha20-Poly1305 payload followed by a 16-byte tag
    Encrypted = 0x01,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(FrameType::Unencrypted),
            0x01 => Ok(FrameType::Encrypted),
            _ => Err(Error::frame(format!("unknown frame type: 0x{:02x}", value))),
        }
    }
}

/// A decoded 4-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload length in bytes, excluding the tag
    pub length: u32,
}

impl FrameHeader {
    /// Create a header, checking the payload limit.
    pub fn new(frame_type: FrameType, length: usize) -> Result<Self> {
        if length > MAX_PAYLOAD_BYTES {
            return Err(Error::frame(format!("unsupported length: {}", length)));
        }
        Ok(Self {
            frame_type,
            length: length as u32,
        })
    }

    /// Serialize to the 4 wire bytes.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let len = self.length.to_be_bytes();
        [self.frame_type as u8, len[1], len[2], len[3]]
    }

    /// Append the header to a buffer.
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.to_bytes());
    }

    /// Parse the first 4 bytes of `data`.
    ///
    /// Rejects unknown types and lengths above [`MAX_PAYLOAD_BYTES`].
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(Error::Buffer {
                expected: FRAME_HEADER_LEN,
                actual: data.len(),
            });
        }

        let frame_type = FrameType::try_from(data.get_u8())?;
        let length = read_u24(data);
        if length as usize > MAX_PAYLOAD_BYTES {
            return Err(Error::frame(format!("unsupported length: {}", length)));
        }

        Ok(Self { frame_type, length })
    }

    /// Total size on the wire, including the tag for encrypted frames.
    pub fn wire_size(&self) -> usize {
        let tag = match self.frame_type {
            FrameType::Unencrypted => 0,
            FrameType::Encrypted => AUTH_TAG_LEN,
        };
        FRAME_HEADER_LEN + self.length as usize + tag
    }
}

/// Read a big-endian 24-bit length.
pub fn read_u24(data: &[u8]) -> u32 {
    u32::from_be_bytes([0, data[0], data[1], data[2]])
}

/// Build a complete unencrypted frame.
pub fn encode_unencrypted(payload: &[u8]) -> Result<Bytes> {
    let header = FrameHeader::new(FrameType::Unencrypted, payload.len())?;
    let mut buf = BytesMut::with_capacity(header.wire_size());
    header.put(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(FrameType::Unencrypted, 13).unwrap();
        assert_eq!(header.to_bytes(), [0x00, 0x00, 0x00, 0x0d]);

        let header = FrameHeader::new(FrameType::Encrypted, 0x012345).unwrap();
        assert_eq!(header.to_bytes(), [0x01, 0x01, 0x23, 0x45]);
        assert_eq!(FrameHeader::parse(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_max_length() {
        assert!(FrameHeader::new(FrameType::Encrypted, MAX_PAYLOAD_BYTES).is_ok());
        assert!(FrameHeader::new(FrameType::Encrypted, MAX_PAYLOAD_BYTES + 1).is_err());

        // 0xffffff exceeds the limit even though it fits in 24 bits.
        assert!(matches!(
            FrameHeader::parse(&[0x01, 0xff, 0xff, 0xff]),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            FrameHeader::parse(&[0x00, 0x00]),
            Err(Error::Buffer { expected: 4, actual: 2 })
        ));
        assert!(FrameHeader::parse(&[0x02, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_encode_unencrypted() {
        let frame = encode_unencrypted(b"hello, world\0").unwrap();
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x00, 0x0d]);
        assert_eq!(&frame[4..], b"hello, world\0");
    }

    #[test]
    fn test_wire_size() {
        let header = FrameHeader::new(FrameType::Encrypted, 10).unwrap();
        assert_eq!(header.wire_size(), 4 + 10 + 16);
    }
}
