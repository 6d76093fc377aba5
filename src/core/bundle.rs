//! Bundle framing.
//!
//! ## Wire Format
//! ```text
//! [Magic(16)] [Timestamp(8)] [TotalLength(4)] [ConnType(2)] [MessageCount(2)]
//! [Encoding(1)] [Compression(1)] [Reserved(2)] [DecodedBodyLength(4)] [Body(N)]
//! ```
//! All fields are little-endian with no padding. `TotalLength` includes the
//! 40-byte header.

use bytes::{Buf, BufMut};

use crate::error::{constants, ProtocolError, Result};
use crate::utils::compression::CompressionKind;

/// Size of the fixed bundle header
pub const BUNDLE_HEADER_SIZE: usize = 40;

/// Size of the fixed message header that starts every message
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Magic of a regular game bundle
pub const MAGIC_CONSTANT: [u8; 16] = [
    0x52, 0x52, 0xa0, 0x41, 0xff, 0x5d, 0x46, 0xe2, 0x7f, 0x2a, 0x64, 0x4d, 0x7b, 0x99, 0xc4, 0x75,
];

/// Magic of a keep-alive-only bundle
pub const MAGIC_EMPTY: [u8; 16] = [0u8; 16];

const MAGICS: [&[u8; 16]; 2] = [&MAGIC_CONSTANT, &MAGIC_EMPTY];

/// Decoded bundle header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleHeader {
    pub magic: [u8; 16],
    /// Milliseconds since the Unix epoch, as stamped by the sender
    pub timestamp_ms: i64,
    pub total_length: u32,
    pub conn_type: u16,
    pub message_count: u16,
    pub encoding: u8,
    pub compression: u8,
    pub reserved: u16,
    pub decoded_body_length: u32,
}

impl BundleHeader {
    /// Parse the first 40 bytes of `buf`.
    ///
    /// # Errors
    /// Returns `ProtocolError::Framing` if the buffer is shorter than a header
    /// or does not start with a recognised magic.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < BUNDLE_HEADER_SIZE {
            return Err(ProtocolError::Framing(
                constants::ERR_TRUNCATED_HEADER.to_string(),
            ));
        }
        if !is_magic(buf) {
            return Err(ProtocolError::Framing(
                constants::ERR_INVALID_MAGIC.to_string(),
            ));
        }

        let mut magic = [0u8; 16];
        magic.copy_from_slice(&buf[..16]);
        let mut cursor = &buf[16..BUNDLE_HEADER_SIZE];

        Ok(Self {
            magic,
            timestamp_ms: cursor.get_i64_le(),
            total_length: cursor.get_u32_le(),
            conn_type: cursor.get_u16_le(),
            message_count: cursor.get_u16_le(),
            encoding: cursor.get_u8(),
            compression: cursor.get_u8(),
            reserved: cursor.get_u16_le(),
            decoded_body_length: cursor.get_u32_le(),
        })
    }

    /// Append the 40-byte wire representation to `dst`.
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_slice(&self.magic);
        dst.put_i64_le(self.timestamp_ms);
        dst.put_u32_le(self.total_length);
        dst.put_u16_le(self.conn_type);
        dst.put_u16_le(self.message_count);
        dst.put_u8(self.encoding);
        dst.put_u8(self.compression);
        dst.put_u16_le(self.reserved);
        dst.put_u32_le(self.decoded_body_length);
    }

    pub fn to_bytes(&self) -> [u8; BUNDLE_HEADER_SIZE] {
        let mut out = [0u8; BUNDLE_HEADER_SIZE];
        let mut cursor = &mut out[..];
        self.write_to(&mut cursor);
        out
    }

    pub fn compression_kind(&self) -> Result<CompressionKind> {
        CompressionKind::from_byte(self.compression)
    }

    /// Body length on the wire, as declared by `total_length`.
    pub fn body_length(&self) -> usize {
        (self.total_length as usize).saturating_sub(BUNDLE_HEADER_SIZE)
    }
}

/// Whether `buf` starts with one of the recognised magics.
#[inline]
pub fn is_magic(buf: &[u8]) -> bool {
    buf.len() >= 16 && MAGICS.iter().any(|magic| buf[..16] == magic[..])
}

/// Number of leading bytes that cannot be the start of a bundle.
///
/// Scanning stops at the first full magic, or at a trailing run of bytes that
/// is a prefix of a magic and may complete once more data arrives. Returns
/// `buf.len()` when every byte is noise.
pub fn leading_noise_len(buf: &[u8]) -> usize {
    for start in 0..buf.len() {
        let rest = &buf[start..];
        let candidate = MAGICS.iter().any(|magic| {
            let n = rest.len().min(magic.len());
            rest[..n] == magic[..n]
        });
        if candidate {
            return start;
        }
    }
    buf.len()
}

/// Split a decoded bundle body into message slices.
///
/// The body is walked until exhausted, each message's `u32` length prefix
/// giving its extent. `expected_count` sizes the result; the declared count
/// is not otherwise enforced.
///
/// # Errors
/// Returns `ProtocolError::Framing` for a zero-length message, a message
/// shorter than its own header, or a message running past the end of the body.
pub fn split_messages(expected_count: usize, body: &[u8]) -> Result<Vec<&[u8]>> {
    let mut messages = Vec::with_capacity(expected_count);
    let mut offset = 0usize;

    while offset < body.len() {
        let rest = &body[offset..];
        if rest.len() < 4 {
            return Err(ProtocolError::Framing(
                constants::ERR_TRUNCATED_MESSAGE.to_string(),
            ));
        }
        let length = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if length == 0 {
            return Err(ProtocolError::Framing(
                constants::ERR_ZERO_LENGTH_MESSAGE.to_string(),
            ));
        }
        if length > rest.len() {
            return Err(ProtocolError::Framing(
                constants::ERR_MESSAGE_OVERRUN.to_string(),
            ));
        }
        if length < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::Framing(
                constants::ERR_TRUNCATED_MESSAGE.to_string(),
            ));
        }

        messages.push(&rest[..length]);
        offset += length;
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BundleHeader {
        BundleHeader {
            magic: MAGIC_CONSTANT,
            timestamp_ms: 1_700_000_000_123,
            total_length: 72,
            conn_type: 1,
            message_count: 2,
            encoding: 1,
            compression: 0,
            reserved: 0,
            decoded_body_length: 32,
        }
    }

    fn message(length: u32) -> Vec<u8> {
        let mut buf = vec![0u8; length as usize];
        buf[..4].copy_from_slice(&length.to_le_bytes());
        buf
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_header_layout() {
        let bytes = sample_header().to_bytes();
        assert_eq!(&bytes[..16], &MAGIC_CONSTANT);
        assert_eq!(&bytes[16..24], &1_700_000_000_123i64.to_le_bytes());
        assert_eq!(&bytes[24..28], &72u32.to_le_bytes());
        assert_eq!(&bytes[30..32], &2u16.to_le_bytes());
        assert_eq!(bytes[33], 0);
        assert_eq!(&bytes[36..40], &32u32.to_le_bytes());

        assert_eq!(BundleHeader::parse(&bytes).unwrap(), sample_header());
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] ^= 0xff;
        assert!(matches!(
            BundleHeader::parse(&bytes),
            Err(ProtocolError::Framing(_))
        ));
        assert!(BundleHeader::parse(&bytes[..39]).is_err());
    }

    #[test]
    fn test_empty_magic_is_recognised() {
        let mut header = sample_header();
        header.magic = MAGIC_EMPTY;
        assert!(BundleHeader::parse(&header.to_bytes()).is_ok());
    }

    #[test]
    fn test_leading_noise() {
        let mut buf = vec![1, 2, 3];
        buf.extend_from_slice(&MAGIC_CONSTANT);
        assert_eq!(leading_noise_len(&buf), 3);
        assert_eq!(leading_noise_len(&[1, 2, 3]), 3);
        assert_eq!(leading_noise_len(&MAGIC_CONSTANT), 0);
        // a partial magic at the tail may still complete
        assert_eq!(leading_noise_len(&[9, 9, 0x52, 0x52]), 2);
        assert_eq!(leading_noise_len(&[9, 0, 0]), 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_split_messages() {
        let mut body = message(16);
        body.extend(message(24));
        let parts = split_messages(2, &body).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 16);
        assert_eq!(parts[1].len(), 24);
        assert!(split_messages(0, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_split_rejects_overrun() {
        let mut body = message(16);
        body[..4].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(
            split_messages(1, &body),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn test_split_rejects_zero_and_short_messages() {
        assert!(split_messages(1, &[0u8; 16]).is_err());
        assert!(split_messages(1, &message(8)).is_err());
        assert!(split_messages(1, &[16, 0]).is_err());
    }
}
