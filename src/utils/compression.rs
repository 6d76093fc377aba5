//! Bundle body compression.
//!
//! Bundles declare one of three body encodings. `None` is passed through,
//! `Deflate` is a zlib stream handled by [`DeflateCompressor`], and the
//! proprietary encoding is delegated to an externally supplied
//! [`StreamCompressor`].
//!
//! Decompression always honours the header-declared decoded length and the
//! global [`MAX_DECOMPRESSION_SIZE`] limit, so a corrupt header cannot make
//! the interceptor allocate unbounded memory.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::config::MAX_BUNDLE_SIZE;
use crate::error::{constants, ProtocolError, Result};

/// Maximum output size for decompression (aligned with MAX_BUNDLE_SIZE)
pub const MAX_DECOMPRESSION_SIZE: usize = MAX_BUNDLE_SIZE;

/// Body encoding declared by the bundle header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompressionKind {
    None,
    Deflate,
    Proprietary,
}

impl CompressionKind {
    /// Wire byte for this encoding
    pub fn to_byte(self) -> u8 {
        match self {
            CompressionKind::None => 0,
            CompressionKind::Deflate => 1,
            CompressionKind::Proprietary => 2,
        }
    }

    /// Parse the wire byte
    ///
    /// # Errors
    /// Returns `ProtocolError::UnsupportedCompression` for unknown values
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Deflate),
            2 => Ok(CompressionKind::Proprietary),
            other => Err(ProtocolError::UnsupportedCompression(other)),
        }
    }

    /// Whether the codec carries history from one bundle to the next.
    pub fn is_stateful(self) -> bool {
        matches!(self, CompressionKind::Proprietary)
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Deflate => "deflate",
            CompressionKind::Proprietary => "proprietary",
        }
    }
}

/// A stream (de)compression collaborator.
///
/// Implementations may keep state between calls (dictionaries, windows), so
/// both operations take `&mut self`. One instance serves one direction of one
/// connection. Decode state follows the sender's encoder and encode state
/// feeds the receiver's decoder; the two must be kept apart.
///
/// A stateful encoding is re-encoded for every bundle, changed or not, so the
/// encode history never drifts from what the receiver has decoded.
pub trait StreamCompressor: Send {
    /// Decode `data`, which must expand to exactly `declared_len` bytes.
    fn decode(&mut self, data: &[u8], declared_len: usize) -> Result<Vec<u8>>;

    /// Encode `data` into the compressed representation.
    fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

/// zlib-framed deflate (15-bit window, header and checksum present).
#[derive(Debug, Clone)]
pub struct DeflateCompressor {
    level: Compression,
}

impl DeflateCompressor {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCompressor for DeflateCompressor {
    fn decode(&mut self, data: &[u8], declared_len: usize) -> Result<Vec<u8>> {
        // Reject before allocating
        if declared_len > MAX_DECOMPRESSION_SIZE {
            return Err(ProtocolError::OversizedBundle(declared_len));
        }

        let mut out = Vec::with_capacity(declared_len);
        let mut reader = ZlibDecoder::new(data).take(declared_len as u64 + 1);
        reader
            .read_to_end(&mut out)
            .map_err(|e| ProtocolError::Compression(format!("{}: {e}", constants::ERR_DECOMPRESSION_FAILED)))?;

        if out.len() != declared_len {
            return Err(ProtocolError::Compression(format!(
                "{}: expected {declared_len} bytes, got {}",
                constants::ERR_DECOMPRESSION_FAILED,
                out.len()
            )));
        }
        Ok(out)
    }

    fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), self.level);
        encoder
            .write_all(data)
            .map_err(|e| ProtocolError::Compression(format!("{}: {e}", constants::ERR_COMPRESSION_FAILED)))?;
        encoder
            .finish()
            .map_err(|e| ProtocolError::Compression(format!("{}: {e}", constants::ERR_COMPRESSION_FAILED)))
    }
}

/// Holds the compressors available to one stream direction.
pub struct Compressors {
    deflate: Box<dyn StreamCompressor>,
    proprietary: Option<Box<dyn StreamCompressor>>,
}

impl Compressors {
    /// Deflate only; proprietary bundles will fail to decode.
    pub fn new() -> Self {
        Self {
            deflate: Box::new(DeflateCompressor::new()),
            proprietary: None,
        }
    }

    pub fn with_proprietary(mut self, codec: Box<dyn StreamCompressor>) -> Self {
        self.proprietary = Some(codec);
        self
    }

    pub fn has_proprietary(&self) -> bool {
        self.proprietary.is_some()
    }

    /// Decompress a bundle body according to its declared encoding.
    ///
    /// # Errors
    /// Returns `ProtocolError::Compression` if decoding fails or no codec is
    /// installed for the encoding.
    pub fn decompress(
        &mut self,
        data: &[u8],
        kind: CompressionKind,
        declared_len: usize,
    ) -> Result<Vec<u8>> {
        match kind {
            CompressionKind::None => Ok(data.to_vec()),
            CompressionKind::Deflate => self.deflate.decode(data, declared_len),
            CompressionKind::Proprietary => match self.proprietary.as_mut() {
                Some(codec) => {
                    if declared_len > MAX_DECOMPRESSION_SIZE {
                        return Err(ProtocolError::OversizedBundle(declared_len));
                    }
                    codec.decode(data, declared_len)
                }
                None => Err(ProtocolError::Compression(
                    constants::ERR_NO_PROPRIETARY_CODEC.to_string(),
                )),
            },
        }
    }

    /// Compress a bundle body with the given encoding.
    pub fn compress(&mut self, data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
        match kind {
            CompressionKind::None => Ok(data.to_vec()),
            CompressionKind::Deflate => self.deflate.encode(data),
            CompressionKind::Proprietary => match self.proprietary.as_mut() {
                Some(codec) => codec.encode(data),
                None => Err(ProtocolError::Compression(
                    constants::ERR_NO_PROPRIETARY_CODEC.to_string(),
                )),
            },
        }
    }
}

impl Default for Compressors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_deflate_roundtrip() {
        let original = b"Hello, World! This is a test of deflate compression.".repeat(8);
        let mut codec = DeflateCompressor::new();
        let compressed = codec.encode(&original).unwrap();
        assert!(compressed.len() < original.len());
        let decompressed = codec.decode(&compressed, original.len()).unwrap();
        assert_eq!(original, decompressed);
    }

    #[test]
    fn test_deflate_declared_length_mismatch() {
        let mut codec = DeflateCompressor::new();
        let compressed = codec.encode(b"twelve bytes").expect("encode");
        assert!(codec.decode(&compressed, 11).is_err());
        assert!(codec.decode(&compressed, 13).is_err());
    }

    #[test]
    fn test_deflate_rejects_garbage() {
        let mut codec = DeflateCompressor::new();
        let result = codec.decode(&[0xff, 0xff, 0xff, 0x00, 0x12], 64);
        assert!(matches!(result, Err(ProtocolError::Compression(_))));
    }

    #[test]
    fn test_declared_size_limit_enforcement() {
        let mut codec = DeflateCompressor::new();
        let result = codec.decode(&[0x78, 0x9c], MAX_DECOMPRESSION_SIZE + 1);
        assert!(matches!(result, Err(ProtocolError::OversizedBundle(_))));
    }

    #[test]
    fn test_compression_kind_bytes() {
        for kind in [
            CompressionKind::None,
            CompressionKind::Deflate,
            CompressionKind::Proprietary,
        ] {
            assert_eq!(CompressionKind::from_byte(kind.to_byte()).ok(), Some(kind));
            assert_eq!(kind.is_stateful(), kind == CompressionKind::Proprietary);
        }
        assert!(matches!(
            CompressionKind::from_byte(9),
            Err(ProtocolError::UnsupportedCompression(9))
        ));
    }

    #[test]
    fn test_missing_proprietary_codec() {
        let mut compressors = Compressors::new();
        assert!(!compressors.has_proprietary());
        let result = compressors.decompress(b"abc", CompressionKind::Proprietary, 3);
        assert!(matches!(result, Err(ProtocolError::Compression(_))));
    }

    struct Reversing;

    impl StreamCompressor for Reversing {
        fn decode(&mut self, data: &[u8], _declared_len: usize) -> Result<Vec<u8>> {
            Ok(data.iter().rev().copied().collect())
        }

        fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().rev().copied().collect())
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_proprietary_codec_is_delegated() {
        let mut compressors = Compressors::new().with_proprietary(Box::new(Reversing));
        let encoded = compressors
            .compress(b"abc", CompressionKind::Proprietary)
            .unwrap();
        assert_eq!(encoded, b"cba");
        let decoded = compressors
            .decompress(&encoded, CompressionKind::Proprietary, 3)
            .unwrap();
        assert_eq!(decoded, b"abc");
    }
}
