//! Bundle codec and stream framer.
//!
//! [`BundleCodec`] turns one complete bundle into its messages and back,
//! handling body compression. [`BundleFramer`] is a `tokio_util` codec that
//! cuts an unaligned byte stream into complete bundles and the noise between
//! them, so a partially received bundle simply waits for more data.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::config::MAX_BUNDLE_SIZE;
use crate::core::bundle::{leading_noise_len, split_messages, BundleHeader, BUNDLE_HEADER_SIZE};
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::utils::compression::{CompressionKind, Compressors};

/// A bundle split into its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBundle {
    pub header: BundleHeader,
    pub messages: Vec<Message>,
}

/// Decodes and encodes complete bundles.
///
/// One codec serves one direction of one connection, since stream
/// compressors may carry state between bundles.
pub struct BundleCodec {
    compressors: Compressors,
}

impl std::fmt::Debug for BundleCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleCodec")
            .field("proprietary", &self.compressors.has_proprietary())
            .finish()
    }
}

impl Default for BundleCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleCodec {
    pub fn new() -> Self {
        Self {
            compressors: Compressors::new(),
        }
    }

    pub fn with_compressors(compressors: Compressors) -> Self {
        Self { compressors }
    }

    /// Decode the first bundle in `buf`, skipping any leading noise.
    ///
    /// # Errors
    /// - `ProtocolError::Framing` if no magic is found, the header is
    ///   inconsistent, or message boundaries are malformed
    /// - `ProtocolError::OversizedBundle` if the declared length exceeds the cap
    /// - `ProtocolError::Compression` / `UnsupportedCompression` if the body
    ///   cannot be decompressed
    pub fn decode(&mut self, buf: &[u8]) -> Result<DecodedBundle> {
        let noise = leading_noise_len(buf);
        let buf = &buf[noise..];
        let header = BundleHeader::parse(buf)?;

        let total = header.total_length as usize;
        if total > MAX_BUNDLE_SIZE {
            return Err(ProtocolError::OversizedBundle(total));
        }
        if total < BUNDLE_HEADER_SIZE {
            return Err(ProtocolError::Framing(format!(
                "Bundle total length {total} is shorter than its header"
            )));
        }
        if buf.len() < total {
            return Err(ProtocolError::Framing(format!(
                "Bundle declares {total} bytes but only {} are available",
                buf.len()
            )));
        }

        let body = &buf[BUNDLE_HEADER_SIZE..total];
        let kind = header.compression_kind()?;
        let decoded;
        let body = match kind {
            CompressionKind::None => body,
            _ => {
                decoded = self.compressors.decompress(
                    body,
                    kind,
                    header.decoded_body_length as usize,
                )?;
                &decoded[..]
            }
        };

        let messages = split_messages(usize::from(header.message_count), body)?
            .into_iter()
            .map(|slice| Message::from_bytes(slice.to_vec()))
            .collect::<Result<Vec<_>>>()?;

        trace!(
            total_length = total,
            message_count = messages.len(),
            compression = kind.name(),
            "Decoded bundle"
        );

        Ok(DecodedBundle { header, messages })
    }

    /// Encode `messages` under a copy of `header`.
    ///
    /// `total_length`, `message_count` and `decoded_body_length` are
    /// recomputed; every other header field is kept, including the
    /// compression type.
    pub fn encode(&mut self, header: &BundleHeader, messages: &[Message]) -> Result<Vec<u8>> {
        let body_len: usize = messages.iter().map(Message::len).sum();
        let mut body = Vec::with_capacity(body_len);
        for message in messages {
            body.extend_from_slice(message.as_bytes());
        }

        let kind = header.compression_kind()?;
        let encoded = self.compressors.compress(&body, kind)?;
        let total = BUNDLE_HEADER_SIZE + encoded.len();
        if total > MAX_BUNDLE_SIZE {
            return Err(ProtocolError::OversizedBundle(total));
        }
        let message_count = u16::try_from(messages.len()).map_err(|_| {
            ProtocolError::Framing(format!("Too many messages for one bundle: {}", messages.len()))
        })?;

        let header = BundleHeader {
            total_length: total as u32,
            message_count,
            decoded_body_length: body.len() as u32,
            ..*header
        };

        let mut out = Vec::with_capacity(total);
        header.write_to(&mut out);
        out.extend_from_slice(&encoded);
        Ok(out)
    }
}

/// A unit cut from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Bytes that are not part of any bundle; forwarded verbatim
    Noise(Bytes),
    /// Exactly one complete bundle, header included
    Bundle(Bytes),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Noise(bytes) | Frame::Bundle(bytes) => bytes,
        }
    }
}

/// Cuts a byte stream into bundles and noise.
#[derive(Debug, Clone, Default)]
pub struct BundleFramer {
    _private: (),
}

impl BundleFramer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for BundleFramer {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        let noise = leading_noise_len(src);
        if noise > 0 {
            return Ok(Some(Frame::Noise(src.split_to(noise).freeze())));
        }

        if src.len() < BUNDLE_HEADER_SIZE {
            return Ok(None);
        }

        let total = u32::from_le_bytes([src[24], src[25], src[26], src[27]]) as usize;
        if total < BUNDLE_HEADER_SIZE || total > MAX_BUNDLE_SIZE {
            trace!(total_length = total, "Implausible bundle length, skipping one byte");
            return Ok(Some(Frame::Noise(src.split_to(1).freeze())));
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(Frame::Bundle(src.split_to(total).freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Ok(Some(Frame::Noise(src.split().freeze()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use crate::core::bundle::MAGIC_CONSTANT;
    use crate::core::message::{IpcHeader, MessageType};

    fn header(compression: CompressionKind) -> BundleHeader {
        BundleHeader {
            magic: MAGIC_CONSTANT,
            timestamp_ms: 1_700_000_000_000,
            total_length: 0,
            conn_type: 1,
            message_count: 0,
            encoding: 1,
            compression: compression.to_byte(),
            reserved: 0,
            decoded_body_length: 0,
        }
    }

    fn messages() -> Vec<Message> {
        vec![
            Message::ipc(1, 1, IpcHeader::default(), &[0xab; 24]),
            Message::keep_alive(MessageType::ClientKeepAlive, 1, 2, 3),
        ]
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_encode_recomputes_header() {
        let mut codec = BundleCodec::new();
        let bytes = codec.encode(&header(CompressionKind::None), &messages()).unwrap();
        let parsed = BundleHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.total_length as usize, bytes.len());
        assert_eq!(parsed.message_count, 2);
        assert_eq!(parsed.decoded_body_length as usize, 56 + 24);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_deflate_bundle_roundtrip() {
        let mut codec = BundleCodec::new();
        let bytes = codec.encode(&header(CompressionKind::Deflate), &messages()).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.messages, messages());
        assert_eq!(decoded.header.compression, 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_skips_leading_noise() {
        let mut codec = BundleCodec::new();
        let mut bytes = vec![1, 2, 3];
        bytes.extend(codec.encode(&header(CompressionKind::None), &messages()).unwrap());
        assert_eq!(codec.decode(&bytes).unwrap().messages.len(), 2);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_truncated_bundle_is_framing_error() {
        let mut codec = BundleCodec::new();
        let bytes = codec.encode(&header(CompressionKind::None), &messages()).unwrap();
        let err = codec.decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.is_framing());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_corrupt_deflate_is_compression_error() {
        let mut codec = BundleCodec::new();
        let mut bytes = codec.encode(&header(CompressionKind::Deflate), &messages()).unwrap();
        for byte in &mut bytes[BUNDLE_HEADER_SIZE..] {
            *byte = 0xff;
        }
        let err = codec.decode(&bytes).unwrap_err();
        assert!(err.is_compression());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_framer_splits_noise_and_bundles() {
        let mut codec = BundleCodec::new();
        let bundle = codec.encode(&header(CompressionKind::None), &messages()).unwrap();

        let mut src = BytesMut::new();
        src.put_slice(&[7, 7]);
        src.put_slice(&bundle[..50]);

        let mut framer = BundleFramer::new();
        assert_eq!(
            framer.decode(&mut src).unwrap(),
            Some(Frame::Noise(Bytes::from_static(&[7, 7])))
        );
        assert_eq!(framer.decode(&mut src).unwrap(), None);

        src.put_slice(&bundle[50..]);
        assert_eq!(
            framer.decode(&mut src).unwrap(),
            Some(Frame::Bundle(Bytes::from(bundle)))
        );
        assert!(src.is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_framer_treats_bad_length_as_noise() {
        let mut bad = header(CompressionKind::None);
        bad.total_length = 12;
        let mut src = BytesMut::from(&bad.to_bytes()[..]);

        let mut framer = BundleFramer::new();
        let frame = framer.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.as_bytes(), &[0x52]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_framer_flushes_partial_data_at_eof() {
        let mut src = BytesMut::from(&MAGIC_CONSTANT[..8]);
        let mut framer = BundleFramer::new();
        assert_eq!(framer.decode(&mut src).unwrap(), None);
        let frame = framer.decode_eof(&mut src).unwrap().unwrap();
        assert_eq!(frame.as_bytes(), &MAGIC_CONSTANT[..8]);
    }

    #[test]
    fn test_reader_errors_convert_for_the_framer() {
        let err: <BundleFramer as Decoder>::Error =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "socket closed").into();
        assert!(matches!(err, ProtocolError::Io(_)));
        assert!(!err.is_framing());
        assert!(!err.is_compression());
    }
}
