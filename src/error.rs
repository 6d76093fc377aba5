//! # Error Types
//!
//! Error handling for the interception core.
//!
//! This module defines every error variant the codec, configuration layer and
//! pipeline can produce. Most of them never reach the transport: the stream
//! tunnel converts framing and compression failures into verbatim
//! pass-through, and queue-matching misses are only logged.
//!
//! ## Error Categories
//! - **Framing Errors**: malformed bundle or message boundaries
//! - **Compression Errors**: corrupt or oversized compressed bodies
//! - **Configuration Errors**: invalid tunables, unreadable or unparsable files
//! - **I/O Errors**: raised by readers wrapping the stream framer
//!
//! ## Example Usage
//! ```rust
//! use latency_mitigator::core::bundle::split_messages;
//! use latency_mitigator::error::ProtocolError;
//! use tracing::warn;
//!
//! // A message claiming zero length is a framing error.
//! let body = [0u8; 16];
//! match split_messages(1, &body) {
//!     Err(ProtocolError::Framing(reason)) => warn!(%reason, "Bundle forwarded unmodified"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;

use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_TRUNCATED_HEADER: &str = "Bundle header is truncated";
    pub const ERR_INVALID_MAGIC: &str = "Bundle magic not recognised";
    pub const ERR_ZERO_LENGTH_MESSAGE: &str = "Message declares zero length";
    pub const ERR_MESSAGE_OVERRUN: &str =
        "sum(message.length for each message) exceeds decoded body length";
    pub const ERR_TRUNCATED_MESSAGE: &str = "Message header is truncated";

    /// Compression errors
    pub const ERR_DECOMPRESSION_FAILED: &str = "Decompression failed";
    pub const ERR_COMPRESSION_FAILED: &str = "Compression failed";
    pub const ERR_NO_PROPRIETARY_CODEC: &str = "No proprietary stream codec installed";
}

/// The primary error type for all interception operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Bundle too large: {0} bytes")]
    OversizedBundle(usize),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Unsupported compression type: {0}")]
    UnsupportedCompression(u8),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Synchronization primitive poisoned")]
    LockPoisoned,
}

impl ProtocolError {
    /// Framing and size violations are recoverable by forwarding the buffer untouched.
    ///
    /// I/O errors belong to neither class; they only surface when the framer
    /// is driven by a `tokio_util` reader.
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::OversizedBundle(_))
    }

    /// Compression failures indicate a corrupt stream and are logged at error level.
    pub fn is_compression(&self) -> bool {
        matches!(
            self,
            Self::Compression(_) | Self::UnsupportedCompression(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
