//! # Core Protocol Components
//!
//! Low-level bundle handling, message views, and the stream codec.
//!
//! This module provides the foundation of the interceptor, handling bundle
//! framing, compression, and the fixed-layout payloads the mitigator reads.
//!
//! ## Components
//! - **Bundle**: Outer header with magic detection and message splitting
//! - **Message**: Message and opcode payload headers, typed payload views
//! - **Codec**: Bundle decode/encode and a Tokio framer for unaligned streams
//!
//! ## Wire Format
//! ```text
//! [Bundle header(40)] [Message(N)]...
//! [Message header(16)] [Ipc header(16)] [Body(N)]
//! ```
//!
//! ## Limits
//! - Maximum bundle size: 16MB (prevents memory exhaustion)
//! - Declared lengths are validated before allocation

pub mod bundle;
pub mod codec;
pub mod message;
