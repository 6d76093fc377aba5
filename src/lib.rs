//! # Latency Mitigator
//!
//! Protocol engine for an intercepted game connection. Bundles captured at
//! the socket layer are decoded into messages, run through an ordered
//! handler pipeline, and re-encoded only when a handler changed something.
//! The bundled [`LatencyMitigator`](protocol::LatencyMitigator) shortens the
//! animation lock the server reports after each action by the round-trip
//! time the client already paid.
//!
//! ## Layout
//! - [`core`]: bundle framing, message views, the bundle codec
//! - [`protocol`]: pipeline, per-connection state, mitigation handlers
//! - [`service`]: stream re-framing and the connection-level interceptor
//! - [`utils`]: statistics, clocks, compression, logging, metrics
//! - [`config`]: opcode map and mitigation tunables
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use latency_mitigator::config::ConfigProvider;
//! use latency_mitigator::protocol::ConnectionId;
//! use latency_mitigator::service::Interceptor;
//!
//! let interceptor = Interceptor::new(Arc::new(ConfigProvider::default()));
//! let id = ConnectionId(0x1f40);
//! interceptor.on_connection_found(id);
//!
//! // bytes that are not a bundle are forwarded as-is
//! assert_eq!(interceptor.on_send(id, b"hello"), b"hello");
//! interceptor.on_connection_gone(id);
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use config::{Config, ConfigProvider};
pub use error::{ProtocolError, Result};
pub use service::Interceptor;
