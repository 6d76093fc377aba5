//! # Service Layer
//!
//! The boundary facing the socket capture layer.
//!
//! ## Components
//! - **Tunnel**: Re-frames one direction of a stream into bundles, runs them
//!   through the pipeline and re-encodes only what changed
//! - **Interceptor**: Connection lifecycle, per-connection state, and the
//!   mitigation toggle
//!
//! ## Failure Policy
//! Nothing that arrives from the wire can make the interceptor withhold it:
//! bytes that cannot be parsed are forwarded unmodified.

pub mod interceptor;
pub mod tunnel;

pub use interceptor::Interceptor;
pub use tunnel::StreamTunnel;
