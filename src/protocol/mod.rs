//! # Protocol Layer
//!
//! Message dispatch and the per-connection logic built on it.
//!
//! ## Components
//! - **Pipeline**: Ordered, cancelable handler dispatch per direction
//! - **State**: Per-connection statistics, pending actions, and lock latches
//! - **Mitigator**: Animation lock correction and keep-alive latency sampling
//!
//! ## Message Flow
//! ```text
//! Client ──outbound──► pipeline ──► mitigator (record request) ──► Server
//! Server ──inbound───► pipeline ──► mitigator (rewrite lock)   ──► Client
//! ```

pub mod mitigator;
pub mod pipeline;
pub mod state;

pub use mitigator::{KeepAliveSampler, LatencyMitigator};
pub use pipeline::{
    DispatchOutcome, Direction, HandlerContext, MessageHandler, MessagePipeline, OwnerId,
    Subscription, Verdict,
};
pub use state::{ConnectionId, ConnectionState, PendingAction};
