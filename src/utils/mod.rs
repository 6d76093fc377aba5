//! # Utility Modules
//!
//! Supporting utilities for compression, statistics, logging, and timing.
//!
//! ## Components
//! - **Compression**: zlib deflate plus a pluggable proprietary codec, with size limits
//! - **Stats**: Sliding-window statistics over timestamped samples
//! - **Logging**: Structured logging configuration
//! - **Time**: Injectable monotonic microsecond clocks
//! - **Metrics**: Thread-safe observability counters

pub mod compression;
pub mod logging;
pub mod metrics;
pub mod stats;
pub mod time;

pub use stats::StatsTracker;
pub use time::{Clock, ManualClock, MonotonicClock};
