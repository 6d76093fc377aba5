//! Observability and Metrics
//!
//! Interception outcome counters, shared by every connection of an
//! [`Interceptor`](crate::service::interceptor::Interceptor).
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for interception operations
#[derive(Debug)]
pub struct Metrics {
    /// Connections discovered
    pub connections_total: AtomicU64,
    /// Connections currently tracked
    pub connections_active: AtomicU64,
    /// Bundles decoded and dispatched
    pub bundles_processed: AtomicU64,
    /// Bundles forwarded unmodified after a decode failure
    pub bundles_passed_through: AtomicU64,
    /// Bundles re-encoded after a handler changed them
    pub bundles_reencoded: AtomicU64,
    /// Bytes forwarded without being part of a bundle
    pub noise_bytes: AtomicU64,
    /// Malformed bundle or message boundaries
    pub framing_errors: AtomicU64,
    /// Corrupt or undecodable compressed bodies
    pub compression_errors: AtomicU64,
    /// Messages dispatched to handlers
    pub messages_dispatched: AtomicU64,
    /// Messages whose animation lock was rewritten
    pub messages_rewritten: AtomicU64,
    /// Messages vetoed by a handler
    pub messages_dropped: AtomicU64,
    /// Server responses that matched no pending request
    pub sequence_mismatches: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            bundles_processed: AtomicU64::new(0),
            bundles_passed_through: AtomicU64::new(0),
            bundles_reencoded: AtomicU64::new(0),
            noise_bytes: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            compression_errors: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            messages_rewritten: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            sequence_mismatches: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_found(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_gone(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bundle_processed(&self, message_count: u64) {
        self.bundles_processed.fetch_add(1, Ordering::Relaxed);
        self.messages_dispatched
            .fetch_add(message_count, Ordering::Relaxed);
    }

    pub fn bundle_passed_through(&self) {
        self.bundles_passed_through.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bundle_reencoded(&self) {
        self.bundles_reencoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn noise(&self, byte_count: u64) {
        self.noise_bytes.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn compression_error(&self) {
        self.compression_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_rewritten(&self) {
        self.messages_rewritten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sequence_mismatch(&self) {
        self.sequence_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            bundles_processed: self.bundles_processed.load(Ordering::Relaxed),
            bundles_passed_through: self.bundles_passed_through.load(Ordering::Relaxed),
            bundles_reencoded: self.bundles_reencoded.load(Ordering::Relaxed),
            noise_bytes: self.noise_bytes.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            compression_errors: self.compression_errors.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_rewritten: self.messages_rewritten.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            sequence_mismatches: self.sequence_mismatches.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            bundles_processed = snapshot.bundles_processed,
            bundles_passed_through = snapshot.bundles_passed_through,
            bundles_reencoded = snapshot.bundles_reencoded,
            noise_bytes = snapshot.noise_bytes,
            framing_errors = snapshot.framing_errors,
            compression_errors = snapshot.compression_errors,
            messages_dispatched = snapshot.messages_dispatched,
            messages_rewritten = snapshot.messages_rewritten,
            messages_dropped = snapshot.messages_dropped,
            sequence_mismatches = snapshot.sequence_mismatches,
            uptime_seconds = snapshot.uptime_seconds,
            "Interception metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub bundles_processed: u64,
    pub bundles_passed_through: u64,
    pub bundles_reencoded: u64,
    pub noise_bytes: u64,
    pub framing_errors: u64,
    pub compression_errors: u64,
    pub messages_dispatched: u64,
    pub messages_rewritten: u64,
    pub messages_dropped: u64,
    pub sequence_mismatches: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.connection_found();
        metrics.connection_found();
        metrics.connection_gone();
        metrics.bundle_processed(3);
        metrics.framing_error();
        metrics.noise(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 1);
        assert_eq!(snapshot.bundles_processed, 1);
        assert_eq!(snapshot.messages_dispatched, 3);
        assert_eq!(snapshot.framing_errors, 1);
        assert_eq!(snapshot.noise_bytes, 7);
        assert_eq!(snapshot.compression_errors, 0);
    }
}
