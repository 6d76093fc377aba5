//! Per-connection state.
//!
//! A [`ConnectionState`] lives exactly as long as the socket it describes.
//! It is only ever touched by the thread delivering that connection's
//! traffic, so it carries no locks of its own; handlers receive it by
//! `&mut` through the dispatch context.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::config::MitigationConfig;
use crate::utils::stats::StatsTracker;
use crate::utils::time::Clock;

/// Opaque identity of an intercepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Samples kept by the early-request tracker.
const EARLY_REQUEST_TRACK_COUNT: usize = 32;

/// Timing hints held for responses that have not arrived yet.
pub const MAX_PENDING_HINTS: usize = 64;

/// Client keep-alives awaiting a server answer.
pub const MAX_OUTSTANDING_KEEPALIVES: usize = 32;

/// An action request awaiting its server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAction {
    pub action_id: u32,
    pub sequence: u32,
    pub request_us: i64,
    pub response_us: i64,
    pub original_wait_us: i64,
    pub cast_flag: bool,
}

impl PendingAction {
    pub fn new(action_id: u32, sequence: u32, request_us: i64) -> Self {
        Self {
            action_id,
            sequence,
            request_us,
            response_us: 0,
            original_wait_us: 0,
            cast_flag: false,
        }
    }
}

/// Outcome of popping the pending queue towards a matching entry.
#[derive(Debug, Default)]
pub struct QueueMatch {
    /// The matching entry, already removed from the queue
    pub found: Option<PendingAction>,
    /// Entries popped before the match, oldest first
    pub skipped: Vec<PendingAction>,
}

/// Everything tracked for one connection.
pub struct ConnectionState {
    id: ConnectionId,
    clock: Arc<dyn Clock>,
    rtt: StatsTracker,
    server_response_delay: StatsTracker,
    early_requests: StatsTracker,
    exaggerated_latency: StatsTracker,
    pending: VecDeque<PendingAction>,
    hints: BTreeMap<u32, i64>,
    keepalive_requests: VecDeque<i64>,
    last_animation_lock_ends_at: Option<i64>,
    latest_successful_request: Option<PendingAction>,
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("pending", &self.pending)
            .field("hints", &self.hints.len())
            .field("last_animation_lock_ends_at", &self.last_animation_lock_ends_at)
            .field("latest_successful_request", &self.latest_successful_request)
            .finish()
    }
}

impl ConnectionState {
    pub fn new(id: ConnectionId, clock: Arc<dyn Clock>, config: &MitigationConfig) -> Self {
        Self {
            id,
            rtt: StatsTracker::new(config.rtt_track_count, i64::MAX, Arc::clone(&clock)),
            server_response_delay: StatsTracker::new(
                config.latency_track_count,
                i64::MAX,
                Arc::clone(&clock),
            ),
            early_requests: StatsTracker::new(EARLY_REQUEST_TRACK_COUNT, 0, Arc::clone(&clock)),
            exaggerated_latency: StatsTracker::new(
                config.latency_track_count,
                i64::MAX,
                Arc::clone(&clock),
            ),
            clock,
            pending: VecDeque::with_capacity(8),
            hints: BTreeMap::new(),
            keepalive_requests: VecDeque::new(),
            last_animation_lock_ends_at: None,
            latest_successful_request: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn now_us(&self) -> i64 {
        self.clock.now_us()
    }

    /// Round-trip times between action requests and their effects.
    pub fn rtt(&mut self) -> &mut StatsTracker {
        &mut self.rtt
    }

    /// Network latency samples, from keep-alives or the socket layer.
    pub fn server_response_delay(&mut self) -> &mut StatsTracker {
        &mut self.server_response_delay
    }

    /// How early the client sent requests before the previous lock ended.
    pub fn early_requests(&mut self) -> &mut StatsTracker {
        &mut self.early_requests
    }

    /// How far measured latency overshoots the action round trip.
    ///
    /// A latency above the round trip cannot be real; the median overshoot
    /// is taken off later samples.
    pub fn exaggerated_latency(&mut self) -> &mut StatsTracker {
        &mut self.exaggerated_latency
    }

    /// Feed an externally measured latency sample.
    pub fn record_latency_sample(&mut self, latency_us: i64) {
        self.server_response_delay.add_value(latency_us);
    }

    pub fn push_pending(&mut self, action: PendingAction) {
        self.pending.push_back(action);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_front(&self) -> Option<&PendingAction> {
        self.pending.front()
    }

    pub fn pending_front_mut(&mut self) -> Option<&mut PendingAction> {
        self.pending.front_mut()
    }

    /// Pop entries until `matches` accepts one, and pop that one too.
    ///
    /// Responses arrive in request order, so anything ahead of the match was
    /// never answered. When nothing matches the queue ends up empty.
    pub fn take_pending_until<F>(&mut self, mut matches: F) -> QueueMatch
    where
        F: FnMut(&PendingAction) -> bool,
    {
        let mut result = QueueMatch::default();
        while let Some(front) = self.pending.pop_front() {
            if matches(&front) {
                result.found = Some(front);
                break;
            }
            result.skipped.push(front);
        }
        result
    }

    /// Keep a hint until its response arrives; the lowest sequence goes first
    /// once [`MAX_PENDING_HINTS`] are held.
    pub fn stash_hint(&mut self, sequence: u32, original_wait_us: i64) {
        self.hints.insert(sequence, original_wait_us);
        if self.hints.len() > MAX_PENDING_HINTS {
            if let Some((dropped, _)) = self.hints.pop_first() {
                trace!(connection = %self.id, sequence = dropped, "Dropping unanswered timing hint");
            }
        }
    }

    pub fn take_hint(&mut self, sequence: u32) -> Option<i64> {
        self.hints.remove(&sequence)
    }

    pub fn hint_count(&self) -> usize {
        self.hints.len()
    }

    pub fn last_animation_lock_ends_at(&self) -> Option<i64> {
        self.last_animation_lock_ends_at
    }

    pub fn set_last_animation_lock_ends_at(&mut self, at_us: i64) {
        self.last_animation_lock_ends_at = Some(at_us);
    }

    pub fn latest_successful_request(&self) -> Option<&PendingAction> {
        self.latest_successful_request.as_ref()
    }

    pub fn latest_successful_request_mut(&mut self) -> Option<&mut PendingAction> {
        self.latest_successful_request.as_mut()
    }

    pub fn set_latest_successful_request(&mut self, action: PendingAction) {
        self.latest_successful_request = Some(action);
    }

    pub fn record_keepalive_request(&mut self, now_us: i64) {
        self.keepalive_requests.push_back(now_us);
        if self.keepalive_requests.len() > MAX_OUTSTANDING_KEEPALIVES {
            if let Some(sent) = self.keepalive_requests.pop_front() {
                trace!(connection = %self.id, sent_us = sent, "Dropping unanswered keep-alive");
            }
        }
    }

    /// Match a server keep-alive to the oldest outstanding client one.
    ///
    /// Requests older than `max_wait_us` are discarded first. The measured
    /// delay is recorded as a latency sample and returned.
    pub fn record_keepalive_response(&mut self, now_us: i64, max_wait_us: i64) -> Option<i64> {
        while let Some(&sent) = self.keepalive_requests.front() {
            if now_us - sent > max_wait_us {
                trace!(connection = %self.id, sent_us = sent, "Dropping stale keep-alive");
                self.keepalive_requests.pop_front();
            } else {
                break;
            }
        }

        let sent = self.keepalive_requests.pop_front()?;
        let delay = now_us - sent;
        self.server_response_delay.add_value(delay);
        Some(delay)
    }

    /// Forget everything the mitigator derived, keeping the statistics.
    pub fn reset_mitigation(&mut self) {
        self.pending.clear();
        self.hints.clear();
        self.last_animation_lock_ends_at = None;
        self.latest_successful_request = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::ManualClock;

    fn state() -> (ConnectionState, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let state = ConnectionState::new(
            ConnectionId(1),
            Arc::new(clock.clone()),
            &MitigationConfig::default(),
        );
        (state, clock)
    }

    #[test]
    fn test_take_pending_until_skips_older_entries() {
        let (mut state, _clock) = state();
        for sequence in 1..=4 {
            state.push_pending(PendingAction::new(100 + sequence, sequence, 0));
        }

        let matched = state.take_pending_until(|a| a.sequence == 3);
        assert_eq!(matched.found.map(|a| a.action_id), Some(103));
        assert_eq!(
            matched.skipped.iter().map(|a| a.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(state.pending_len(), 1);
    }

    #[test]
    fn test_take_pending_until_miss_drains_queue() {
        let (mut state, _clock) = state();
        state.push_pending(PendingAction::new(1, 1, 0));
        state.push_pending(PendingAction::new(2, 2, 0));
        let matched = state.take_pending_until(|a| a.sequence == 9);
        assert!(matched.found.is_none());
        assert_eq!(matched.skipped.len(), 2);
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_hints_are_taken_once() {
        let (mut state, _clock) = state();
        state.stash_hint(5, 600_000);
        assert_eq!(state.take_hint(5), Some(600_000));
        assert_eq!(state.take_hint(5), None);
    }

    #[test]
    fn test_keepalive_latency() {
        let (mut state, clock) = state();
        state.record_keepalive_request(clock.now_us());
        clock.advance_ms(40);
        assert_eq!(
            state.record_keepalive_response(clock.now_us(), 5_000_000),
            Some(40_000)
        );
        assert_eq!(state.server_response_delay().latest(), 40_000);
        assert_eq!(state.record_keepalive_response(clock.now_us(), 5_000_000), None);
    }

    #[test]
    fn test_stale_keepalive_is_discarded() {
        let (mut state, clock) = state();
        state.record_keepalive_request(clock.now_us());
        clock.advance_ms(6_000);
        state.record_keepalive_request(clock.now_us());
        clock.advance_ms(30);
        assert_eq!(
            state.record_keepalive_response(clock.now_us(), 5_000_000),
            Some(30_000)
        );
    }

    #[test]
    fn test_reset_mitigation_keeps_statistics() {
        let (mut state, _clock) = state();
        state.rtt().add_value(80_000);
        state.push_pending(PendingAction::new(1, 1, 0));
        state.set_last_animation_lock_ends_at(5);
        state.reset_mitigation();
        assert_eq!(state.pending_len(), 0);
        assert_eq!(state.last_animation_lock_ends_at(), None);
        assert_eq!(state.rtt().latest(), 80_000);
    }

    #[test]
    fn test_unanswered_hints_are_capped() {
        let (mut state, _clock) = state();
        for sequence in 1..=(MAX_PENDING_HINTS as u32 + 10) {
            state.stash_hint(sequence, 500_000);
        }
        assert_eq!(state.hint_count(), MAX_PENDING_HINTS);
        // oldest sequences went first
        assert_eq!(state.take_hint(10), None);
        assert_eq!(state.take_hint(11), Some(500_000));
    }

    #[test]
    fn test_unanswered_keepalives_are_capped() {
        let (mut state, clock) = state();
        for _ in 0..(MAX_OUTSTANDING_KEEPALIVES + 5) {
            state.record_keepalive_request(clock.now_us());
            clock.advance_ms(1);
        }
        // the first five were dropped
        clock.advance_ms(10);
        let oldest_left = 1_000_000 + 5_000;
        assert_eq!(
            state.record_keepalive_response(clock.now_us(), i64::MAX),
            Some(clock.now_us() - oldest_left)
        );
    }
}
