//! Sliding-window numeric statistics.
//!
//! A [`StatsTracker`] keeps the most recent `track_count` samples, optionally
//! also dropping samples older than a maximum age. Expired samples are evicted
//! lazily: on every insertion and before every query. Samples are stored in
//! insertion order, which is also chronological order because timestamps come
//! from a monotonic [`Clock`].
//!
//! Every query accepts a `since_us` bound. The window is walked from newest to
//! oldest and the walk stops at the first sample older than `since_us`; a bound
//! of `0` includes every live sample.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::utils::time::Clock;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    timestamp_us: i64,
    /// `None` when the tracker has no maximum age.
    expiry_us: Option<i64>,
}

/// Bounded, time-or-count-expiring window of `i64` samples.
pub struct StatsTracker {
    track_count: usize,
    empty_value: i64,
    max_age_us: Option<i64>,
    values: VecDeque<Entry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StatsTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsTracker")
            .field("track_count", &self.track_count)
            .field("empty_value", &self.empty_value)
            .field("max_age_us", &self.max_age_us)
            .field("len", &self.values.len())
            .finish()
    }
}

impl StatsTracker {
    /// Create a tracker without a maximum sample age.
    ///
    /// `empty_value` is returned by queries that find no samples.
    pub fn new(track_count: usize, empty_value: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            track_count,
            empty_value,
            max_age_us: None,
            values: VecDeque::with_capacity(track_count.min(64) + 1),
            clock,
        }
    }

    /// Create a tracker whose samples also expire `max_age_us` after insertion.
    pub fn with_max_age(
        track_count: usize,
        empty_value: i64,
        max_age_us: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut tracker = Self::new(track_count, empty_value, clock);
        tracker.max_age_us = Some(max_age_us);
        tracker
    }

    /// Append a sample stamped with the current time, then evict.
    pub fn add_value(&mut self, value: i64) {
        let timestamp_us = self.clock.now_us();
        let expiry_us = self
            .max_age_us
            .map(|age| timestamp_us.saturating_add(age));
        self.values.push_back(Entry {
            value,
            timestamp_us,
            expiry_us,
        });
        self.remove_expired(timestamp_us);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&mut self) -> bool {
        self.evict();
        self.values.is_empty()
    }

    /// Sentinel returned by queries over an empty window.
    pub fn invalid_value(&self) -> i64 {
        self.empty_value
    }

    pub fn track_count(&self) -> usize {
        self.track_count
    }

    fn evict(&mut self) {
        let now = self.clock.now_us();
        self.remove_expired(now);
    }

    fn remove_expired(&mut self, now_us: i64) {
        while let Some(front) = self.values.front() {
            let expired = front.expiry_us.is_some_and(|expiry| expiry < now_us);
            if self.values.len() > self.track_count || expired {
                self.values.pop_front();
            } else {
                break;
            }
        }
    }

    /// Samples newer than `since_us`, newest first.
    fn window(&self, since_us: i64) -> impl Iterator<Item = &Entry> + '_ {
        self.values
            .iter()
            .rev()
            .take_while(move |entry| entry.timestamp_us >= since_us)
    }

    pub fn latest(&mut self) -> i64 {
        self.evict();
        self.values
            .back()
            .map_or(self.empty_value, |entry| entry.value)
    }

    pub fn min(&mut self, since_us: i64) -> i64 {
        self.evict();
        self.window(since_us)
            .map(|entry| entry.value)
            .min()
            .unwrap_or(self.empty_value)
    }

    pub fn max(&mut self, since_us: i64) -> i64 {
        self.evict();
        self.window(since_us)
            .map(|entry| entry.value)
            .max()
            .unwrap_or(self.empty_value)
    }

    /// Median of the window; averages the two middle values on even counts.
    pub fn median(&mut self, since_us: i64) -> i64 {
        self.evict();
        let mut sorted: Vec<i64> = self.window(since_us).map(|entry| entry.value).collect();
        if sorted.is_empty() {
            return self.empty_value;
        }
        sorted.sort_unstable();

        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2
        } else {
            sorted[mid]
        }
    }

    pub fn mean(&mut self, since_us: i64) -> i64 {
        self.evict();
        let (count, acc) = self
            .window(since_us)
            .fold((0i64, 0i64), |(count, acc), entry| {
                (count + 1, acc + entry.value)
            });
        if count == 0 {
            self.empty_value
        } else {
            acc / count
        }
    }

    /// Mean and population standard deviation of the same subset.
    ///
    /// An empty window yields `(empty_value, 0)`.
    pub fn mean_and_deviation(&mut self, since_us: i64) -> (i64, i64) {
        self.evict();
        let (count, acc) = self
            .window(since_us)
            .fold((0i64, 0i64), |(count, acc), entry| {
                (count + 1, acc + entry.value)
            });

        match count {
            0 => (self.empty_value, 0),
            1 => (acc, 0),
            _ => {
                let mean = acc / count;
                let squared: i64 = self
                    .window(since_us)
                    .map(|entry| (entry.value - mean) * (entry.value - mean))
                    .sum();
                let deviation = ((squared / count) as f64).sqrt() as i64;
                (mean, deviation)
            }
        }
    }

    pub fn deviation(&mut self, since_us: i64) -> i64 {
        self.mean_and_deviation(since_us).1
    }

    pub fn count(&mut self, since_us: i64) -> usize {
        self.evict();
        if since_us == 0 {
            return self.values.len();
        }
        self.window(since_us).count()
    }

    /// Count that decays smoothly across the `since_us` boundary.
    ///
    /// When the boundary falls between two samples, the older one contributes
    /// the fraction of the gap between it and the boundary.
    pub fn count_fractional(&mut self, since_us: i64) -> f64 {
        self.evict();
        if since_us == 0 {
            return self.values.len() as f64;
        }

        let mut count = 0usize;
        let mut last_timestamp: Option<i64> = None;
        for entry in self.values.iter().rev() {
            if entry.timestamp_us < since_us {
                if let Some(last) = last_timestamp {
                    let gap = last - entry.timestamp_us;
                    let elapsed = since_us - entry.timestamp_us;
                    if gap > elapsed {
                        return count as f64 + elapsed as f64 / gap as f64;
                    }
                }
                break;
            }
            count += 1;
            last_timestamp = Some(entry.timestamp_us);
        }
        count as f64
    }

    /// Microseconds until the window can take a sample without displacing one.
    ///
    /// Returns `0` while below `track_count`, otherwise the time until the
    /// oldest sample expires, or `i64::MAX` if samples never expire by age.
    pub fn next_blank_in_us(&mut self) -> i64 {
        let now = self.clock.now_us();
        self.remove_expired(now);
        if self.values.len() < self.track_count {
            return 0;
        }
        match self.values.front().and_then(|entry| entry.expiry_us) {
            Some(expiry) => (expiry - now).max(0),
            None => i64::MAX,
        }
    }
}
