//! A sliding-window event counter, shared by the auth rate limiter and the
//! cache's hit-ratio tracker.
//!
//! Adapted from the teacher daemon's per-account RPM/TPM tracker: events are
//! timestamped and evicted lazily on each access rather than on a timer, so
//! an idle window costs nothing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct SlidingWindow {
    window: Duration,
    max_count: u64,
    events: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(window: Duration, max_count: u64) -> Self {
        Self {
            window,
            max_count,
            events: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while self
            .events
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            self.events.pop_front();
        }
    }

    /// Record one event at `now`.
    pub fn record(&mut self, now: Instant) {
        self.evict(now);
        self.events.push_back(now);
    }

    /// Count of events currently inside the window.
    pub fn count(&mut self, now: Instant) -> u64 {
        self.evict(now);
        self.events.len() as u64
    }

    /// `true` once `count(now) >= max_count`.
    pub fn is_limited(&mut self, now: Instant) -> bool {
        self.count(now) >= self.max_count
    }
}

/// Unbounded rolling ratio counter (hits vs. total) over the last `window_size`
/// recorded outcomes — used by the cache's hit-ratio metric, which counts
/// *requests* rather than time, so it rides on a plain ring buffer instead of
/// `SlidingWindow`'s timestamp eviction.
pub struct RatioWindow {
    capacity: usize,
    outcomes: VecDeque<bool>,
    hits: u64,
}

impl RatioWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: VecDeque::with_capacity(capacity),
            hits: 0,
        }
    }

    pub fn record(&mut self, hit: bool) {
        if self.outcomes.len() >= self.capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                if evicted {
                    self.hits -= 1;
                }
            }
        }
        self.outcomes.push_back(hit);
        if hit {
            self.hits += 1;
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.hits as f64 / self.outcomes.len() as f64
        }
    }
}
