// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Sliding-window counters for rate limiting.
//!
//! Windows live in a bounded LRU keyed by the composite
//! `identity|user|endpoint` string, so a scanner cycling identities cannot
//! grow memory without bound: the least-recently-touched windows simply
//! fall out.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;

/// Hit log for one composite key.
#[derive(Debug, Default)]
struct SlidingWindow {
    hits: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn prune(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = now - window;
        while self.hits.front().is_some_and(|t| *t < cutoff) {
            self.hits.pop_front();
        }
    }
}

/// Result of one window increment.
#[derive(Debug, Clone, Copy)]
pub struct WindowStatus {
    pub allowed: bool,
    /// Requests left in the window after this one (zero when denied).
    pub remaining: u32,
    /// When the oldest in-window hit ages out.
    pub reset_at: DateTime<Utc>,
}

/// Bounded table of sliding windows.
pub struct WindowTable {
    windows: Mutex<LruCache<String, SlidingWindow>>,
}

impl WindowTable {
    /// `capacity` bounds how many composite keys are tracked at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap()),
            )),
        }
    }

    /// Record one hit and report whether it fit under the ceiling.
    ///
    /// Denied hits are recorded too: hammering a limited endpoint keeps
    /// the window full rather than resetting it.
    pub fn increment(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> WindowStatus {
        let mut windows = self.windows.lock().expect("window table lock poisoned");
        let entry = windows.get_or_insert_mut(key.to_string(), SlidingWindow::default);
        entry.prune(window, now);

        let count_before = entry.hits.len() as u32;
        let allowed = count_before < max_requests;
        entry.hits.push_back(now);

        let reset_at = entry
            .hits
            .front()
            .map(|t| *t + window)
            .unwrap_or_else(|| now + window);

        WindowStatus {
            allowed,
            remaining: max_requests.saturating_sub(count_before + 1),
            reset_at,
        }
    }

    /// Drop windows whose newest hit is older than `max_age`.
    pub fn cleanup(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - max_age;
        let mut windows = self.windows.lock().expect("window table lock poisoned");

        let stale: Vec<String> = windows
            .iter()
            .filter(|(_, w)| w.hits.back().is_none_or(|t| *t < cutoff))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &stale {
            windows.pop(key);
        }
        stale.len()
    }

    /// Number of tracked keys (for cleanup accounting and tests).
    pub fn len(&self) -> usize {
        self.windows.lock().expect("window table lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_until_ceiling_then_denies() {
        let table = WindowTable::new(16);
        let now = Utc::now();

        for i in 0..5 {
            let status = table.increment("k", 5, Duration::minutes(15), now);
            assert!(status.allowed, "request {i} should pass");
        }
        let sixth = table.increment("k", 5, Duration::minutes(15), now);
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
    }

    #[test]
    fn window_slides() {
        let table = WindowTable::new(16);
        let start = Utc::now();

        for _ in 0..5 {
            table.increment("k", 5, Duration::minutes(15), start);
        }
        assert!(!table.increment("k", 5, Duration::minutes(15), start).allowed);

        // Sixteen minutes later the early hits have aged out.
        let later = start + Duration::minutes(16);
        assert!(table.increment("k", 5, Duration::minutes(15), later).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let table = WindowTable::new(16);
        let now = Utc::now();

        for _ in 0..5 {
            table.increment("a", 5, Duration::minutes(15), now);
        }
        assert!(!table.increment("a", 5, Duration::minutes(15), now).allowed);
        assert!(table.increment("b", 5, Duration::minutes(15), now).allowed);
    }

    #[test]
    fn lru_bound_caps_tracked_keys() {
        let table = WindowTable::new(2);
        let now = Utc::now();
        table.increment("a", 5, Duration::minutes(1), now);
        table.increment("b", 5, Duration::minutes(1), now);
        table.increment("c", 5, Duration::minutes(1), now);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn cleanup_drops_idle_windows() {
        let table = WindowTable::new(16);
        let old = Utc::now() - Duration::hours(3);
        table.increment("stale", 5, Duration::minutes(1), old);
        table.increment("fresh", 5, Duration::minutes(1), Utc::now());

        let dropped = table.cleanup(Duration::hours(1), Utc::now());
        assert_eq!(dropped, 1);
        assert_eq!(table.len(), 1);
    }
}
