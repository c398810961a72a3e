//! Fixed-window counter state shared by the in-memory quota store.

use chrono::{DateTime, TimeDelta, Utc};

/// Counter for a single quota key.
///
/// Invariant: `count <= max_requests` for the window ending at `resets_at`.
/// `resets_at` is normally `window_start + window`, but a server hint may push
/// it later (never earlier).
#[derive(Debug, Clone, PartialEq)]
pub struct FixedWindowCounter {
    count: u64,
    window_start: DateTime<Utc>,
    resets_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

impl FixedWindowCounter {
    pub fn new(now: DateTime<Utc>, window: TimeDelta) -> Self {
        Self {
            count: 0,
            window_start: now,
            resets_at: now + window,
            last_access: now,
        }
    }

    /// Start a fresh window if the current one has elapsed.
    pub fn roll(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        if now >= self.resets_at {
            self.count = 0;
            self.window_start = now;
            self.resets_at = now + window;
        }
        self.last_access = now;
    }

    pub fn has_budget(&self, max_requests: u64) -> bool {
        self.count < max_requests
    }

    pub fn remaining(&self, max_requests: u64) -> u64 {
        max_requests.saturating_sub(self.count)
    }

    pub fn increment(&mut self) {
        self.count += 1;
    }

    pub fn retry_after(&self, now: DateTime<Utc>) -> TimeDelta {
        (self.resets_at - now).max(TimeDelta::zero())
    }

    /// Adopt the server's view of the window if it reports less budget than we think we have.
    /// Returns `true` if local state changed. Applying the same hint twice is a no-op.
    pub fn tighten(
        &mut self,
        max_requests: u64,
        server_remaining: u64,
        server_resets_at: DateTime<Utc>,
    ) -> bool {
        if server_remaining >= self.remaining(max_requests) {
            return false;
        }
        self.count = max_requests - server_remaining;
        self.resets_at = self.resets_at.max(server_resets_at);
        true
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        self.resets_at
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        self.last_access
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(ms)
    }

    #[test]
    fn test_counter_resets_after_window() {
        let window = TimeDelta::seconds(1);
        let mut counter = FixedWindowCounter::new(at_ms(0), window);
        for _ in 0..5 {
            counter.increment();
        }
        assert!(!counter.has_budget(5));

        counter.roll(at_ms(999), window);
        assert_eq!(counter.count(), 5, "window has not elapsed yet");

        counter.roll(at_ms(1_100), window);
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.window_start(), at_ms(1_100));
        assert_eq!(counter.resets_at(), at_ms(2_100));
    }

    #[test]
    fn test_retry_after_counts_down() {
        let counter = FixedWindowCounter::new(at_ms(0), TimeDelta::seconds(1));
        assert_eq!(counter.retry_after(at_ms(500)), TimeDelta::milliseconds(500));
        assert_eq!(counter.retry_after(at_ms(1_500)), TimeDelta::zero());
    }

    #[test]
    fn test_tighten_only_reduces_budget() {
        let mut counter = FixedWindowCounter::new(at_ms(0), TimeDelta::seconds(1));
        counter.increment();

        // Server reports more budget than we have locally: ignored
        assert!(!counter.tighten(10, 50, at_ms(60_000)));
        assert_eq!(counter.remaining(10), 9);
        assert_eq!(counter.resets_at(), at_ms(1_000));

        // Server reports less: adopt both the remaining budget and the later reset
        assert!(counter.tighten(10, 2, at_ms(5_000)));
        assert_eq!(counter.remaining(10), 2);
        assert_eq!(counter.resets_at(), at_ms(5_000));

        // Idempotent
        assert!(!counter.tighten(10, 2, at_ms(5_000)));
        assert_eq!(counter.remaining(10), 2);
    }

    #[test]
    fn test_tighten_never_moves_reset_earlier() {
        let mut counter = FixedWindowCounter::new(at_ms(0), TimeDelta::seconds(10));
        assert!(counter.tighten(10, 0, at_ms(1_000)));
        assert_eq!(counter.resets_at(), at_ms(10_000));
        assert!(!counter.has_budget(10));
    }
}
