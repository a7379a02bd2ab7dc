//! Cached monotonic clock.
//!
//! The engine reads the time once per loop iteration so every timer decision
//! made while handling that iteration agrees on what "now" is.

use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TimeCache {
    now: Instant,
    refreshes: u64,
}

impl TimeCache {
    /// Create a cache primed with the current time, so it is never read unset.
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            refreshes: 0,
        }
    }

    /// The cached timestamp.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Re-read the clock. Only called at the start of a loop iteration.
    pub(crate) fn refresh(&mut self) -> Instant {
        // never step backwards
        self.now = self.now.max(Instant::now());
        self.refreshes += 1;
        self.now
    }

    /// Bring a cache that has sat idle between iterations up to date,
    /// without counting an iteration.
    pub(crate) fn catch_up(&mut self) -> Instant {
        self.now = self.now.max(Instant::now());
        self.now
    }

    /// Number of iterations observed so far.
    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }
}

impl Default for TimeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cached_value_is_stable_between_refreshes() {
        let cache = TimeCache::new();
        let first = cache.now();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.now(), first);
    }

    #[test]
    fn test_refresh_moves_forward() {
        let mut cache = TimeCache::new();
        let first = cache.now();
        std::thread::sleep(Duration::from_millis(2));
        let second = cache.refresh();
        assert!(second > first);
        assert_eq!(cache.now(), second);
        assert_eq!(cache.refreshes(), 1);
    }

    #[test]
    fn test_catch_up_does_not_count_an_iteration() {
        let mut cache = TimeCache::new();
        let first = cache.now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.catch_up() > first);
        assert_eq!(cache.refreshes(), 0);
    }
}
