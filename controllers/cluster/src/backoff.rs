//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciles, in minutes: 1, 1, 2, 3, 5, 8, then 10
//! forever. Each cluster keeps its own position in the sequence, which resets
//! after a successful reconcile.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fibonacci sequence in minutes, capped at `max_minutes`
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    max_minutes: u64,
    prev: u64,
    current: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            max_minutes,
            prev: 0,
            current: min_minutes,
        }
    }

    /// Current delay; advances the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current * 60);
        let next = (self.prev + self.current).min(self.max_minutes);
        self.prev = self.current;
        self.current = next;
        delay
    }

    pub fn reset(&mut self) {
        self.prev = 0;
        self.current = self.min_minutes;
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

/// Per-object backoff state, keyed by `namespace/name`
#[derive(Debug, Clone, Default)]
pub struct BackoffTracker {
    states: Arc<Mutex<HashMap<String, FibonacciBackoff>>>,
}

impl BackoffTracker {
    /// Delay before retrying `key` after another failure
    pub fn on_error(&self, key: &str) -> Duration {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.entry(key.to_string()).or_default().next_backoff()
    }

    pub fn on_success(&self, key: &str) {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(d: Duration) -> u64 {
        d.as_secs() / 60
    }

    #[test]
    fn test_sequence_caps_at_ten_minutes() {
        let mut backoff = FibonacciBackoff::default();
        let seq: Vec<u64> = (0..9).map(|_| minutes(backoff.next_backoff())).collect();
        assert_eq!(seq, vec![1, 1, 2, 3, 5, 8, 10, 10, 10]);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = FibonacciBackoff::default();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(minutes(backoff.next_backoff()), 1);
        assert_eq!(minutes(backoff.next_backoff()), 1);
        assert_eq!(minutes(backoff.next_backoff()), 2);
    }

    #[test]
    fn test_tracker_keys_are_independent() {
        let tracker = BackoffTracker::default();
        assert_eq!(minutes(tracker.on_error("ns/a")), 1);
        assert_eq!(minutes(tracker.on_error("ns/a")), 1);
        assert_eq!(minutes(tracker.on_error("ns/a")), 2);
        assert_eq!(minutes(tracker.on_error("ns/b")), 1);

        tracker.on_success("ns/a");
        assert_eq!(minutes(tracker.on_error("ns/a")), 1);
    }
}
