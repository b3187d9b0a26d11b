//! Fibonacci back-off for retrying transient transport failures.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Yields `base * fib(n)` delays (1, 1, 2, 3, 5, ...), capped at `max_delay`,
/// and stops after `max_retries` values.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    base: Duration,
    max_delay: Duration,
    remaining: u32,
    current: u64,
    next: u64,
}

impl FibonacciBackoff {
    pub fn new(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay,
            remaining: max_retries,
            current: 1,
            next: 1,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay(), config.max_retries)
    }
}

impl Iterator for FibonacciBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let factor = u32::try_from(self.current).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let following = self.current.saturating_add(self.next);
        self.current = self.next;
        self.next = following;
        Some(delay)
    }
}
