//! Bounded retry schedule for teardown operations
//!
//! Unmounting a busy fuse mount usually succeeds once the last open file
//! handle is closed, so detach paths retry a few times with increasing
//! delays. The schedule is always finite.

use std::time::Duration;

/// Longest single wait between two attempts
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Doubling delays, at most `retries` of them, each capped at
/// [`MAX_RETRY_DELAY`]
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    next: Duration,
    remaining: u32,
    issued: u32,
}

impl RetrySchedule {
    pub fn new(first_delay: Duration, retries: u32) -> Self {
        RetrySchedule {
            next: first_delay.min(MAX_RETRY_DELAY),
            remaining: retries,
            issued: 0,
        }
    }

    /// Schedule starting at `base_delay_ms` milliseconds
    pub fn from_millis(base_delay_ms: u64, retries: u32) -> Self {
        Self::new(Duration::from_millis(base_delay_ms), retries)
    }

    /// Delays handed out so far
    pub fn issued(&self) -> u32 {
        self.issued
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

impl Iterator for RetrySchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.issued += 1;

        let delay = self.next;
        self.next = delay
            .checked_mul(2)
            .map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY));
        Some(delay)
    }
}
