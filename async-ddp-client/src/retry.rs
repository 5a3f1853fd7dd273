// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Backoff generators for reconnects and login retries.

use std::time::Duration;

/// Yields sleep durations that double on every call, from `initial_sleep`
/// up to `max_sleep`, for at most `max_retries` calls when a limit is set.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_sleep: Duration,
    max_retries: Option<u32>,
    current_sleep: Duration,
    retry_count: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff generator.
    pub fn new(max_sleep: Duration, max_retries: Option<u32>, initial_sleep: Duration) -> Self {
        Self {
            max_sleep,
            max_retries,
            current_sleep: initial_sleep,
            retry_count: 0,
        }
    }

    /// The delay the next call to [`Iterator::next`] will yield, if any.
    pub fn current(&self) -> Duration {
        self.current_sleep
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.max_retries.is_some_and(|max| self.retry_count >= max) {
            return None;
        }
        self.retry_count += 1;
        let sleep = self.current_sleep;
        self.current_sleep = (self.current_sleep * 2).min(self.max_sleep);
        Some(sleep)
    }
}

/// Reconnect policy of the session event loop. The protocol reconnects on
/// a fixed interval rather than an exponential curve; the policy type
/// exists so the event loop does not hard-code the schedule.
#[derive(Debug, Clone)]
pub struct SessionRetryPolicy {
    interval: Duration,
}

impl SessionRetryPolicy {
    /// Policy reconnecting every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(8000), None, Duration::from_millis(50));
        let delays: Vec<u64> = backoff.take(10).map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, [50, 100, 200, 400, 800, 1600, 3200, 6400, 8000, 8000]);
    }

    #[test]
    fn respects_retry_limit() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(30), Some(3), Duration::from_millis(500));
        assert_eq!(backoff.count(), 3);
    }
}
