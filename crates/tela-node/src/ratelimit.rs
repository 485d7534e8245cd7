//! Sliding-window rate limiter.
//!
//! Used to bound responses that unauthenticated peers can trigger, such as
//! key-identifier directory requests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window rate limiter counting events over a fixed duration.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_events: usize,
    events: VecDeque<Instant>,
}

impl RateLimiter {
    /// Allow up to `max_events` per `window`.
    #[must_use]
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            window,
            max_events,
            events: VecDeque::with_capacity(max_events),
        }
    }

    /// Record an event if permitted; returns `false` when rate-limited.
    pub fn check_and_record(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() >= self.max_events {
            return false;
        }
        self.events.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_within_window() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check_and_record());
        assert!(!limiter.check_and_record());
    }

    #[test]
    fn window_expiry_allows_again() {
        let mut limiter = RateLimiter::new(2, Duration::from_millis(0));
        assert!(limiter.check_and_record());
        // Zero-length window: the first event expires immediately.
        assert!(limiter.check_and_record());
        assert!(limiter.check_and_record());
    }
}
