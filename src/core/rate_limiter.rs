//! Rate limiting module to prevent abuse

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window message limiter owned by a single session.
///
/// Keeps the timestamps of accepted sends inside the trailing window, so the
/// count is exact rather than approximated by a token bucket. The lock is
/// per session; sessions never contend with each other.
pub struct MessageRateLimiter {
    message_times: Mutex<VecDeque<Instant>>,
    max_messages: usize,
    window_duration: Duration,
}

impl MessageRateLimiter {
    pub fn new(max_messages: usize, window_duration: Duration) -> Self {
        Self {
            message_times: Mutex::new(VecDeque::with_capacity(max_messages)),
            max_messages,
            window_duration,
        }
    }

    /// Record a send if the window has room for it
    pub fn check_and_record(&self) -> bool {
        self.check_and_record_at(Instant::now())
    }

    /// Number of sends still allowed in the current window
    pub fn remaining(&self) -> usize {
        self.remaining_at(Instant::now())
    }

    pub(crate) fn check_and_record_at(&self, now: Instant) -> bool {
        let mut times = self
            .message_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut times, now);

        if times.len() >= self.max_messages {
            return false;
        }
        times.push_back(now);
        true
    }

    pub(crate) fn remaining_at(&self, now: Instant) -> usize {
        let mut times = self
            .message_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut times, now);
        self.max_messages.saturating_sub(times.len())
    }

    // Timestamps are pushed in order, so expired ones are always at the front
    fn prune(&self, times: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = times.front() {
            if now.saturating_duration_since(oldest) >= self.window_duration {
                times.pop_front();
            } else {
                break;
            }
        }
    }
}
