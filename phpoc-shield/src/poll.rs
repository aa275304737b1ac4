//! Deadline-bounded polling.
//!
//! Waiting for the shield always looks the same: check a condition, sleep,
//! check again, give up at a deadline. The sleep either grows (bus polls,
//! where the first answer is usually a few microseconds away) or stays fixed
//! (connection-state polls, where each check is a full command).
//!
//! The tokio timer ticks in milliseconds, so steps shorter than
//! [`TIMER_RESOLUTION`] yield to the scheduler and poll again instead of
//! sleeping. The curve still doubles through them, reaching real sleeps after
//! a handful of quick re-polls.

use std::time::Duration;

use tokio::task::yield_now;
use tokio::time::{sleep, Instant};

/// First delay of an exponential poll, about one 4-byte transfer.
pub const INITIAL_DELAY: Duration = Duration::from_micros(32);

/// Ceiling of the exponential delay.
pub const MAX_DELAY: Duration = Duration::from_micros(16384);

/// Shortest delay worth handing to the timer.
pub const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct Backoff {
    deadline: Option<Instant>,
    delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    /// Exponential backoff that gives up after `timeout`.
    pub fn exponential(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            delay: INITIAL_DELAY,
            max_delay: MAX_DELAY,
        }
    }

    /// Constant interval, bounded by `timeout` when one is given.
    pub fn fixed(interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            delay: interval,
            max_delay: interval,
        }
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Move the deadline to `timeout` from now and restart the delay curve.
    pub fn restart(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
        if self.max_delay != self.delay {
            self.delay = INITIAL_DELAY;
        }
    }

    /// Sleep before the next attempt. Returns `false` without sleeping once
    /// the deadline has passed.
    pub async fn wait(&mut self) -> bool {
        if self.expired() {
            return false;
        }
        if self.delay < TIMER_RESOLUTION {
            yield_now().await;
        } else {
            sleep(self.delay).await;
        }
        self.delay = (self.delay * 2).min(self.max_delay);
        true
    }
}
