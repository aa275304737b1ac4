//! Per-slot refresh timers.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ShieldConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running(Instant),
    /// Forced to expire on the next check.
    Fired,
}

/// One-shot timer polled by the cache update.
#[derive(Debug, Clone)]
pub struct CacheTimer {
    state: TimerState,
    period: Duration,
}

impl CacheTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            state: TimerState::Stopped,
            period,
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn start(&mut self, now: Instant) {
        self.state = TimerState::Running(now + self.period);
    }

    pub fn stop(&mut self) {
        self.state = TimerState::Stopped;
    }

    pub fn fire(&mut self) {
        self.state = TimerState::Fired;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, TimerState::Running(_))
    }

    /// True once if the timer fired or its deadline passed. The timer is
    /// stopped afterwards; callers restart it when appropriate.
    pub fn take_fired(&mut self, now: Instant) -> bool {
        let fired = match self.state {
            TimerState::Stopped => false,
            TimerState::Running(deadline) => now >= deadline,
            TimerState::Fired => true,
        };
        if fired {
            self.state = TimerState::Stopped;
        }
        fired
    }
}

/// The three timers of a socket slot.
#[derive(Debug, Clone)]
pub struct SlotTimers {
    /// Refresh of the receivable byte count.
    pub rxlen: CacheTimer,
    /// Refresh of the connection state.
    pub state: CacheTimer,
    /// Flush of a partially filled write cache.
    pub write: CacheTimer,
}

impl SlotTimers {
    pub fn new(config: &ShieldConfig) -> Self {
        Self {
            rxlen: CacheTimer::new(config.rxlen_refresh),
            state: CacheTimer::new(config.state_refresh),
            write: CacheTimer::new(config.write_flush),
        }
    }

    /// Start the refresh timers; the write timer only runs while bytes are
    /// cached.
    pub fn start_refresh(&mut self, now: Instant) {
        self.rxlen.start(now);
        self.state.start(now);
        self.write.stop();
    }

    pub fn stop_all(&mut self) {
        self.rxlen.stop();
        self.state.stop();
        self.write.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_period() {
        let mut timer = CacheTimer::new(Duration::from_millis(50));
        timer.start(Instant::now());
        assert!(!timer.take_fired(Instant::now()));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(timer.take_fired(Instant::now()));
        // consumed
        assert!(!timer.take_fired(Instant::now()));
        assert_eq!(timer.state(), TimerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_fire() {
        let mut timer = CacheTimer::new(Duration::from_secs(60));
        timer.fire();
        assert!(timer.take_fired(Instant::now()));
    }

    #[test]
    fn test_stopped_timer_never_fires() {
        let mut timer = CacheTimer::new(Duration::ZERO);
        assert!(!timer.take_fired(Instant::now()));
        assert!(!timer.is_running());
    }
}
