//! Reconnect delay policy for the serve channel.
//!
//! Generic failures grow the delay by ×1.5 within `[min, max]`, so the
//! first retries come after 10, 15, 22.5 and 33.75 seconds. A `429` answer
//! jumps straight to the rate-limit delay. A successful session resets it.

use std::time::Duration;

use crate::config::DaemonConfig;
use crate::error::{Error, ErrorKind};

const FACTOR: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    min: Duration,
    max: Duration,
    rate_limit: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, rate_limit: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            min,
            max,
            rate_limit,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(
            Duration::from_secs(config.min_backoff_secs),
            Duration::from_secs(config.max_backoff_secs),
            Duration::from_secs(config.rate_limit_delay_secs),
        )
    }

    /// Record a failed dial and return how long to wait before the next one.
    pub fn fail(&mut self, err: &Error) -> Duration {
        self.delay = if err.kind() == ErrorKind::TooManyRequests {
            self.rate_limit
        } else {
            self.delay.mul_f64(FACTOR).clamp(self.min, self.max)
        };
        self.delay
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}
