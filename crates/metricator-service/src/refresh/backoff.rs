use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// How the delay between fetch attempts grows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Wait `delay` after every failure.
    #[default]
    Fixed,
    /// Double the delay after every failure, up to `max_delay`, with full jitter.
    Exponential,
}

/// Retry delay policy for fetch jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            delay,
            max_delay: delay,
        }
    }

    pub fn exponential(delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay,
            max_delay,
        }
    }

    /// The delay to wait after the `attempt`-th failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let cap = self.ceiling(attempt);
                if cap.is_zero() {
                    return cap;
                }
                rand::rng().random_range(cap / 2..=cap)
            }
        }
    }

    /// The largest delay [`delay_for`](Self::delay_for) may return for `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}
