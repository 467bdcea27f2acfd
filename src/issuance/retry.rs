use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;

use crate::core::config::BackoffConfig;

/// Outcome of consulting a persisted polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Perform attempt number `attempt` (zero-based) now.
    Due { attempt: u32 },
    /// Too early; come back after the given delay.
    Wait(Duration),
    /// Every attempt has been spent.
    Exhausted,
}

/// Resumable bounded exponential backoff.
///
/// Holds no state of its own: callers persist `attempts` and `last_attempt`
/// in the resource status so a restart picks up where it left off.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay that must follow attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .config
            .initial_ms
            .saturating_mul(factor)
            .min(self.config.max_ms);
        Duration::from_millis(millis)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.config.max_attempts
    }

    pub fn poll(
        &self,
        attempts: u32,
        last_attempt: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Poll {
        if self.exhausted(attempts) {
            return Poll::Exhausted;
        }
        let Some(last) = last_attempt else {
            return Poll::Due { attempt: attempts };
        };
        let delay = self.delay_for(attempts.saturating_sub(1));
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= delay {
            Poll::Due { attempt: attempts }
        } else {
            let wait = delay - elapsed;
            debug!(
                "[retry] attempt {} of {} not due for {}ms",
                attempts + 1,
                self.config.max_attempts,
                wait.as_millis()
            );
            Poll::Wait(wait)
        }
    }
}
