//! Retry policy and the retry state machine.
//!
//! Nothing here sleeps or reads the clock. The dispatcher drives the machine and does
//! the waiting; `delay_for` is a pure function of the attempt count and the jitter it
//! is handed.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt ceiling, first attempt included. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_backoff,
            max_delay: config.max_backoff,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt once `failed_attempts` attempts have failed:
    /// `base * 2^(failed_attempts - 1) + jitter`, capped at `max_delay`.
    ///
    /// Jitter is clamped to `max_jitter()`. Since that is a quarter of the base delay,
    /// the sequence of delays never decreases whatever jitter is drawn.
    pub fn delay_for(&self, failed_attempts: u32, jitter: Duration) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .saturating_add(jitter.min(self.max_jitter()))
            .min(self.max_delay)
    }

    pub fn max_jitter(&self) -> Duration {
        self.base_delay / 4
    }

    /// Draws a jitter in `[0, max_jitter()]`.
    pub fn sample_jitter(&self) -> Duration {
        let max_ms = self.max_jitter().as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// How a single attempt ended, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    Retryable,
    Fatal,
}

/// Idle → Attempting → (Succeeded | Retrying → Attempting | Failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

impl RetryState {
    pub fn start(self) -> Self {
        match self {
            RetryState::Idle => RetryState::Attempting { attempt: 1 },
            other => other,
        }
    }

    /// Applies the result of the attempt in flight. Other states are returned unchanged.
    pub fn on_result(self, result: AttemptResult, policy: &RetryPolicy, jitter: Duration) -> Self {
        let RetryState::Attempting { attempt } = self else {
            return self;
        };
        match result {
            AttemptResult::Success => RetryState::Succeeded { attempts: attempt },
            AttemptResult::Fatal => RetryState::Failed { attempts: attempt },
            AttemptResult::Retryable if attempt >= policy.max_attempts => {
                RetryState::Failed { attempts: attempt }
            }
            AttemptResult::Retryable => RetryState::Retrying {
                attempt,
                delay: policy.delay_for(attempt, jitter),
            },
        }
    }

    pub fn on_delay_elapsed(self) -> Self {
        match self {
            RetryState::Retrying { attempt, .. } => RetryState::Attempting {
                attempt: attempt + 1,
            },
            other => other,
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded { .. } | RetryState::Failed { .. })
    }
}
