//! Distribution policy: retry delays, processing timeout and retention.

use std::time::Duration;

use super::ConfigError;

/// Per-group delivery configuration.
///
/// `retry_delays[n]` is the delay scheduled after the `n`-th failed attempt
/// (0-indexed), so its length is the maximum number of retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPolicy {
    pub retry_delays: Vec<Duration>,

    /// How long a claim is held before the signal counts as a zombie.
    pub processing_timeout: Duration,

    /// How long a terminal signal is kept before reaping.
    pub retention_timeout: Duration,
}

/// What to do with a signal whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to Pending, eligible again after `delay`.
    Retry { delay: Duration },

    /// Retries exhausted: terminal Failed.
    Fail,
}

impl DistributionPolicy {
    pub fn new(
        retry_delays: Vec<Duration>,
        processing_timeout: Duration,
        retention_timeout: Duration,
    ) -> Self {
        Self {
            retry_delays,
            processing_timeout,
            retention_timeout,
        }
    }

    /// A zero processing timeout would expire every claim the moment it is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processing_timeout.is_zero() {
            return Err(ConfigError::Zero("processing_timeout"));
        }
        Ok(())
    }

    pub fn max_retry_attempts(&self) -> u32 {
        u32::try_from(self.retry_delays.len()).unwrap_or(u32::MAX)
    }

    /// Decide the next step for a signal that has already failed
    /// `retry_attempts` times before this failure.
    ///
    /// Pure function: the caller applies the decision to the signal.
    pub fn decide_failure(&self, retry_attempts: u32) -> FailureDecision {
        usize::try_from(retry_attempts)
            .ok()
            .and_then(|index| self.retry_delays.get(index))
            .map_or(FailureDecision::Fail, |&delay| FailureDecision::Retry {
                delay,
            })
    }
}

impl Default for DistributionPolicy {
    fn default() -> Self {
        Self {
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(120),
                Duration::from_secs(600),
            ],
            processing_timeout: Duration::from_secs(60),
            retention_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}
