//! Signal: the persistent unit of delayed work and its state machine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::errors::SignalError;
use super::policy::{DistributionPolicy, FailureDecision};
use super::time::add_duration;

/// Composite identity of a signal.
///
/// `group` selects the distribution policy, `local_id` is unique within the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalKey {
    pub group: String,
    pub local_id: Ulid,
}

impl SignalKey {
    pub fn new(group: impl Into<String>, local_id: Ulid) -> Self {
        Self {
            group: group.into(),
            local_id,
        }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.local_id)
    }
}

/// Signal state.
///
/// State transitions:
/// - Pending -> Processing (claim)
/// - Processing -> Pending (failed attempt, retry scheduled)
/// - Processing -> Success | Failed (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    /// Waiting for `next_fire_time`.
    Pending,

    /// Claimed by a distributor until `processing_timeout`.
    Processing,

    /// Delivered.
    Success,

    /// Retries exhausted.
    Failed,
}

impl SignalState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, SignalState::Success | SignalState::Failed)
    }
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalState::Pending => "pending",
            SignalState::Processing => "processing",
            SignalState::Success => "success",
            SignalState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A durable unit of delayed, at-least-once work.
///
/// Mutable fields are private so every change goes through a transition
/// method that checks the current state first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    key: SignalKey,
    payload: String,
    fire_time: DateTime<Utc>,

    state: SignalState,
    next_fire_time: DateTime<Utc>,
    processing_timeout: Option<DateTime<Utc>>,
    retry_attempts: u32,
    finalized_time: Option<DateTime<Utc>>,
    dead_time: Option<DateTime<Utc>>,
}

impl Signal {
    /// Create a new pending signal that becomes eligible at `fire_time`.
    pub fn new(key: SignalKey, payload: impl Into<String>, fire_time: DateTime<Utc>) -> Self {
        Self {
            key,
            payload: payload.into(),
            fire_time,
            state: SignalState::Pending,
            next_fire_time: fire_time,
            processing_timeout: None,
            retry_attempts: 0,
            finalized_time: None,
            dead_time: None,
        }
    }

    pub fn key(&self) -> &SignalKey {
        &self.key
    }

    pub fn group(&self) -> &str {
        &self.key.group
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    pub fn state(&self) -> SignalState {
        self.state
    }

    pub fn next_fire_time(&self) -> DateTime<Utc> {
        self.next_fire_time
    }

    pub fn processing_timeout(&self) -> Option<DateTime<Utc>> {
        self.processing_timeout
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn finalized_time(&self) -> Option<DateTime<Utc>> {
        self.finalized_time
    }

    pub fn dead_time(&self) -> Option<DateTime<Utc>> {
        self.dead_time
    }

    /// Claim the signal: Pending -> Processing.
    pub fn attempt(&mut self, now: DateTime<Utc>, timeout: Duration) -> Result<(), SignalError> {
        self.expect_state(SignalState::Pending, "attempt")?;
        self.state = SignalState::Processing;
        self.processing_timeout = Some(add_duration(now, timeout));
        Ok(())
    }

    /// Record a failed attempt and schedule the next one: Processing -> Pending.
    pub fn fail_attempt(&mut self, now: DateTime<Utc>, delay: Duration) -> Result<(), SignalError> {
        self.expect_state(SignalState::Processing, "fail_attempt")?;
        self.state = SignalState::Pending;
        self.processing_timeout = None;
        self.next_fire_time = add_duration(now, delay).max(self.fire_time);
        self.retry_attempts = self.retry_attempts.saturating_add(1);
        Ok(())
    }

    /// Mark delivered: Processing -> Success.
    pub fn complete(&mut self, now: DateTime<Utc>, retention: Duration) -> Result<(), SignalError> {
        self.expect_state(SignalState::Processing, "complete")?;
        self.finalize(SignalState::Success, now, retention);
        Ok(())
    }

    /// Give up: Processing -> Failed.
    pub fn fail(&mut self, now: DateTime<Utc>, retention: Duration) -> Result<(), SignalError> {
        self.expect_state(SignalState::Processing, "fail")?;
        self.finalize(SignalState::Failed, now, retention);
        Ok(())
    }

    /// Apply the policy's failure decision to a Processing signal.
    ///
    /// Used by both delivery settlement and zombie reclaim.
    pub fn apply_failure(
        &mut self,
        now: DateTime<Utc>,
        policy: &DistributionPolicy,
    ) -> Result<FailureDecision, SignalError> {
        let decision = policy.decide_failure(self.retry_attempts);
        match decision {
            FailureDecision::Retry { delay } => self.fail_attempt(now, delay)?,
            FailureDecision::Fail => self.fail(now, policy.retention_timeout)?,
        }
        Ok(decision)
    }

    fn finalize(&mut self, state: SignalState, now: DateTime<Utc>, retention: Duration) {
        self.state = state;
        self.processing_timeout = None;
        self.finalized_time = Some(now);
        self.dead_time = Some(add_duration(now, retention));
    }

    fn expect_state(&self, required: SignalState, action: &'static str) -> Result<(), SignalError> {
        if self.state == required {
            Ok(())
        } else {
            Err(SignalError::InvalidTransition {
                key: self.key.clone(),
                state: self.state,
                action,
            })
        }
    }

    /// Ready for a distributor to claim at `now`?
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == SignalState::Pending && self.next_fire_time <= now
    }

    /// Held in Processing past its timeout at `now`?
    pub fn is_zombie(&self, now: DateTime<Utc>) -> bool {
        self.state == SignalState::Processing
            && self.processing_timeout.is_some_and(|timeout| timeout <= now)
    }

    /// Terminal and past its retention window at `now`?
    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        self.state.is_terminal() && self.dead_time.is_some_and(|dead| dead <= now)
    }
}
