//! Error types, one enum per concern.

use thiserror::Error;

use super::{SignalKey, SignalState};

/// Out-of-state transition. Indicates a logic defect, never an operational fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("invalid transition: cannot {action} signal {key} in state {state}")]
    InvalidTransition {
        key: SignalKey,
        state: SignalState,
        action: &'static str,
    },
}

/// Store faults. All are treated as transient by the loops.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("signal {0} already exists")]
    Conflict(SignalKey),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Any failure to deliver a payload. The distributor never inspects the reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

impl DeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Invalid configuration, detected before any loop starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("duplicate policy for group {0}")]
    DuplicatePolicy(String),

    #[error("a default policy is required")]
    MissingDefaultPolicy,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{min} must not exceed {max}")]
    InvertedRange {
        min: &'static str,
        max: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ChimeError {
    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
