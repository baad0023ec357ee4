//! Domain model: signals, their state machine, policies and errors.

pub mod errors;
pub mod policy;
pub mod signal;
pub mod time;

pub use self::errors::{ChimeError, ConfigError, DeliveryError, SignalError, StoreError};
pub use self::policy::{DistributionPolicy, FailureDecision};
pub use self::signal::{Signal, SignalKey, SignalState};
