//! DistributionGateway port - delivers a payload to its consumer.

use async_trait::async_trait;

use crate::domain::{DeliveryError, SignalKey};

/// Hands a fired signal to whatever consumes it.
///
/// Delivery is at-least-once: the same key may be delivered again after a
/// crash or a timeout, so consumers must be idempotent.
#[async_trait]
pub trait DistributionGateway: Send + Sync {
    async fn distribute(&self, key: &SignalKey, payload: &str) -> Result<(), DeliveryError>;
}
