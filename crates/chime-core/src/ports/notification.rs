//! Notification ports - best-effort cross-process wake-up hints.
//!
//! Correctness never depends on these: without them distributors still find
//! every signal on their regular poll cadence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Producer side. Fire-and-forget.
pub trait NotificationPublisher: Send + Sync {
    fn publish_potential_next_fire_time(&self, fire_time: DateTime<Utc>);
}

/// Receives published fire times.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle_potential_next_fire_time(&self, fire_time: DateTime<Utc>);
}

/// Consumer side. Delivers each published hint to every registered handler.
#[async_trait]
pub trait NotificationSubscriber: Send + Sync {
    fn register_handler(&self, handler: Arc<dyn NotificationHandler>);

    /// Receive hints until cancelled or the transport closes.
    async fn run(&self, cancel: CancellationToken);
}

/// Publisher that drops every hint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl NotificationPublisher for NoopPublisher {
    fn publish_potential_next_fire_time(&self, _fire_time: DateTime<Utc>) {}
}
