//! InMemoryNotificationCenter - wake-up hints within one process.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ports::{NotificationHandler, NotificationPublisher, NotificationSubscriber};

const DEFAULT_CAPACITY: usize = 1024;

/// Hub handing out connected publishers and subscribers.
///
/// Every subscriber sees every hint published after it was created.
#[derive(Clone)]
pub struct InMemoryNotificationCenter {
    sender: broadcast::Sender<DateTime<Utc>>,
}

impl InMemoryNotificationCenter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a slow subscriber may lag before hints are dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publisher(&self) -> InMemoryNotificationPublisher {
        InMemoryNotificationPublisher {
            sender: self.sender.clone(),
        }
    }

    pub fn subscriber(&self) -> InMemoryNotificationSubscriber {
        InMemoryNotificationSubscriber {
            receiver: tokio::sync::Mutex::new(self.sender.subscribe()),
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryNotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct InMemoryNotificationPublisher {
    sender: broadcast::Sender<DateTime<Utc>>,
}

impl NotificationPublisher for InMemoryNotificationPublisher {
    fn publish_potential_next_fire_time(&self, fire_time: DateTime<Utc>) {
        // No subscribers is fine: hints are best-effort.
        if self.sender.send(fire_time).is_err() {
            debug!(%fire_time, "no subscriber for wake-up hint");
        }
    }
}

pub struct InMemoryNotificationSubscriber {
    receiver: tokio::sync::Mutex<broadcast::Receiver<DateTime<Utc>>>,
    handlers: RwLock<Vec<Arc<dyn NotificationHandler>>>,
}

impl InMemoryNotificationSubscriber {
    fn handlers(&self) -> Vec<Arc<dyn NotificationHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl NotificationSubscriber for InMemoryNotificationSubscriber {
    fn register_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    async fn run(&self, cancel: CancellationToken) {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            warn!("notification subscriber is already running");
            return;
        };

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv() => received,
            };

            match received {
                Ok(fire_time) => {
                    for handler in self.handlers() {
                        handler.handle_potential_next_fire_time(fire_time).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification subscriber lagged, hints dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("notification subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl NotificationHandler for Recorder {
        async fn handle_potential_next_fire_time(&self, fire_time: DateTime<Utc>) {
            self.seen.lock().await.push(fire_time);
        }
    }

    async fn wait_for(recorder: &Recorder, count: usize) -> Vec<DateTime<Utc>> {
        for _ in 0..100 {
            let seen = recorder.seen.lock().await.clone();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        recorder.seen.lock().await.clone()
    }

    #[tokio::test]
    async fn published_hints_reach_every_handler_of_every_subscriber() {
        let center = InMemoryNotificationCenter::new();
        let first = Arc::new(center.subscriber());
        let second = Arc::new(center.subscriber());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let c = Arc::new(Recorder::default());
        first.register_handler(a.clone());
        first.register_handler(b.clone());
        second.register_handler(c.clone());

        let cancel = CancellationToken::new();
        let runs = [
            tokio::spawn({
                let first = first.clone();
                let cancel = cancel.clone();
                async move { first.run(cancel).await }
            }),
            tokio::spawn({
                let second = second.clone();
                let cancel = cancel.clone();
                async move { second.run(cancel).await }
            }),
        ];

        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        center.publisher().publish_potential_next_fire_time(at);

        assert_eq!(wait_for(&a, 1).await, vec![at]);
        assert_eq!(wait_for(&b, 1).await, vec![at]);
        assert_eq!(wait_for(&c, 1).await, vec![at]);

        cancel.cancel();
        for run in runs {
            tokio::time::timeout(Duration::from_secs(1), run)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_fail() {
        let center = InMemoryNotificationCenter::new();
        center
            .publisher()
            .publish_potential_next_fire_time(Utc::now());
    }
}
