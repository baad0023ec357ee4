//! SignalProcessingService - hosts every background loop of one process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::dead_loop::DeadSignalProcessor;
use crate::app::distributor::SignalDistributor;
use crate::app::zombie_loop::ZombieSignalProcessor;
use crate::ports::{NotificationHandler, NotificationSubscriber};

/// N distributors, one zombie processor, one dead-signal processor and the
/// optional notification subscriber, all stopped by one token.
pub struct SignalProcessingService {
    distributors: Vec<Arc<SignalDistributor>>,
    zombie: Arc<ZombieSignalProcessor>,
    dead: Arc<DeadSignalProcessor>,
    subscriber: Option<Arc<dyn NotificationSubscriber>>,
    handlers_registered: AtomicBool,
}

impl SignalProcessingService {
    pub(crate) fn new(
        distributors: Vec<Arc<SignalDistributor>>,
        zombie: ZombieSignalProcessor,
        dead: DeadSignalProcessor,
        subscriber: Option<Arc<dyn NotificationSubscriber>>,
    ) -> Self {
        Self {
            distributors,
            zombie: Arc::new(zombie),
            dead: Arc::new(dead),
            subscriber,
            handlers_registered: AtomicBool::new(false),
        }
    }

    pub fn distributors(&self) -> &[Arc<SignalDistributor>] {
        &self.distributors
    }

    /// Run all loops until `cancel` fires and every loop has stopped.
    pub async fn run(&self, cancel: CancellationToken) {
        if let Some(subscriber) = &self.subscriber
            && !self.handlers_registered.swap(true, Ordering::SeqCst)
        {
            for distributor in &self.distributors {
                let handler: Arc<dyn NotificationHandler> = distributor.clone();
                subscriber.register_handler(handler);
            }
        }

        info!(distributors = self.distributors.len(), "signal processing started");

        let mut loops = JoinSet::new();
        if let Some(subscriber) = &self.subscriber {
            let subscriber = Arc::clone(subscriber);
            let cancel = cancel.clone();
            loops.spawn(async move { subscriber.run(cancel).await });
        }
        {
            let zombie = Arc::clone(&self.zombie);
            let cancel = cancel.clone();
            loops.spawn(async move { zombie.run(cancel).await });
        }
        {
            let dead = Arc::clone(&self.dead);
            let cancel = cancel.clone();
            loops.spawn(async move { dead.run(cancel).await });
        }
        for distributor in &self.distributors {
            loops.spawn(Arc::clone(distributor).run(cancel.clone()));
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(join_error) = joined {
                warn!(%join_error, "processing loop terminated abnormally");
            }
        }
        info!("signal processing stopped");
    }
}
