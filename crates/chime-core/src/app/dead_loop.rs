//! DeadSignalProcessor - deletes terminal signals past their retention.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::config::DeadConfig;
use crate::domain::StoreError;
use crate::ports::{Clock, SignalStore};

pub struct DeadSignalProcessor {
    store: Arc<dyn SignalStore>,
    clock: Arc<dyn Clock>,
    config: DeadConfig,
}

impl DeadSignalProcessor {
    pub fn new(store: Arc<dyn SignalStore>, clock: Arc<dyn Clock>, config: DeadConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("dead signal processor started");
        loop {
            match self.clean_batch().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "dead signals removed"),
                Err(err) => warn!(error = %err, "dead signal cleanup failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        info!("dead signal processor stopped");
    }

    /// One sweep. Returns how many signals were deleted.
    pub async fn clean_batch(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut session = self.store.begin().await?;
        let count = session
            .clean_dead_signals(now, self.config.batch_size)
            .await?;
        session.commit().await?;
        Ok(count)
    }
}
