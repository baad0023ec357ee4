//! ZombieSignalProcessor - reclaims signals stuck in Processing.
//!
//! A signal stays Processing past its timeout when the distributor that
//! claimed it crashed or its delivery was abandoned. Reclaiming counts as a
//! failed attempt: retry if the policy allows, otherwise fail.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::config::ZombieConfig;
use crate::domain::{ChimeError, FailureDecision};
use crate::ports::{Clock, DistributionPolicyProvider, SignalStore};

pub struct ZombieSignalProcessor {
    store: Arc<dyn SignalStore>,
    policies: Arc<dyn DistributionPolicyProvider>,
    clock: Arc<dyn Clock>,
    config: ZombieConfig,
}

impl ZombieSignalProcessor {
    pub fn new(
        store: Arc<dyn SignalStore>,
        policies: Arc<dyn DistributionPolicyProvider>,
        clock: Arc<dyn Clock>,
        config: ZombieConfig,
    ) -> Self {
        Self {
            store,
            policies,
            clock,
            config,
        }
    }

    /// Sweep every `poll_interval`, first pass immediately, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("zombie signal processor started");
        loop {
            match self.reclaim_batch().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "zombie signals reclaimed"),
                Err(err @ ChimeError::Signal(_)) => error!(error = %err, "zombie reclaim failed"),
                Err(err) => warn!(error = %err, "zombie reclaim failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        info!("zombie signal processor stopped");
    }

    /// One sweep. Returns how many signals were reclaimed.
    ///
    /// Rows stay locked until commit, so a late settlement for the same signal
    /// waits and then finds it no longer Processing.
    pub async fn reclaim_batch(&self) -> Result<usize, ChimeError> {
        let now = self.clock.now();
        let mut session = self.store.begin().await?;
        let zombies = session.zombie_signals(now, self.config.batch_size).await?;
        let count = zombies.len();

        for mut signal in zombies {
            let policy = self.policies.policy_or_default(signal.group());
            let decision = signal.apply_failure(now, &policy)?;
            if decision == FailureDecision::Fail {
                warn!(key = %signal.key(), "zombie signal failed, retries exhausted");
            }
            session.update(signal);
        }

        session.commit().await?;
        Ok(count)
    }
}
