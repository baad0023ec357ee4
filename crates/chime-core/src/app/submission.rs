//! SignalSubmitter - producer-side API: submit, batch submit, cancel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::domain::{ChimeError, Signal, SignalKey, SignalState};
use crate::ports::{NotificationPublisher, SignalStore};

/// What a producer hands in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSubmission {
    pub group: String,
    pub local_id: Ulid,
    pub payload: String,
    pub fire_time: DateTime<Utc>,
}

impl SignalSubmission {
    pub fn new(
        group: impl Into<String>,
        payload: impl Into<String>,
        fire_time: DateTime<Utc>,
    ) -> Self {
        Self {
            group: group.into(),
            local_id: Ulid::new(),
            payload: payload.into(),
            fire_time,
        }
    }

    pub fn key(&self) -> SignalKey {
        SignalKey::new(self.group.clone(), self.local_id)
    }

    fn into_signal(self) -> Signal {
        let key = SignalKey::new(self.group, self.local_id);
        Signal::new(key, self.payload, self.fire_time)
    }
}

pub struct SignalSubmitter {
    store: Arc<dyn SignalStore>,
    publisher: Arc<dyn NotificationPublisher>,
}

impl SignalSubmitter {
    pub fn new(store: Arc<dyn SignalStore>, publisher: Arc<dyn NotificationPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Store one Pending signal and hint its fire time to the distributors.
    ///
    /// A key that already exists fails with [`StoreError::Conflict`](crate::domain::StoreError::Conflict).
    pub async fn submit(&self, submission: SignalSubmission) -> Result<SignalKey, ChimeError> {
        let fire_time = submission.fire_time;
        let signal = submission.into_signal();
        let key = signal.key().clone();

        let mut session = self.store.begin().await?;
        session.add(signal);
        session.commit().await?;

        debug!(%key, %fire_time, "signal submitted");
        self.publisher.publish_potential_next_fire_time(fire_time);
        Ok(key)
    }

    /// Store all signals in one session; either all are stored or none.
    ///
    /// Only the earliest fire time is published. An empty batch does nothing.
    pub async fn submit_batch(
        &self,
        submissions: Vec<SignalSubmission>,
    ) -> Result<Vec<SignalKey>, ChimeError> {
        let Some(earliest) = submissions.iter().map(|s| s.fire_time).min() else {
            return Ok(Vec::new());
        };

        let mut session = self.store.begin().await?;
        let mut keys = Vec::with_capacity(submissions.len());
        for submission in submissions {
            let signal = submission.into_signal();
            keys.push(signal.key().clone());
            session.add(signal);
        }
        session.commit().await?;

        debug!(count = keys.len(), %earliest, "signal batch submitted");
        self.publisher.publish_potential_next_fire_time(earliest);
        Ok(keys)
    }

    /// Delete a signal that has not started processing.
    ///
    /// Returns `false`, leaving the signal untouched, when it is missing,
    /// Processing or already terminal.
    pub async fn cancel(&self, key: &SignalKey) -> Result<bool, ChimeError> {
        let mut session = self.store.begin().await?;
        let Some(signal) = session.get_signal(key).await? else {
            return Ok(false);
        };
        if signal.state() != SignalState::Pending {
            debug!(%key, state = %signal.state(), "signal not cancellable");
            return Ok(false);
        }

        session.remove(key.clone());
        session.commit().await?;
        debug!(%key, "signal cancelled");
        Ok(true)
    }
}
