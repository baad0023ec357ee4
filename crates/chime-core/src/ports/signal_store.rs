//! SignalStore port - the durable, transactional source of truth.
//!
//! A session is one transaction. Rows returned by the read methods stay
//! locked by the session until it commits or is dropped, so concurrent
//! claimers never see the same signal twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Signal, SignalKey, StoreError};

/// Opens transactional sessions.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Begin a session. Dropping it without [`SignalSession::commit`] rolls back.
    async fn begin(&self) -> Result<Box<dyn SignalSession>, StoreError>;
}

/// One store transaction.
///
/// Staged writes (`add`, `update`, `remove`) become visible to other sessions
/// only at `commit`, all together or not at all.
#[async_trait]
pub trait SignalSession: Send {
    /// Read one signal, locking its row. Waits while another session holds the lock.
    async fn get_signal(&mut self, key: &SignalKey) -> Result<Option<Signal>, StoreError>;

    /// Earliest `next_fire_time` over all Pending signals.
    async fn next_fire_time(&mut self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Pending signals with `next_fire_time <= now`, earliest first.
    /// Rows locked by other sessions are skipped.
    async fn ready_signals(
        &mut self,
        now: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Signal>, StoreError>;

    /// Processing signals with `processing_timeout <= now`, earliest timeout first.
    /// Rows locked by other sessions are skipped.
    async fn zombie_signals(
        &mut self,
        now: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Signal>, StoreError>;

    /// Stage deletion of up to `max_count` terminal signals with `dead_time <= now`.
    /// Returns how many were staged.
    async fn clean_dead_signals(
        &mut self,
        now: DateTime<Utc>,
        max_count: usize,
    ) -> Result<usize, StoreError>;

    fn add(&mut self, signal: Signal);

    /// Stage the new state of a signal read through this session.
    fn update(&mut self, signal: Signal);

    fn remove(&mut self, key: SignalKey);

    /// Apply staged writes atomically and release row locks.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
