//! InMemorySignalStore - transactional store for tests, demos and single-process use.
//!
//! Mirrors the locking discipline a SQL store provides with
//! `SELECT ... FOR UPDATE [SKIP LOCKED]`:
//! - every row a session reads is locked by that session until commit/drop
//! - `get_signal` waits for a lock held by another session
//! - batch reads skip rows locked by other sessions

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::domain::{Signal, SignalKey, SignalState, StoreError};
use crate::observability::SignalCounts;
use crate::ports::{SignalSession, SignalStore};

type SessionId = u64;

#[derive(Default)]
struct StoreState {
    rows: HashMap<SignalKey, Signal>,

    /// Row locks: key -> owning session.
    locks: HashMap<SignalKey, SessionId>,

    next_session_id: SessionId,
}

#[derive(Default)]
struct Shared {
    state: Mutex<StoreState>,

    /// Woken whenever a session releases its row locks.
    unlocked: Notify,

    unavailable: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory implementation of [`SignalStore`].
///
/// Cloning shares the same underlying rows.
#[derive(Clone, Default)]
pub struct InMemorySignalStore {
    shared: Arc<Shared>,
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed state of one signal, without taking a lock.
    pub fn get(&self, key: &SignalKey) -> Option<Signal> {
        self.shared.lock().rows.get(key).cloned()
    }

    /// All committed signals.
    pub fn signals(&self) -> Vec<Signal> {
        self.shared.lock().rows.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts_by_state(&self) -> SignalCounts {
        let state = self.shared.lock();
        let mut counts = SignalCounts::default();
        for signal in state.rows.values() {
            counts.record(signal.state());
        }
        counts
    }

    /// Make `begin` fail with [`StoreError::Unavailable`] (outage simulation).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn begin(&self) -> Result<Box<dyn SignalSession>, StoreError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        let id = {
            let mut state = self.shared.lock();
            state.next_session_id += 1;
            state.next_session_id
        };
        Ok(Box::new(InMemorySession {
            id,
            shared: Arc::clone(&self.shared),
            held: HashSet::new(),
            staged: Vec::new(),
        }))
    }
}

enum StagedWrite {
    Add(Signal),
    Update(Signal),
    Remove(SignalKey),
}

struct InMemorySession {
    id: SessionId,
    shared: Arc<Shared>,
    held: HashSet<SignalKey>,
    staged: Vec<StagedWrite>,
}

fn locked_by_other(locks: &HashMap<SignalKey, SessionId>, key: &SignalKey, id: SessionId) -> bool {
    locks.get(key).is_some_and(|&owner| owner != id)
}

impl InMemorySession {
    /// Lock and clone the rows matching `filter`, ordered by `order`.
    fn select_skip_locked<F, K>(&mut self, max_count: usize, filter: F, order: K) -> Vec<Signal>
    where
        F: Fn(&Signal) -> bool,
        K: Fn(&Signal) -> Option<DateTime<Utc>>,
    {
        let mut guard = self.shared.lock();
        let StoreState { rows, locks, .. } = &mut *guard;

        let mut selected: Vec<&Signal> = rows
            .values()
            .filter(|signal| filter(signal) && !locked_by_other(locks, signal.key(), self.id))
            .collect();
        selected.sort_by_key(|signal| (order(signal), signal.key().clone()));
        selected.truncate(max_count);

        let selected: Vec<Signal> = selected.into_iter().cloned().collect();
        for signal in &selected {
            locks.insert(signal.key().clone(), self.id);
            self.held.insert(signal.key().clone());
        }
        selected
    }

    fn release_locks(&mut self, state: &mut StoreState) {
        for key in self.held.drain() {
            if state.locks.get(&key) == Some(&self.id) {
                state.locks.remove(&key);
            }
        }
    }
}

#[async_trait]
impl SignalSession for InMemorySession {
    async fn get_signal(&mut self, key: &SignalKey) -> Result<Option<Signal>, StoreError> {
        loop {
            let notified = {
                let mut state = self.shared.lock();
                if locked_by_other(&state.locks, key, self.id) {
                    // Enabled while the guard is held: a release in between still wakes us.
                    let mut notified = Box::pin(self.shared.unlocked.notified());
                    notified.as_mut().enable();
                    notified
                } else {
                    let row = state.rows.get(key).cloned();
                    if row.is_some() {
                        state.locks.insert(key.clone(), self.id);
                        self.held.insert(key.clone());
                    }
                    return Ok(row);
                }
            };
            notified.await;
        }
    }

    async fn next_fire_time(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.shared.lock();
        Ok(state
            .rows
            .values()
            .filter(|signal| signal.state() == SignalState::Pending)
            .map(Signal::next_fire_time)
            .min())
    }

    async fn ready_signals(
        &mut self,
        now: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Signal>, StoreError> {
        Ok(self.select_skip_locked(
            max_count,
            |signal| signal.is_ready(now),
            |signal| Some(signal.next_fire_time()),
        ))
    }

    async fn zombie_signals(
        &mut self,
        now: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Signal>, StoreError> {
        Ok(self.select_skip_locked(
            max_count,
            |signal| signal.is_zombie(now),
            Signal::processing_timeout,
        ))
    }

    async fn clean_dead_signals(
        &mut self,
        now: DateTime<Utc>,
        max_count: usize,
    ) -> Result<usize, StoreError> {
        let dead = self.select_skip_locked(max_count, |signal| signal.is_dead(now), Signal::dead_time);
        let count = dead.len();
        self.staged
            .extend(dead.into_iter().map(|signal| StagedWrite::Remove(signal.key().clone())));
        Ok(count)
    }

    fn add(&mut self, signal: Signal) {
        self.staged.push(StagedWrite::Add(signal));
    }

    fn update(&mut self, signal: Signal) {
        self.staged.push(StagedWrite::Update(signal));
    }

    fn remove(&mut self, key: SignalKey) {
        self.staged.push(StagedWrite::Remove(key));
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let staged = std::mem::take(&mut self.staged);
        let shared = Arc::clone(&self.shared);
        {
            let mut state = shared.lock();

            let mut adding = HashSet::new();
            for write in &staged {
                if let StagedWrite::Add(signal) = write
                    && (state.rows.contains_key(signal.key()) || !adding.insert(signal.key()))
                {
                    return Err(StoreError::Conflict(signal.key().clone()));
                }
            }

            for write in staged {
                match write {
                    StagedWrite::Add(signal) => {
                        state.rows.insert(signal.key().clone(), signal);
                    }
                    StagedWrite::Update(signal) => {
                        if let Some(row) = state.rows.get_mut(signal.key()) {
                            *row = signal;
                        }
                    }
                    StagedWrite::Remove(key) => {
                        state.rows.remove(&key);
                    }
                }
            }

            self.release_locks(&mut state);
        }
        shared.unlocked.notify_waiters();
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        {
            let mut state = shared.lock();
            self.release_locks(&mut state);
        }
        shared.unlocked.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn signal_at(offset_secs: i64) -> Signal {
        Signal::new(
            SignalKey::new("test", Ulid::new()),
            "payload",
            t0() + chrono::Duration::seconds(offset_secs),
        )
    }

    async fn seed(store: &InMemorySignalStore, signals: &[Signal]) {
        let mut session = store.begin().await.unwrap();
        for signal in signals {
            session.add(signal.clone());
        }
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn ready_signals_are_ordered_and_bounded() {
        let store = InMemorySignalStore::new();
        let late = signal_at(-1);
        let early = signal_at(-30);
        let future = signal_at(60);
        seed(&store, &[late.clone(), early.clone(), future]).await;

        let mut session = store.begin().await.unwrap();
        let ready = session.ready_signals(t0(), 10).await.unwrap();
        let keys: Vec<_> = ready.iter().map(|s| s.key().clone()).collect();
        assert_eq!(keys, vec![early.key().clone(), late.key().clone()]);

        let mut other = store.begin().await.unwrap();
        assert!(other.ready_signals(t0(), 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_signal() {
        let store = InMemorySignalStore::new();
        let signal = signal_at(0);
        seed(&store, &[signal.clone()]).await;

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        let claimed_first = first.ready_signals(t0(), 10).await.unwrap();
        let claimed_second = second.ready_signals(t0(), 10).await.unwrap();

        assert_eq!(claimed_first.len(), 1);
        assert!(claimed_second.is_empty());

        let mut claimed = claimed_first.into_iter().next().unwrap();
        claimed.attempt(t0(), Duration::from_secs(5)).unwrap();
        first.update(claimed);
        first.commit().await.unwrap();

        assert!(second.ready_signals(t0(), 10).await.unwrap().is_empty());
        assert_eq!(
            store.get(signal.key()).unwrap().state(),
            SignalState::Processing
        );
    }

    #[tokio::test]
    async fn dropped_session_rolls_back_and_unlocks() {
        let store = InMemorySignalStore::new();
        let signal = signal_at(0);
        seed(&store, &[signal.clone()]).await;

        {
            let mut session = store.begin().await.unwrap();
            let mut claimed = session.ready_signals(t0(), 1).await.unwrap().remove(0);
            claimed.attempt(t0(), Duration::from_secs(5)).unwrap();
            session.update(claimed);
        }

        assert_eq!(store.get(signal.key()).unwrap().state(), SignalState::Pending);
        let mut session = store.begin().await.unwrap();
        assert_eq!(session.ready_signals(t0(), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_add_conflicts_and_applies_nothing() {
        let store = InMemorySignalStore::new();
        let existing = signal_at(0);
        seed(&store, &[existing.clone()]).await;

        let fresh = signal_at(0);
        let mut session = store.begin().await.unwrap();
        session.add(fresh.clone());
        session.add(existing.clone());
        let err = session.commit().await.unwrap_err();

        assert_eq!(err, StoreError::Conflict(existing.key().clone()));
        assert!(store.get(fresh.key()).is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn get_signal_waits_for_row_lock() {
        let store = InMemorySignalStore::new();
        let signal = signal_at(0);
        seed(&store, &[signal.clone()]).await;

        let mut holder = store.begin().await.unwrap();
        let mut claimed = holder.ready_signals(t0(), 1).await.unwrap().remove(0);

        let waiter = tokio::spawn({
            let store = store.clone();
            let key = signal.key().clone();
            async move {
                let mut session = store.begin().await.unwrap();
                session.get_signal(&key).await.unwrap().unwrap().state()
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        claimed.attempt(t0(), Duration::from_secs(5)).unwrap();
        holder.update(claimed);
        holder.commit().await.unwrap();

        let observed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed, SignalState::Processing);
    }

    #[tokio::test]
    async fn next_fire_time_is_min_over_pending() {
        let store = InMemorySignalStore::new();
        let mut session = store.begin().await.unwrap();
        assert_eq!(session.next_fire_time().await.unwrap(), None);
        drop(session);

        seed(&store, &[signal_at(30), signal_at(-5), signal_at(10)]).await;
        let mut session = store.begin().await.unwrap();
        assert_eq!(
            session.next_fire_time().await.unwrap(),
            Some(t0() - chrono::Duration::seconds(5))
        );
    }

    #[tokio::test]
    async fn clean_dead_signals_only_touches_expired_terminal_rows() {
        let store = InMemorySignalStore::new();
        let pending_old = signal_at(-3600);

        let mut expired = signal_at(-3600);
        expired.attempt(t0(), Duration::from_secs(1)).unwrap();
        expired.complete(t0() - chrono::Duration::seconds(120), Duration::from_secs(60)).unwrap();

        let mut retained = signal_at(-3600);
        retained.attempt(t0(), Duration::from_secs(1)).unwrap();
        retained.fail(t0(), Duration::from_secs(60)).unwrap();

        seed(&store, &[pending_old.clone(), expired.clone(), retained.clone()]).await;

        let mut session = store.begin().await.unwrap();
        assert_eq!(session.clean_dead_signals(t0(), 10).await.unwrap(), 1);
        session.commit().await.unwrap();

        assert!(store.get(expired.key()).is_none());
        assert!(store.get(retained.key()).is_some());
        assert!(store.get(pending_old.key()).is_some());
    }

    #[tokio::test]
    async fn unavailable_store_refuses_sessions() {
        let store = InMemorySignalStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.begin().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.begin().await.is_ok());
    }

    #[tokio::test]
    async fn counts_by_state_reflects_rows() {
        let store = InMemorySignalStore::new();
        let mut processing = signal_at(0);
        processing.attempt(t0(), Duration::from_secs(1)).unwrap();
        seed(&store, &[signal_at(0), signal_at(5), processing]).await;

        let counts = store.counts_by_state();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.total(), 3);
        assert!(!counts.is_settled());
    }
}
