//! SignalDistributor - claims ready signals and hands them to the gateway.
//!
//! # Flow
//! 1. wait until `next_poll_at` (checked every idle tick)
//! 2. claim a batch: Pending -> Processing, one session
//! 3. deliver each claim as detached work bounded by its processing timeout
//! 4. settle each delivery in a fresh session (complete / retry / fail)
//! 5. reschedule: `next_poll_at` defaults to `now + max_poll_interval` and is
//!    pulled forward by the earliest pending fire time or by wake-up hints,
//!    never earlier than `now + min_poll_interval`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::config::DistributorConfig;
use crate::app::tracker::DetachedTaskTracker;
use crate::domain::time::add_duration;
use crate::domain::{
    ChimeError, DeliveryError, DistributionPolicy, FailureDecision, Signal, SignalKey, SignalState,
};
use crate::ports::{
    Clock, DistributionGateway, DistributionPolicyProvider, NotificationHandler, SignalStore,
};

#[derive(Debug, Clone, Copy)]
struct PollState {
    next_poll_at: DateTime<Utc>,
    min_next_poll_at: DateTime<Utc>,
}

/// A signal this distributor moved to Processing, with the policy it was claimed under.
struct Claim {
    signal: Signal,
    policy: Arc<DistributionPolicy>,
}

pub struct SignalDistributor {
    id: usize,
    store: Arc<dyn SignalStore>,
    gateway: Arc<dyn DistributionGateway>,
    policies: Arc<dyn DistributionPolicyProvider>,
    clock: Arc<dyn Clock>,
    config: DistributorConfig,

    poll: Mutex<PollState>,
    running: AtomicBool,
}

impl SignalDistributor {
    pub fn new(
        id: usize,
        store: Arc<dyn SignalStore>,
        gateway: Arc<dyn DistributionGateway>,
        policies: Arc<dyn DistributionPolicyProvider>,
        clock: Arc<dyn Clock>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            id,
            store,
            gateway,
            policies,
            clock,
            config,
            poll: Mutex::new(PollState {
                next_poll_at: DateTime::<Utc>::MAX_UTC,
                min_next_poll_at: DateTime::<Utc>::MAX_UTC,
            }),
            running: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll until `cancel` fires, then wait for in-flight deliveries to settle.
    ///
    /// A second concurrent call returns immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(distributor = self.id, "signal distributor is already running");
            return;
        }

        let tracker = Arc::new(DetachedTaskTracker::new());
        let supervisor = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { tracker.run().await }
        });

        self.seed_poll_state().await;
        info!(distributor = self.id, "signal distributor started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.poll_if_due(&tracker).await {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.idle_tick()) => {}
            }
        }

        info!(distributor = self.id, "signal distributor stopping, draining deliveries");
        tracker.drain_and_wait().await;
        if let Err(join_error) = supervisor.await {
            warn!(distributor = self.id, %join_error, "delivery supervisor failed");
        }
        self.running.store(false, Ordering::SeqCst);
        info!(distributor = self.id, "signal distributor stopped");
    }

    /// Move the next poll to `fire_time`, but never before `min_next_poll_at`.
    ///
    /// Ignored while the distributor is not running.
    pub async fn adjust_next_poll_time(&self, fire_time: DateTime<Utc>) {
        if !self.is_running() {
            return;
        }
        let mut poll = self.poll.lock().await;
        poll.next_poll_at = fire_time.max(poll.min_next_poll_at);
        debug!(distributor = self.id, next_poll_at = %poll.next_poll_at, "next poll adjusted");
    }

    async fn seed_poll_state(&self) {
        let jitter = {
            let min = self.config.startup_jitter_min_ms;
            let max = self.config.startup_jitter_max_ms.max(min);
            Duration::from_millis(rand::thread_rng().gen_range(min..=max))
        };
        let next_poll_at = add_duration(self.clock.now(), jitter);

        let mut poll = self.poll.lock().await;
        poll.next_poll_at = next_poll_at;
        poll.min_next_poll_at = add_duration(next_poll_at, self.config.min_poll_interval());
    }

    /// One iteration of the poll protocol.
    ///
    /// Returns `false` if the poll was not due or hit a store fault. After a
    /// fault the next poll is due at the `min_poll_interval` floor.
    async fn poll_if_due(self: &Arc<Self>, tracker: &DetachedTaskTracker) -> bool {
        let mut poll = self.poll.lock().await;
        let now = self.clock.now();
        if now < poll.next_poll_at {
            return false;
        }
        poll.min_next_poll_at = add_duration(now, self.config.min_poll_interval());

        match self.claim_ready(now).await {
            Ok(claims) => {
                if !claims.is_empty() {
                    debug!(distributor = self.id, count = claims.len(), "claimed signals");
                }
                for claim in claims {
                    self.dispatch(tracker, claim);
                }
            }
            Err(err) => {
                self.log_fault(&err, "claiming ready signals failed");
                poll.next_poll_at = poll.min_next_poll_at;
                return false;
            }
        }

        match self.earliest_pending().await {
            Ok(earliest) => {
                poll.next_poll_at = add_duration(now, self.config.max_poll_interval());
                if let Some(fire_time) = earliest {
                    poll.next_poll_at = poll.next_poll_at.min(fire_time.max(poll.min_next_poll_at));
                }
                true
            }
            Err(err) => {
                self.log_fault(&err, "reading next fire time failed");
                poll.next_poll_at = poll.min_next_poll_at;
                false
            }
        }
    }

    async fn claim_ready(&self, now: DateTime<Utc>) -> Result<Vec<Claim>, ChimeError> {
        let mut session = self.store.begin().await?;
        let ready = session.ready_signals(now, self.config.batch_size).await?;

        let mut claims = Vec::with_capacity(ready.len());
        for mut signal in ready {
            let policy = self.policies.policy_or_default(signal.group());
            signal.attempt(now, policy.processing_timeout)?;
            session.update(signal.clone());
            claims.push(Claim { signal, policy });
        }

        session.commit().await?;
        Ok(claims)
    }

    async fn earliest_pending(&self) -> Result<Option<DateTime<Utc>>, ChimeError> {
        let mut session = self.store.begin().await?;
        Ok(session.next_fire_time().await?)
    }

    fn dispatch(self: &Arc<Self>, tracker: &DetachedTaskTracker, claim: Claim) {
        let key = claim.signal.key().clone();
        let timeout = claim.policy.processing_timeout;
        let this = Arc::clone(self);
        if !tracker.track(this.distribute_signal(claim), timeout) {
            // Left in Processing; the zombie processor reclaims it after the timeout.
            debug!(distributor = self.id, %key, "tracker draining, delivery skipped");
        }
    }

    /// Deliver one claimed signal and record the outcome.
    ///
    /// Runs detached from the poll loop and does not observe its cancellation.
    async fn distribute_signal(self: Arc<Self>, claim: Claim) {
        let Claim { signal, policy } = claim;
        let key = signal.key().clone();

        let delivered = self.gateway.distribute(&key, signal.payload()).await;
        if let Err(err) = self.settle(&key, &policy, delivered).await {
            self.log_fault(&err, "settling delivery failed");
        }
    }

    async fn settle(
        &self,
        key: &SignalKey,
        policy: &DistributionPolicy,
        delivered: Result<(), DeliveryError>,
    ) -> Result<(), ChimeError> {
        let mut session = self.store.begin().await?;
        let Some(mut signal) = session.get_signal(key).await? else {
            debug!(distributor = self.id, %key, "signal gone before settlement");
            return Ok(());
        };
        if signal.state() != SignalState::Processing {
            debug!(distributor = self.id, %key, state = %signal.state(), "signal already settled elsewhere");
            return Ok(());
        }

        let now = self.clock.now();
        match delivered {
            Ok(()) => {
                signal.complete(now, policy.retention_timeout)?;
                debug!(distributor = self.id, %key, "signal delivered");
            }
            Err(delivery_error) => match signal.apply_failure(now, policy)? {
                FailureDecision::Retry { delay } => {
                    debug!(
                        distributor = self.id,
                        %key,
                        %delivery_error,
                        attempt = signal.retry_attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "delivery failed, retry scheduled"
                    );
                }
                FailureDecision::Fail => {
                    warn!(distributor = self.id, %key, %delivery_error, "delivery failed, retries exhausted");
                }
            },
        }

        session.update(signal);
        session.commit().await?;
        Ok(())
    }

    fn log_fault(&self, err: &ChimeError, message: &'static str) {
        match err {
            ChimeError::Signal(_) => error!(distributor = self.id, error = %err, "{message}"),
            ChimeError::Store(_) => warn!(distributor = self.id, error = %err, "{message}"),
        }
    }
}

#[async_trait]
impl NotificationHandler for SignalDistributor {
    async fn handle_potential_next_fire_time(&self, fire_time: DateTime<Utc>) {
        self.adjust_next_poll_time(fire_time).await;
    }
}

#[cfg(test)]
impl SignalDistributor {
    async fn poll_state(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let poll = self.poll.lock().await;
        (poll.next_poll_at, poll.min_next_poll_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemorySignalStore, StaticPolicyProvider};
    use crate::ports::{ManualClock, SignalSession};
    use chrono::TimeZone;
    use rstest::rstest;
    use std::sync::atomic::AtomicUsize;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct CountingGateway {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl DistributionGateway for CountingGateway {
        async fn distribute(&self, _key: &SignalKey, _payload: &str) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(DeliveryError::new("refused"))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        store: InMemorySignalStore,
        gateway: Arc<CountingGateway>,
        clock: Arc<ManualClock>,
        distributor: Arc<SignalDistributor>,
    }

    fn fixture() -> Fixture {
        let store = InMemorySignalStore::new();
        let gateway = Arc::new(CountingGateway::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let policy = DistributionPolicy::new(
            vec![Duration::from_secs(10)],
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        let config = DistributorConfig {
            idle_tick_ms: 5,
            startup_jitter_min_ms: 0,
            startup_jitter_max_ms: 0,
            ..DistributorConfig::default()
        };
        let distributor = Arc::new(SignalDistributor::new(
            0,
            Arc::new(store.clone()),
            gateway.clone(),
            Arc::new(StaticPolicyProvider::new(policy)),
            clock.clone(),
            config,
        ));
        Fixture {
            store,
            gateway,
            clock,
            distributor,
        }
    }

    async fn submit(store: &InMemorySignalStore, fire_time: DateTime<Utc>) -> SignalKey {
        let key = SignalKey::new("test", Ulid::new());
        let mut session = store.begin().await.unwrap();
        session.add(Signal::new(key.clone(), "payload", fire_time));
        session.commit().await.unwrap();
        key
    }

    async fn wait_for_state(store: &InMemorySignalStore, key: &SignalKey, state: SignalState) {
        for _ in 0..200 {
            if store.get(key).is_some_and(|signal| signal.state() == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("signal {key} never reached {state}");
    }

    #[tokio::test]
    async fn adjust_is_ignored_when_not_running() {
        let f = fixture();
        f.distributor.adjust_next_poll_time(t0()).await;
        let (next, min) = f.distributor.poll_state().await;
        assert_eq!(next, DateTime::<Utc>::MAX_UTC);
        assert_eq!(min, DateTime::<Utc>::MAX_UTC);
    }

    #[rstest]
    #[case::before_floor(-30, 1)]
    #[case::at_floor(1, 1)]
    #[case::after_floor(45, 45)]
    #[tokio::test]
    async fn adjust_clamps_to_min_next_poll(#[case] hint_offset: i64, #[case] expected_offset: i64) {
        let f = fixture();
        f.distributor.running.store(true, Ordering::SeqCst);
        {
            let mut poll = f.distributor.poll.lock().await;
            poll.min_next_poll_at = t0() + chrono::Duration::seconds(1);
            poll.next_poll_at = t0() + chrono::Duration::seconds(60);
        }

        f.distributor
            .adjust_next_poll_time(t0() + chrono::Duration::seconds(hint_offset))
            .await;

        let (next, min) = f.distributor.poll_state().await;
        assert_eq!(next, t0() + chrono::Duration::seconds(expected_offset));
        assert_eq!(next, (t0() + chrono::Duration::seconds(hint_offset)).max(min));
    }

    #[tokio::test]
    async fn ready_signal_is_claimed_delivered_and_completed() {
        let f = fixture();
        let key = submit(&f.store, t0()).await;

        let cancel = CancellationToken::new();
        let run = tokio::spawn(f.distributor.clone().run(cancel.clone()));

        wait_for_state(&f.store, &key, SignalState::Success).await;
        let signal = f.store.get(&key).unwrap();
        assert_eq!(signal.finalized_time(), Some(t0()));
        assert_eq!(signal.dead_time(), Some(t0() + chrono::Duration::seconds(60)));
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        run.await.unwrap();
        assert!(!f.distributor.is_running());
    }

    #[tokio::test]
    async fn failed_delivery_schedules_retry_then_fails() {
        let f = fixture();
        f.gateway.fail.store(true, Ordering::SeqCst);
        let key = submit(&f.store, t0()).await;

        let cancel = CancellationToken::new();
        let run = tokio::spawn(f.distributor.clone().run(cancel.clone()));

        for _ in 0..200 {
            if f.store.get(&key).is_some_and(|s| s.retry_attempts() == 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let signal = f.store.get(&key).unwrap();
        assert_eq!(signal.state(), SignalState::Pending);
        assert_eq!(signal.next_fire_time(), t0() + chrono::Duration::seconds(10));

        // The retry is not due until the clock moves and the poll floor passes.
        f.clock.advance(Duration::from_secs(10));
        f.distributor.adjust_next_poll_time(f.clock.now()).await;
        wait_for_state(&f.store, &key, SignalState::Failed).await;
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn future_signal_waits_for_its_fire_time() {
        let f = fixture();
        let key = submit(&f.store, t0() + chrono::Duration::seconds(5)).await;

        let cancel = CancellationToken::new();
        let run = tokio::spawn(f.distributor.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.store.get(&key).unwrap().state(), SignalState::Pending);
        let (next, _) = f.distributor.poll_state().await;
        assert_eq!(next, t0() + chrono::Duration::seconds(5));

        f.clock.advance(Duration::from_secs(5));
        wait_for_state(&f.store, &key, SignalState::Success).await;

        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn second_run_returns_immediately() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let first = tokio::spawn(f.distributor.clone().run(cancel.clone()));

        for _ in 0..100 {
            if f.distributor.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::timeout(Duration::from_secs(1), f.distributor.clone().run(cancel.clone()))
            .await
            .unwrap();
        assert!(f.distributor.is_running());

        cancel.cancel();
        first.await.unwrap();
    }

    #[tokio::test]
    async fn settlement_skips_signals_no_longer_processing() {
        let f = fixture();
        let key = submit(&f.store, t0()).await;
        let policy = Arc::new(DistributionPolicy::default());

        // Still Pending: settlement must not touch it.
        f.distributor.settle(&key, &policy, Ok(())).await.unwrap();
        assert_eq!(f.store.get(&key).unwrap().state(), SignalState::Pending);

        // Missing entirely.
        let missing = SignalKey::new("test", Ulid::new());
        f.distributor
            .settle(&missing, &policy, Err(DeliveryError::new("x")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn store_outage_retries_at_the_min_poll_floor() {
        let f = fixture();
        let key = submit(&f.store, t0()).await;
        f.store.set_unavailable(true);

        let cancel = CancellationToken::new();
        let run = tokio::spawn(f.distributor.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.store.get(&key).unwrap().state(), SignalState::Pending);
        let (next, min) = f.distributor.poll_state().await;
        assert_eq!(min, t0() + f.distributor.config.min_poll_interval());
        assert_eq!(next, min);

        f.store.set_unavailable(false);
        f.clock.advance(f.distributor.config.min_poll_interval());
        wait_for_state(&f.store, &key, SignalState::Success).await;

        cancel.cancel();
        run.await.unwrap();
    }
}
