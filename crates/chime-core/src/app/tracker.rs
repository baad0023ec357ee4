//! DetachedTaskTracker - supervision for fire-and-forget work.
//!
//! One supervisor task owns every tracked unit. Callers talk to it through a
//! channel, so counting in-flight units and deciding when a drain is complete
//! happen in a single place and a unit settling at the same moment a drain is
//! requested cannot be missed.
//!
//! Phases: `Accepting -> Draining -> Drained`. `track` only succeeds while
//! accepting; every `drain_and_wait` caller waits for `Drained`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Command {
    Track { work: Work, timeout: Duration },
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Accepting,
    Draining,
    Drained,
}

pub struct DetachedTaskTracker {
    commands: mpsc::UnboundedSender<Command>,

    /// Taken by whichever of `run` / `drain_and_wait` supervises.
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,

    phase: watch::Sender<Phase>,
}

impl DetachedTaskTracker {
    pub fn new() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(Phase::Accepting);
        Self {
            commands,
            receiver: Mutex::new(Some(receiver)),
            phase,
        }
    }

    /// Register `work`, bounded by `timeout`. Never blocks.
    ///
    /// On timeout the work keeps running detached; the tracker just stops
    /// waiting for it. Returns `false`, dropping `work`, once a drain has begun.
    pub fn track<F>(&self, work: F, timeout: Duration) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.phase.borrow() != Phase::Accepting {
            return false;
        }
        // Fails once the supervisor has closed the channel for draining.
        self.commands
            .send(Command::Track {
                work: Box::pin(work),
                timeout,
            })
            .is_ok()
    }

    /// Supervise tracked work until a drain completes.
    ///
    /// Returns immediately if another call is already supervising.
    pub async fn run(&self) {
        let Some(receiver) = self.take_receiver() else {
            return;
        };
        supervise(receiver, &self.phase).await;
    }

    /// Stop accepting work and wait until every unit registered so far has
    /// settled. Safe to call repeatedly and concurrently.
    pub async fn drain_and_wait(&self) {
        let initiated = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Accepting {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        });

        if initiated {
            if self.commands.send(Command::Drain).is_err() {
                // Supervisor is gone; nothing left to wait for.
                self.phase.send_replace(Phase::Drained);
            } else if let Some(receiver) = self.take_receiver() {
                // `run` was never started.
                supervise(receiver, &self.phase).await;
            }
        }

        let mut phase = self.phase.subscribe();
        let _ = phase.wait_for(|phase| *phase == Phase::Drained).await;
    }

    pub fn is_accepting(&self) -> bool {
        *self.phase.borrow() == Phase::Accepting
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Command>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Default for DetachedTaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

async fn supervise(mut commands: mpsc::UnboundedReceiver<Command>, phase: &watch::Sender<Phase>) {
    let mut units = JoinSet::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Track { work, timeout }) => {
                    units.spawn(settle(work, timeout));
                }
                Some(Command::Drain) | None => break,
            },
            Some(joined) = units.join_next(), if !units.is_empty() => {
                if let Err(join_error) = joined {
                    warn!(%join_error, "detached work supervisor failed");
                }
            }
        }
    }

    // Anything sent before the close is still tracked.
    commands.close();
    while let Some(command) = commands.recv().await {
        if let Command::Track { work, timeout } = command {
            units.spawn(settle(work, timeout));
        }
    }

    debug!(in_flight = units.len(), "draining detached work");
    while let Some(joined) = units.join_next().await {
        if let Err(join_error) = joined {
            warn!(%join_error, "detached work supervisor failed");
        }
    }

    phase.send_replace(Phase::Drained);
    debug!("detached work drained");
}

/// Race one unit against its timeout. Panics inside the unit are logged, not propagated.
async fn settle(work: Work, timeout: Duration) {
    let handle = tokio::spawn(work);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(join_error)) => warn!(%join_error, "detached work panicked"),
        Err(_) => warn!(
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "detached work timed out, abandoned"
        ),
    }
}
