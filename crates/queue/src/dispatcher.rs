//! Dispatcher loop.
//!
//! A [`Dispatcher`] repeatedly peeks the schedule, claims the earliest due
//! batch, hands its snapshot to a [`Sink`] and resolves the claim. Any number
//! of dispatchers may run against the same store; the per-batch lock is the
//! only coordination between them. A due batch held by another worker is
//! passed over for one poll interval so the batches behind it keep moving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use huddle_common::QueueConfig;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::claim::{Claim, ClaimOutcome, Completion};
use crate::repository::Repository;
use crate::retry::{Backoff, RetryConfig};
use crate::schedule::unix_now;
use crate::store::{StoreError, StoreResult};

/// Schedule entries looked at per pass.
const SCAN_WIDTH: usize = 16;

/// Result of handing a batch to a [`Sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// The entries were processed; the claim is completed.
    Delivered,
    /// Transient failure; the claim is released for a later attempt.
    Retry {
        /// Suggested delay. The dispatcher's backoff decides when absent.
        after: Option<Duration>,
    },
}

/// Downstream handler for claimed batches.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver a batch snapshot. Entries are in push order.
    async fn deliver(
        &self,
        key: &str,
        entries: &[Bytes],
        metadata: &HashMap<String, String>,
    ) -> SinkOutcome;
}

/// Dispatcher timing.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Upper bound on any single wait.
    pub poll_interval: Duration,
    /// Lifetime of a claim lock; refreshed every third of it during delivery.
    pub lock_ttl: Duration,
    /// Pause after a store error.
    pub store_retry: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(300),
            store_retry: Duration::from_secs(1),
        }
    }
}

impl From<&QueueConfig> for DispatcherConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            lock_ttl: config.lock_ttl(),
            store_retry: config.store_retry(),
        }
    }
}

/// Dispatcher state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherState {
    /// About to look at the schedule.
    Idle,
    /// Sleeping before the next look.
    Waiting(Duration),
    /// About to claim and deliver the batch at this key.
    Draining(String),
    /// Shutdown observed.
    Stopped,
}

/// Drives batches from the schedule into a sink.
pub struct Dispatcher {
    repository: Repository,
    sink: Arc<dyn Sink>,
    backoff: Arc<dyn Backoff>,
    config: DispatcherConfig,
    attempts: HashMap<String, u32>,
    /// Keys found claimed elsewhere, and when.
    skipped: HashMap<String, Instant>,
}

impl Dispatcher {
    /// Create a dispatcher. Claims taken by it expire after
    /// `config.lock_ttl`.
    pub fn new(repository: Repository, sink: Arc<dyn Sink>, config: DispatcherConfig) -> Self {
        Self {
            repository: repository.with_lock_ttl(Some(config.lock_ttl)),
            sink,
            backoff: Arc::new(RetryConfig::default()),
            config,
            attempts: HashMap::new(),
            skipped: HashMap::new(),
        }
    }

    /// Replace the backoff policy used when the sink suggests no delay.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// The repository this dispatcher drains.
    #[must_use]
    pub const fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Run until `shutdown` turns `true` or its sender is dropped.
    ///
    /// A drain in progress when the signal arrives is finished first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let namespace = self.repository.schedule().namespace().to_string();
        info!(namespace = %namespace, "Dispatcher started");

        let mut state = DispatcherState::Idle;
        while state != DispatcherState::Stopped {
            state = self.step(state, &mut shutdown).await;
        }

        info!(namespace = %namespace, "Dispatcher stopped");
    }

    /// Perform one state transition.
    pub async fn step(
        &mut self,
        state: DispatcherState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DispatcherState {
        if *shutdown.borrow() {
            return DispatcherState::Stopped;
        }

        match state {
            DispatcherState::Stopped => DispatcherState::Stopped,
            DispatcherState::Idle => match self.next_state().await {
                Ok(next) => next,
                Err(e) => self.store_failed(&e, shutdown).await,
            },
            DispatcherState::Waiting(duration) => {
                if pause(duration, shutdown).await {
                    DispatcherState::Stopped
                } else {
                    DispatcherState::Idle
                }
            }
            DispatcherState::Draining(key) => match self.drain(&key).await {
                Ok(()) => DispatcherState::Idle,
                Err(e) => self.store_failed(&e, shutdown).await,
            },
        }
    }

    async fn next_state(&mut self) -> StoreResult<DispatcherState> {
        let window = self.config.poll_interval;
        self.skipped.retain(|_, since| since.elapsed() < window);

        let entries = self.repository.schedule().peek(SCAN_WIDTH).await?;
        let now = unix_now();
        let mut wait = window;
        for entry in entries {
            if !entry.is_due(now) {
                let until = Duration::from_secs((entry.wake_at - now) as u64);
                wait = until.min(window);
                break;
            }
            if !self.skipped.contains_key(&entry.key) {
                return Ok(DispatcherState::Draining(entry.key));
            }
        }

        self.forget_retired().await?;
        Ok(DispatcherState::Waiting(wait))
    }

    /// Drop retry counters of keys that are no longer scheduled, e.g. drained
    /// by another dispatcher after this one released them.
    async fn forget_retired(&mut self) -> StoreResult<()> {
        let tracked: Vec<String> = self.attempts.keys().cloned().collect();
        for key in tracked {
            if self.repository.schedule().wake_at(&key).await?.is_none() {
                self.attempts.remove(&key);
            }
        }
        Ok(())
    }

    async fn store_failed(
        &self,
        error: &StoreError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DispatcherState {
        warn!(
            namespace = %self.repository.schedule().namespace(),
            error = %error,
            retry_ms = self.config.store_retry.as_millis() as u64,
            "Store error in dispatcher"
        );
        if pause(self.config.store_retry, shutdown).await {
            DispatcherState::Stopped
        } else {
            DispatcherState::Idle
        }
    }

    async fn drain(&mut self, key: &str) -> StoreResult<()> {
        let claim = match self.repository.claim(key).await? {
            ClaimOutcome::Claimed(claim) => claim,
            ClaimOutcome::AlreadyClaimed => {
                debug!(key, "Batch is claimed elsewhere, passing over it");
                self.skipped.insert(key.to_string(), Instant::now());
                return Ok(());
            }
            ClaimOutcome::NotReady => return Ok(()),
        };

        if claim.is_empty() {
            debug!(key, "Retiring empty batch");
            self.repository.complete(claim).await?;
            return Ok(());
        }

        let count = claim.count();
        match self.deliver(&claim).await {
            SinkOutcome::Delivered => {
                self.attempts.remove(key);
                let completion = self.repository.complete(claim).await?;
                if let Completion::Partial { remaining } = completion {
                    debug!(key, count, remaining, "Delivered batch, newer entries remain");
                } else {
                    debug!(key, count, "Delivered batch");
                }
            }
            SinkOutcome::Retry { after } => {
                let attempt = self.attempts.get(key).copied().unwrap_or(0) + 1;
                let delay = after.unwrap_or_else(|| self.backoff.delay(attempt - 1));
                self.attempts.insert(key.to_string(), attempt);
                let wake_at = unix_now() + delay.as_secs().max(1) as i64;

                warn!(
                    key,
                    count,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Delivery failed, releasing batch"
                );
                self.repository.release(claim, wake_at).await?;
            }
        }
        Ok(())
    }

    /// Run the sink while keeping the claim lock alive.
    async fn deliver(&self, claim: &Claim) -> SinkOutcome {
        let delivery = self
            .sink
            .deliver(claim.key(), claim.entries(), claim.metadata());
        tokio::pin!(delivery);

        let period = (self.config.lock_ttl / 3).max(Duration::from_millis(100));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                outcome = &mut delivery => return outcome,
                _ = heartbeat.tick() => match self.repository.extend(claim).await {
                    Ok(true) => debug!(key = %claim.key(), "Extended claim lock"),
                    Ok(false) => warn!(key = %claim.key(), "Claim lock expired during delivery"),
                    Err(e) => warn!(key = %claim.key(), error = %e, "Failed to extend claim lock"),
                },
            }
        }
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `true` on shutdown.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
