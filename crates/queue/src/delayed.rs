//! Delayed queues.
//!
//! A delayed queue holds each pushed payload back for a fixed delay so that
//! payloads sharing a batch key are delivered together.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use huddle_common::{AppError, AppResult};
use tracing::debug;

use crate::dispatcher::{Dispatcher, DispatcherConfig, Sink};
use crate::push::PushArg;
use crate::repository::Repository;
use crate::schedule::{unix_now, SchedulePolicy};
use crate::store::{Store, StoreResult};

/// Namespace of the head queue with the given delay.
#[must_use]
pub fn head_namespace(delay_secs: u64) -> String {
    format!("delayrepo:head_{delay_secs}s")
}

/// A named queue with a fixed delivery delay.
#[derive(Clone)]
pub struct DelayedQueue {
    name: String,
    delay: Duration,
    repository: Repository,
}

impl DelayedQueue {
    /// Create a queue over an existing repository.
    pub fn new(name: impl Into<String>, delay: Duration, repository: Repository) -> Self {
        Self {
            name: name.into(),
            delay,
            repository,
        }
    }

    /// A head queue: the first push after a drain fixes the delivery time.
    pub fn head(name: impl Into<String>, delay_secs: u64, store: Arc<dyn Store>) -> Self {
        let repository = Repository::new(
            store,
            head_namespace(delay_secs),
            SchedulePolicy::Earliest,
        );
        Self::new(name, Duration::from_secs(delay_secs), repository)
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivery delay.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Underlying repository.
    #[must_use]
    pub const fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Add `payload` to the batch at `key`, due `delay` from now.
    pub async fn push(&self, key: &str, payload: Bytes) -> StoreResult<()> {
        let wake_at = unix_now() + self.delay.as_secs() as i64;
        self.repository.push(key, wake_at, payload, false).await
    }

    /// Expand `arg` and push every entry. Returns the number pushed.
    ///
    /// Nothing is pushed if any entry fails to serialize.
    pub async fn push_arg(&self, arg: &PushArg) -> AppResult<usize> {
        arg.validate()?;

        let expanded = arg.expand()?;
        let mut entries = Vec::with_capacity(expanded.len());
        for (key, data) in expanded {
            let payload = serde_json::to_vec(&data)
                .map_err(|e| AppError::BadRequest(format!("can't marshal input data: {e}")))?;
            entries.push((key, Bytes::from(payload)));
        }

        for (key, payload) in &entries {
            self.push(key, payload.clone()).await.map_err(|e| {
                AppError::Queue(format!("push to {} failed: {e}", self.name))
            })?;
        }

        debug!(
            queue = %self.name,
            service = %arg.service,
            method = %arg.method,
            count = entries.len(),
            "Queued push"
        );
        Ok(entries.len())
    }

    /// A dispatcher draining this queue into `sink`.
    pub fn dispatcher(&self, sink: Arc<dyn Sink>, config: DispatcherConfig) -> Dispatcher {
        Dispatcher::new(self.repository.clone(), sink, config)
    }
}
