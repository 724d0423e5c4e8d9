//! Schedule index: one sorted set mapping batch keys to their wake time.

use std::sync::Arc;

use chrono::Utc;

use crate::store::{Store, StoreResult, ZAddMode};

/// Current unix time in seconds, the unit of every wake time.
#[must_use]
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// How a push moves an already scheduled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Keep the earlier of the existing and requested times.
    ///
    /// With a fixed delay the first push after a drain decides when the
    /// batch goes out.
    #[default]
    Earliest,
    /// Every push overwrites the time (debounce).
    Always,
}

impl SchedulePolicy {
    const fn zadd_mode(self) -> ZAddMode {
        match self {
            Self::Earliest => ZAddMode::IfEarlier,
            Self::Always => ZAddMode::Always,
        }
    }
}

/// A scheduled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Batch key.
    pub key: String,
    /// Unix timestamp (seconds) at which the batch may be claimed.
    pub wake_at: i64,
}

impl ScheduleEntry {
    /// Whether the entry is eligible at `now`.
    #[must_use]
    pub const fn is_due(&self, now: i64) -> bool {
        self.wake_at <= now
    }
}

/// Global "when is each batch ready" index.
#[derive(Clone)]
pub struct ScheduleIndex {
    store: Arc<dyn Store>,
    namespace: String,
    policy: SchedulePolicy,
}

impl ScheduleIndex {
    /// Create an index stored under `namespace`.
    pub fn new(store: Arc<dyn Store>, namespace: impl Into<String>, policy: SchedulePolicy) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            policy,
        }
    }

    /// Name of the underlying sorted set.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Policy applied by [`Self::advance`].
    #[must_use]
    pub const fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    /// Make sure `key` is scheduled no later than `wake_at`.
    ///
    /// Under [`SchedulePolicy::Always`] the time is overwritten instead.
    pub async fn advance(&self, key: &str, wake_at: i64) -> StoreResult<()> {
        self.store
            .zset_add(&self.namespace, key, wake_at, self.policy.zadd_mode())
            .await
    }

    /// Unconditionally set the wake time of `key`.
    pub async fn set(&self, key: &str, wake_at: i64) -> StoreResult<()> {
        self.store
            .zset_add(&self.namespace, key, wake_at, ZAddMode::Always)
            .await
    }

    /// The entry with the smallest wake time, without removing it.
    pub async fn peek_earliest(&self) -> StoreResult<Option<ScheduleEntry>> {
        Ok(self.peek(1).await?.into_iter().next())
    }

    /// Up to `limit` entries in wake order, without removing them.
    pub async fn peek(&self, limit: usize) -> StoreResult<Vec<ScheduleEntry>> {
        Ok(self
            .store
            .zset_head(&self.namespace, limit)
            .await?
            .into_iter()
            .map(|(key, wake_at)| ScheduleEntry { key, wake_at })
            .collect())
    }

    /// Wake time of `key`, if scheduled.
    pub async fn wake_at(&self, key: &str) -> StoreResult<Option<i64>> {
        self.store.zset_score(&self.namespace, key).await
    }

    /// Drop `key` from the index; no-op if absent.
    pub async fn remove(&self, key: &str) -> StoreResult<()> {
        self.store.zset_remove(&self.namespace, key).await
    }

    /// Number of scheduled batches.
    pub async fn len(&self) -> StoreResult<usize> {
        self.store.zset_count(&self.namespace).await
    }

    /// Whether nothing is scheduled.
    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn index(policy: SchedulePolicy) -> ScheduleIndex {
        ScheduleIndex::new(Arc::new(MemoryStore::new()), "delay:test", policy)
    }

    #[tokio::test]
    async fn test_advance_keeps_earlier_time() {
        let index = index(SchedulePolicy::Earliest);

        index.advance("k", 200).await.unwrap();
        index.advance("k", 300).await.unwrap();
        assert_eq!(index.wake_at("k").await.unwrap(), Some(200));

        index.advance("k", 100).await.unwrap();
        assert_eq!(index.wake_at("k").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_advance_always_overwrites() {
        let index = index(SchedulePolicy::Always);

        index.advance("k", 200).await.unwrap();
        index.advance("k", 300).await.unwrap();
        assert_eq!(index.wake_at("k").await.unwrap(), Some(300));
    }

    #[tokio::test]
    async fn test_set_overwrites_regardless_of_policy() {
        let index = index(SchedulePolicy::Earliest);

        index.advance("k", 200).await.unwrap();
        index.set("k", 23456).await.unwrap();
        assert_eq!(index.wake_at("k").await.unwrap(), Some(23456));
    }

    #[tokio::test]
    async fn test_peek_earliest_does_not_remove() {
        let index = index(SchedulePolicy::Earliest);
        assert_eq!(index.peek_earliest().await.unwrap(), None);

        index.advance("late", 12346).await.unwrap();
        index.advance("early", 12345).await.unwrap();

        let entry = index.peek_earliest().await.unwrap().unwrap();
        assert_eq!(entry.key, "early");
        assert_eq!(entry.wake_at, 12345);
        assert!(entry.is_due(12345));
        assert!(!entry.is_due(12344));
        assert_eq!(index.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_peek_returns_entries_in_wake_order() {
        let index = index(SchedulePolicy::Earliest);
        index.advance("c", 30).await.unwrap();
        index.advance("a", 10).await.unwrap();
        index.advance("b", 20).await.unwrap();

        let keys: Vec<String> = index
            .peek(2)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(index.peek(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let index = index(SchedulePolicy::Earliest);

        index.advance("k", 1).await.unwrap();
        index.remove("k").await.unwrap();
        index.remove("k").await.unwrap();
        assert!(index.is_empty().await.unwrap());
    }
}
