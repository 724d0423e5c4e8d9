//! Batch repository.
//!
//! Producers [`push`](Repository::push) payloads under a batch key; workers
//! [`claim`](Repository::claim) due batches and resolve each claim exactly
//! once with [`complete`](Repository::complete) or
//! [`release`](Repository::release).
//!
//! Only single-key atomic commands are used. The per-batch lock key, created
//! with set-if-absent, is the only mutual exclusion; the remaining race
//! windows are closed by counting rather than by transactions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::claim::{BatchKeys, Claim, ClaimOutcome, Completion};
use crate::schedule::{unix_now, SchedulePolicy, ScheduleIndex};
use crate::store::{Store, StoreError, StoreResult};

/// Default lifetime of a claim lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Durable batches plus their schedule.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn Store>,
    schedule: ScheduleIndex,
    key_prefix: String,
    lock_ttl: Option<Duration>,
}

impl Repository {
    /// Create a repository whose schedule lives at `namespace`.
    ///
    /// Batch keys are stored under `"{namespace}:"`.
    pub fn new(store: Arc<dyn Store>, namespace: impl Into<String>, policy: SchedulePolicy) -> Self {
        let namespace = namespace.into();
        Self {
            key_prefix: format!("{namespace}:"),
            schedule: ScheduleIndex::new(store.clone(), namespace, policy),
            store,
            lock_ttl: Some(DEFAULT_LOCK_TTL),
        }
    }

    /// Override the prefix prepended to batch keys.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Override the lock lifetime. `None` keeps locks until resolved.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// The schedule index.
    #[must_use]
    pub const fn schedule(&self) -> &ScheduleIndex {
        &self.schedule
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Lock lifetime, if locks expire.
    #[must_use]
    pub const fn lock_ttl(&self) -> Option<Duration> {
        self.lock_ttl
    }

    /// Store keys for `key`.
    #[must_use]
    pub fn keys(&self, key: &str) -> BatchKeys {
        BatchKeys::new(&self.key_prefix, key)
    }

    /// Append `payload` to the batch and schedule it for `wake_at`.
    ///
    /// With `overwrite`, an unclaimed batch is replaced by `[payload]`; a
    /// claimed one is appended to as usual. Never waits on a claim.
    pub async fn push(
        &self,
        key: &str,
        wake_at: i64,
        payload: Bytes,
        overwrite: bool,
    ) -> StoreResult<()> {
        let keys = self.keys(key);

        let len = if overwrite {
            let len = self.replace_entries(&keys, payload).await?;
            self.store.set(&keys.overwrite, "1").await?;
            len
        } else {
            self.store.list_push(&keys.entries, payload).await?
        };
        self.schedule.advance(key, wake_at).await?;

        debug!(key, len, wake_at, overwrite, "Pushed to batch");
        Ok(())
    }

    /// Replace the entries with `[payload]` under the batch lock, so no claim
    /// can snapshot the list between the delete and the append. A batch that
    /// is already claimed is appended to instead.
    async fn replace_entries(&self, keys: &BatchKeys, payload: Bytes) -> StoreResult<usize> {
        // Bounded even without a lock TTL: a producer may die while holding it.
        let ttl = self.lock_ttl.unwrap_or(DEFAULT_LOCK_TTL);
        if !self
            .store
            .set_if_absent(&keys.lock, &lock_token(), Some(ttl))
            .await?
        {
            return self.store.list_push(&keys.entries, payload).await;
        }

        let replaced = async {
            self.store.delete(std::slice::from_ref(&keys.entries)).await?;
            self.store.list_push(&keys.entries, payload).await
        }
        .await;
        let unlocked = self.store.delete(std::slice::from_ref(&keys.lock)).await;

        let len = replaced?;
        unlocked?;
        Ok(len)
    }

    /// Set a metadata field unless it is already set.
    ///
    /// Returns `true` when this call set it.
    pub async fn set_metadata(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let keys = self.keys(key);
        self.store.hash_set_if_absent(&keys.data, field, value).await
    }

    /// Current metadata of a batch.
    pub async fn metadata(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.store.hash_get_all(&self.keys(key).data).await
    }

    /// Current number of entries in a batch.
    pub async fn len(&self, key: &str) -> StoreResult<usize> {
        self.store.list_len(&self.keys(key).entries).await
    }

    /// Whether a batch is currently claimed.
    pub async fn is_claimed(&self, key: &str) -> StoreResult<bool> {
        self.store.exists(&self.keys(key).lock).await
    }

    /// Try to take the batch at `key` for delivery.
    ///
    /// Fails with [`ClaimOutcome::NotReady`] unless the key is scheduled and
    /// due, and with [`ClaimOutcome::AlreadyClaimed`] when another worker
    /// holds the lock.
    pub async fn claim(&self, key: &str) -> StoreResult<ClaimOutcome> {
        match self.schedule.wake_at(key).await? {
            Some(wake_at) if wake_at <= unix_now() => {}
            _ => return Ok(ClaimOutcome::NotReady),
        }

        let keys = self.keys(key);
        let token = lock_token();
        if !self
            .store
            .set_if_absent(&keys.lock, &token, self.lock_ttl)
            .await?
        {
            debug!(key, "Batch already claimed");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        match self.snapshot(key, keys, token).await {
            Ok(claim) => {
                debug!(key, count = claim.count, "Claimed batch");
                Ok(ClaimOutcome::Claimed(claim))
            }
            Err((keys, e)) => {
                if let Err(unlock) = self.store.delete(&[keys.lock]).await {
                    warn!(key, error = %unlock, "Failed to unlock batch after snapshot error");
                }
                Err(e)
            }
        }
    }

    async fn snapshot(
        &self,
        key: &str,
        keys: BatchKeys,
        token: String,
    ) -> Result<Claim, (BatchKeys, StoreError)> {
        let read = async {
            let len = self.store.list_len(&keys.entries).await?;
            let entries = if len == 0 {
                Vec::new()
            } else {
                self.store
                    .list_range(&keys.entries, 0, len as i64 - 1)
                    .await?
            };
            let metadata = self.store.hash_get_all(&keys.data).await?;
            let overwritten = self.store.exists(&keys.overwrite).await?;
            StoreResult::Ok((entries, metadata, overwritten))
        };

        match read.await {
            Ok((entries, metadata, overwritten)) => Ok(Claim {
                key: key.to_string(),
                keys,
                token,
                count: entries.len(),
                entries,
                metadata,
                overwritten,
            }),
            Err(e) => Err((keys, e)),
        }
    }

    /// Retire the delivered prefix of a claimed batch.
    ///
    /// When nothing arrived since the snapshot the whole batch and its
    /// schedule entry are removed. Otherwise only the first `count` entries
    /// are trimmed and the batch stays scheduled at its current time.
    pub async fn complete(&self, claim: Claim) -> StoreResult<Completion> {
        let Claim {
            key, keys, count, ..
        } = claim;

        let actual = self.store.list_len(&keys.entries).await?;
        if actual <= count {
            self.store.delete(&keys.all()).await?;
            self.schedule.remove(&key).await?;

            // A push that slipped in after the delete keeps its entry but may
            // have lost its schedule entry to the remove above.
            if self.store.list_len(&keys.entries).await? > 0 {
                self.schedule.advance(&key, unix_now()).await?;
            }

            debug!(key, count, "Batch drained");
            return Ok(Completion::Drained);
        }

        self.store.list_trim_head(&keys.entries, count).await?;
        self.store
            .delete(&[keys.overwrite.clone(), keys.lock.clone()])
            .await?;

        let remaining = actual - count;
        debug!(key, count, remaining, "Batch partially drained");
        Ok(Completion::Partial { remaining })
    }

    /// Give up a claim without consuming anything; retry at `wake_at`.
    pub async fn release(&self, claim: Claim, wake_at: i64) -> StoreResult<()> {
        self.schedule.set(&claim.key, wake_at).await?;
        self.store.delete(&[claim.keys.lock]).await?;

        debug!(key = %claim.key, wake_at, "Released batch");
        Ok(())
    }

    /// Push the lock expiry forward while a delivery is in flight.
    ///
    /// Returns `false` when the lock has already expired.
    pub async fn extend(&self, claim: &Claim) -> StoreResult<bool> {
        match self.lock_ttl {
            Some(ttl) => self.store.refresh(&claim.keys.lock, &claim.token, ttl).await,
            None => Ok(true),
        }
    }
}

/// Claim time in fractional seconds, made unique per claimant.
fn lock_token() -> String {
    let micros = Utc::now().timestamp_micros();
    format!("{}.{:04}:{}", micros / 1_000_000, (micros % 1_000_000) / 100, Ulid::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const NUMBER: usize = 10;

    fn repository() -> (Arc<MemoryStore>, Repository) {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store.clone(), "delay:test", SchedulePolicy::Earliest);
        (store, repo)
    }

    fn claim_of(repo: &Repository, key: &str, count: usize) -> Claim {
        Claim {
            key: key.to_string(),
            keys: repo.keys(key),
            token: lock_token(),
            count,
            entries: Vec::new(),
            metadata: HashMap::new(),
            overwritten: false,
        }
    }

    /// Ten entries, overwrite flag, lock, one metadata field, and two
    /// scheduled keys.
    async fn fixture(store: &MemoryStore, repo: &Repository, key: &str) {
        let keys = repo.keys(key);
        for i in 0..NUMBER {
            store
                .list_push(&keys.entries, Bytes::from(i.to_string()))
                .await
                .unwrap();
        }
        store.set(&keys.overwrite, "1").await.unwrap();
        store.set(&keys.lock, "1234.5678").await.unwrap();
        store
            .hash_set_if_absent(&keys.data, "data_key", "data_value")
            .await
            .unwrap();
        repo.schedule().set(key, 12345).await.unwrap();
        repo.schedule().set("other_key", 12346).await.unwrap();
    }

    #[test]
    fn test_lock_token_format() {
        let token = lock_token();
        let (time, id) = token.split_once(':').unwrap();
        let (secs, frac) = time.split_once('.').unwrap();

        assert!(secs.parse::<i64>().unwrap() > 0);
        assert_eq!(frac.len(), 4);
        assert!(id.parse::<Ulid>().is_ok());
        assert_ne!(lock_token(), token);
    }

    #[tokio::test]
    async fn test_complete_number() {
        let (store, repo) = repository();
        fixture(&store, &repo, "key").await;
        let keys = repo.keys("key");

        let done = repo.complete(claim_of(&repo, "key", NUMBER)).await.unwrap();

        assert_eq!(done, Completion::Drained);
        assert!(!store.exists(&keys.entries).await.unwrap());
        assert!(!store.exists(&keys.overwrite).await.unwrap());
        assert!(!store.exists(&keys.lock).await.unwrap());
        assert!(!store.exists(&keys.data).await.unwrap());
        assert_eq!(repo.schedule().len().await.unwrap(), 1);
        assert_eq!(repo.schedule().wake_at("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_complete_number_add1() {
        let (store, repo) = repository();
        fixture(&store, &repo, "key").await;
        let keys = repo.keys("key");

        let done = repo
            .complete(claim_of(&repo, "key", NUMBER + 1))
            .await
            .unwrap();

        assert_eq!(done, Completion::Drained);
        assert!(!store.exists(&keys.entries).await.unwrap());
        assert!(!store.exists(&keys.data).await.unwrap());
        assert_eq!(repo.schedule().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_complete_number_sub1() {
        let (store, repo) = repository();
        fixture(&store, &repo, "key").await;
        let keys = repo.keys("key");

        let done = repo
            .complete(claim_of(&repo, "key", NUMBER - 1))
            .await
            .unwrap();

        assert_eq!(done, Completion::Partial { remaining: 1 });
        assert_eq!(store.list_len(&keys.entries).await.unwrap(), 1);
        assert_eq!(
            store.list_range(&keys.entries, 0, -1).await.unwrap(),
            vec![Bytes::from("9")]
        );
        assert!(!store.exists(&keys.overwrite).await.unwrap());
        assert!(!store.exists(&keys.lock).await.unwrap());
        assert_eq!(store.hash_get_all(&keys.data).await.unwrap().len(), 1);
        assert_eq!(repo.schedule().len().await.unwrap(), 2);
        assert_eq!(repo.schedule().wake_at("key").await.unwrap(), Some(12345));
    }

    #[tokio::test]
    async fn test_release_keeps_everything_but_lock() {
        for count in [NUMBER - 1, NUMBER, NUMBER + 1] {
            let (store, repo) = repository();
            fixture(&store, &repo, "key").await;
            let keys = repo.keys("key");

            repo.release(claim_of(&repo, "key", count), 23456)
                .await
                .unwrap();

            assert_eq!(store.list_len(&keys.entries).await.unwrap(), NUMBER);
            assert!(store.exists(&keys.overwrite).await.unwrap());
            assert!(!store.exists(&keys.lock).await.unwrap());
            assert_eq!(store.hash_get_all(&keys.data).await.unwrap().len(), 1);
            assert_eq!(repo.schedule().len().await.unwrap(), 2);
            assert_eq!(repo.schedule().wake_at("key").await.unwrap(), Some(23456));
        }
    }

    #[tokio::test]
    async fn test_push_overwrite_replaces_unclaimed_batch() {
        let (store, repo) = repository();
        repo.push("k", 100, Bytes::from("a"), false).await.unwrap();
        repo.push("k", 100, Bytes::from("b"), false).await.unwrap();

        repo.push("k", 100, Bytes::from("c"), true).await.unwrap();

        let keys = repo.keys("k");
        assert_eq!(
            store.list_range(&keys.entries, 0, -1).await.unwrap(),
            vec![Bytes::from("c")]
        );
        assert!(store.exists(&keys.overwrite).await.unwrap());
        assert!(!store.exists(&keys.lock).await.unwrap());

        let ClaimOutcome::Claimed(claim) = repo.claim("k").await.unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(claim.entries(), &[Bytes::from("c")]);
    }

    #[tokio::test]
    async fn test_push_overwrite_appends_while_claimed() {
        let (store, repo) = repository();
        repo.push("k", 100, Bytes::from("a"), false).await.unwrap();
        let ClaimOutcome::Claimed(claim) = repo.claim("k").await.unwrap() else {
            panic!("expected claim");
        };

        repo.push("k", 100, Bytes::from("b"), true).await.unwrap();

        let keys = repo.keys("k");
        assert_eq!(store.list_len(&keys.entries).await.unwrap(), 2);
        assert_eq!(
            repo.complete(claim).await.unwrap(),
            Completion::Partial { remaining: 1 }
        );
        assert!(!store.exists(&keys.overwrite).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_not_ready_before_wake_time() {
        let (_store, repo) = repository();
        assert!(matches!(
            repo.claim("missing").await.unwrap(),
            ClaimOutcome::NotReady
        ));

        repo.push("k", unix_now() + 3600, Bytes::from("a"), false)
            .await
            .unwrap();
        assert!(matches!(repo.claim("k").await.unwrap(), ClaimOutcome::NotReady));
        assert!(!repo.is_claimed("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_snapshot_carries_metadata_and_flag() {
        let (_store, repo) = repository();
        repo.push("k", 1, Bytes::from("a"), true).await.unwrap();
        assert!(repo.set_metadata("k", "locale", "en_US").await.unwrap());
        assert!(!repo.set_metadata("k", "locale", "ja_JP").await.unwrap());

        let ClaimOutcome::Claimed(claim) = repo.claim("k").await.unwrap() else {
            panic!("expected claim");
        };

        assert_eq!(claim.key(), "k");
        assert_eq!(claim.count(), 1);
        assert!(claim.is_overwritten());
        assert_eq!(claim.metadata().get("locale").map(String::as_str), Some("en_US"));
        assert!(repo.is_claimed("k").await.unwrap());
        assert!(matches!(
            repo.claim("k").await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        ));
        repo.release(claim, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_without_locking() {
        let (store, repo) = repository();
        repo.push("k", 1, Bytes::from("a"), false).await.unwrap();

        store.set_unavailable(true);
        assert!(repo.claim("k").await.is_err());
        assert!(repo.push("k", 1, Bytes::from("b"), false).await.is_err());
        store.set_unavailable(false);

        assert!(!repo.is_claimed("k").await.unwrap());
        assert_eq!(repo.len("k").await.unwrap(), 1);
        assert!(matches!(
            repo.claim("k").await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_can_be_reclaimed() {
        let (_store, repo) = repository();
        let repo = repo.with_lock_ttl(Some(Duration::from_secs(30)));
        repo.push("k", 1, Bytes::from("a"), false).await.unwrap();

        let ClaimOutcome::Claimed(abandoned) = repo.claim("k").await.unwrap() else {
            panic!("expected claim");
        };
        assert!(repo.extend(&abandoned).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(!repo.extend(&abandoned).await.unwrap());
        let ClaimOutcome::Claimed(claim) = repo.claim("k").await.unwrap() else {
            panic!("expected expired lock to be reclaimable");
        };
        assert_eq!(claim.entries(), &[Bytes::from("a")]);
        assert_eq!(repo.complete(claim).await.unwrap(), Completion::Drained);
        drop(abandoned);
    }
}
