//! Store adapter.
//!
//! The queue only needs a handful of list, hash, sorted-set and scalar
//! primitives, each atomic on its own. [`Store`] names exactly those; the
//! Redis implementation lives in [`redis`], an in-process one for tests and
//! local runs in [`memory`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use huddle_common::AppError;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Store result type.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store adapter error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis command failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self::Redis(err.to_string())
    }
}

/// How `zset_add` treats an existing member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZAddMode {
    /// Insert or overwrite the score.
    Always,
    /// Insert, or lower an existing score. Never raises it.
    IfEarlier,
}

/// Primitive operations the queue requires from its backing store.
///
/// Connection pooling, health checks and reconnection are the
/// implementation's business.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a value to the tail of a list, returning the new length.
    async fn list_push(&self, key: &str, value: Bytes) -> StoreResult<usize>;

    /// Length of a list; zero when absent.
    async fn list_len(&self, key: &str) -> StoreResult<usize>;

    /// Inclusive range of a list, Redis index semantics.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>>;

    /// Drop the first `count` elements of a list.
    async fn list_trim_head(&self, key: &str, count: usize) -> StoreResult<()>;

    /// Delete keys of any type. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// Create a scalar only if it does not exist yet.
    ///
    /// Returns `true` when this call created it.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Create or overwrite a scalar.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Overwrite a scalar and reset its TTL, only if it still exists.
    ///
    /// Returns `true` when the key was present.
    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Set a hash field only if it is not set yet.
    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> StoreResult<bool>;

    /// All fields of a hash; empty when absent.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Add a member to a sorted set.
    async fn zset_add(
        &self,
        key: &str,
        member: &str,
        score: i64,
        mode: ZAddMode,
    ) -> StoreResult<()>;

    /// Up to `count` members with the lowest scores, in ascending order.
    /// Ties are broken by member.
    async fn zset_head(&self, key: &str, count: usize) -> StoreResult<Vec<(String, i64)>>;

    /// Score of a member, if present.
    async fn zset_score(&self, key: &str, member: &str) -> StoreResult<Option<i64>>;

    /// Remove a member from a sorted set.
    async fn zset_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Number of members in a sorted set.
    async fn zset_count(&self, key: &str) -> StoreResult<usize>;

    /// Health check.
    async fn ping(&self) -> StoreResult<()>;
}
