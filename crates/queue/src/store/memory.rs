//! In-process store.
//!
//! Mirrors the Redis semantics the queue relies on, including scalar TTLs
//! (measured on the tokio clock so paused-time tests can expire locks).

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Store, StoreError, StoreResult, ZAddMode};

/// A scalar key. Only presence and expiry are observable through
/// [`Store`], so the value itself is not kept.
#[derive(Debug)]
struct Scalar {
    expires_at: Option<Instant>,
}

impl Scalar {
    fn new(ttl: Option<Duration>) -> Self {
        Self {
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<Bytes>>,
    scalars: HashMap<String, Scalar>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
}

impl State {
    fn scalar(&mut self, key: &str) -> Option<&mut Scalar> {
        if self.scalars.get(key).is_some_and(Scalar::is_expired) {
            self.scalars.remove(key);
        }
        self.scalars.get_mut(key)
    }
}

/// Store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

/// Resolve Redis-style inclusive, possibly negative, indices.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start >= len || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_push(&self, key: &str, value: Bytes) -> StoreResult<usize> {
        self.check()?;
        let mut state = self.state.lock().await;
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        Ok(list.len())
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        self.check()?;
        let state = self.state.lock().await;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(resolve_range(list.len(), start, stop)
            .map(|(start, stop)| list.range(start..=stop).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_trim_head(&self, key: &str, count: usize) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(list) = state.lists.get_mut(key) {
            list.drain(..count.min(list.len()));
            if list.is_empty() {
                state.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        for key in keys {
            state.lists.remove(key);
            state.scalars.remove(key);
            state.hashes.remove(key);
            state.zsets.remove(key);
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        _value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.scalar(key).is_some() {
            return Ok(false);
        }
        state.scalars.insert(key.to_string(), Scalar::new(ttl));
        Ok(true)
    }

    async fn set(&self, key: &str, _value: &str) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.scalars.insert(key.to_string(), Scalar::new(None));
        Ok(())
    }

    async fn refresh(&self, key: &str, _value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.scalar(key) {
            Some(scalar) => {
                *scalar = Scalar::new(Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        Ok(state.scalar(key).is_some()
            || state.lists.contains_key(key)
            || state.hashes.contains_key(key)
            || state.zsets.contains_key(key))
    }

    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn zset_add(
        &self,
        key: &str,
        member: &str,
        score: i64,
        mode: ZAddMode,
    ) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let zset = state.zsets.entry(key.to_string()).or_default();
        match zset.entry(member.to_string()) {
            Entry::Occupied(mut current) => {
                if mode == ZAddMode::Always || score < *current.get() {
                    current.insert(score);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(score);
            }
        }
        Ok(())
    }

    async fn zset_head(&self, key: &str, count: usize) -> StoreResult<Vec<(String, i64)>> {
        self.check()?;
        let state = self.state.lock().await;
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(String, i64)> = zset
            .iter()
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members.truncate(count);
        Ok(members)
    }

    async fn zset_score(&self, key: &str, member: &str) -> StoreResult<Option<i64>> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.zsets.get(key).and_then(|zset| zset.get(member).copied()))
    }

    async fn zset_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(zset) = state.zsets.get_mut(key) {
            zset.remove(member);
            if zset.is_empty() {
                state.zsets.remove(key);
            }
        }
        Ok(())
    }

    async fn zset_count(&self, key: &str) -> StoreResult<usize> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.zsets.get(key).map_or(0, HashMap::len))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }
}
