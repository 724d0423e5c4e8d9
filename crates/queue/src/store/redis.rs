//! Redis-backed store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fred::clients::Pool;
use fred::error::{Error as RedisError, ErrorKind as RedisErrorKind};
use fred::interfaces::{
    ClientLike, EventInterface, HashesInterface, KeysInterface, ListInterface,
    SortedSetsInterface,
};
use fred::prelude::{ReconnectPolicy, TcpConfig};
use fred::types::config::{Config as FredConfig, UnresponsiveConfig};
use fred::types::sorted_sets::Ordering;
use fred::types::{Builder, Expiration, SetOptions, Value};
use futures::future::join_all;
use huddle_common::RedisConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use super::{Store, StoreError, StoreResult, ZAddMode};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            RedisErrorKind::IO | RedisErrorKind::Timeout | RedisErrorKind::Canceled => {
                Self::Unavailable(err.to_string())
            }
            _ => Self::Redis(err.to_string()),
        }
    }
}

/// Store backed by a pool of Redis connections.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Wrap an already connected pool.
    #[must_use]
    pub const fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from configuration and wait until it is connected.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let command_timeout = Duration::from_secs(config.command_timeout_secs);
        let heartbeat = Duration::from_secs(config.heartbeat_secs);

        let pool = Builder::from_config(FredConfig::from_url(&config.url)?)
            .with_connection_config(|connection| {
                connection.internal_command_timeout = command_timeout;
                connection.reconnect_on_auth_error = true;
                connection.tcp = TcpConfig {
                    #[cfg(target_os = "linux")]
                    user_timeout: Some(command_timeout),
                    ..Default::default()
                };
                connection.unresponsive = UnresponsiveConfig {
                    max_timeout: Some(heartbeat),
                    interval: Duration::from_secs(3),
                };
            })
            .with_performance_config(|performance| {
                performance.default_command_timeout = command_timeout;
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 5000, 2))
            .build_pool(config.pool_size)?;

        for client in pool.clients() {
            let mut error_rx = client.error_rx();
            let mut reconnect_rx = client.reconnect_rx();
            let mut unresponsive_rx = client.unresponsive_rx();

            tokio::spawn(async move {
                loop {
                    match error_rx.recv().await {
                        Ok((error, server)) => {
                            error!(?server, error = %error, "Redis connection error");
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            tokio::spawn(async move {
                loop {
                    match unresponsive_rx.recv().await {
                        Ok(server) => error!(?server, "Redis server unresponsive"),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            tokio::spawn(async move {
                loop {
                    match reconnect_rx.recv().await {
                        Ok(server) => debug!(?server, "Redis connection established"),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            });
        }

        let handles = pool.connect_pool();
        pool.wait_for_connect().await?;
        tokio::spawn(async move {
            let _results = join_all(handles).await;
        });

        info!(pool_size = config.pool_size, "Connected to Redis");
        Ok(Self { pool })
    }

    /// Close every pooled connection.
    pub async fn quit(&self) -> StoreResult<()> {
        self.pool.quit().await?;
        Ok(())
    }
}

/// Pair up a `ZRANGE ... WITHSCORES` reply.
///
/// RESP2 replies are flat (`member, score, member, score`); RESP3 replies
/// nest each pair in its own array.
fn scored_members(values: Vec<Value>) -> Vec<(String, i64)> {
    let flat: Vec<Value> = values
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(pair) => pair,
            other => vec![other],
        })
        .collect();

    flat.chunks_exact(2)
        .filter_map(|pair| {
            let member = pair[0].as_string()?;
            let score = pair[1].as_f64()?;
            Some((member, score as i64))
        })
        .collect()
}

fn expiration(ttl: Duration) -> Expiration {
    Expiration::EX(ttl.as_secs().max(1) as i64)
}

#[async_trait]
impl Store for RedisStore {
    async fn list_push(&self, key: &str, value: Bytes) -> StoreResult<usize> {
        let len: i64 = self.pool.rpush(key, Value::Bytes(value)).await?;
        Ok(len as usize)
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        let len: i64 = self.pool.llen(key).await?;
        Ok(len as usize)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        let values: Vec<Value> = self.pool.lrange(key, start, stop).await?;
        Ok(values
            .iter()
            .filter_map(Value::as_bytes)
            .map(Bytes::copy_from_slice)
            .collect())
    }

    async fn list_trim_head(&self, key: &str, count: usize) -> StoreResult<()> {
        self.pool.ltrim::<(), _>(key, count as i64, -1).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.pool.del::<i64, _>(keys.to_vec()).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        // NX returns None if key already exists, Some("OK") if set
        let result: Option<String> = self
            .pool
            .set(key, value, ttl.map(expiration), Some(SetOptions::NX), false)
            .await?;
        Ok(result.is_some())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.pool
            .set::<(), _, _>(key, value, None, None, false)
            .await?;
        Ok(())
    }

    async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let result: Option<String> = self
            .pool
            .set(key, value, Some(expiration(ttl)), Some(SetOptions::XX), false)
            .await?;
        Ok(result.is_some())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let count: i64 = self.pool.exists(key).await?;
        Ok(count > 0)
    }

    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let created: i64 = self.pool.hsetnx(key, field, value).await?;
        Ok(created == 1)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.pool.hgetall(key).await?)
    }

    async fn zset_add(
        &self,
        key: &str,
        member: &str,
        score: i64,
        mode: ZAddMode,
    ) -> StoreResult<()> {
        let ordering = match mode {
            ZAddMode::Always => None,
            // ZADD LT also inserts missing members (Redis >= 6.2).
            ZAddMode::IfEarlier => Some(Ordering::LessThan),
        };
        self.pool
            .zadd::<i64, _, _>(key, None, ordering, false, false, (score as f64, member))
            .await?;
        Ok(())
    }

    async fn zset_head(&self, key: &str, count: usize) -> StoreResult<Vec<(String, i64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let values: Vec<Value> = self
            .pool
            .zrange(key, 0_i64, count as i64 - 1, None, false, None, true)
            .await?;
        Ok(scored_members(values))
    }

    async fn zset_score(&self, key: &str, member: &str) -> StoreResult<Option<i64>> {
        let score: Option<f64> = self.pool.zscore(key, member).await?;
        Ok(score.map(|score| score as i64))
    }

    async fn zset_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        self.pool.zrem::<i64, _, _>(key, member).await?;
        Ok(())
    }

    async fn zset_count(&self, key: &str) -> StoreResult<usize> {
        let count: i64 = self.pool.zcard(key).await?;
        Ok(count as usize)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.pool.ping::<()>(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_rounds_up_to_one_second() {
        assert_eq!(expiration(Duration::from_millis(10)), Expiration::EX(1));
        assert_eq!(expiration(Duration::from_secs(300)), Expiration::EX(300));
    }

    #[test]
    fn test_scored_members_reads_flat_and_nested_replies() {
        let flat = vec![
            Value::from("a"),
            Value::from("5"),
            Value::from("b"),
            Value::from("12"),
        ];
        assert_eq!(
            scored_members(flat),
            vec![("a".to_string(), 5), ("b".to_string(), 12)]
        );

        let nested = vec![Value::Array(vec![Value::from("a"), Value::Double(5.0)])];
        assert_eq!(scored_members(nested), vec![("a".to_string(), 5)]);
    }

    #[test]
    fn test_io_errors_map_to_unavailable() {
        let err = RedisError::new(RedisErrorKind::IO, "connection reset");
        assert!(matches!(StoreError::from(err), StoreError::Unavailable(_)));

        let err = RedisError::new(RedisErrorKind::InvalidArgument, "bad");
        assert!(matches!(StoreError::from(err), StoreError::Redis(_)));
    }
}
