use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use redis_utils::{run_with_timeout, LeaseLock, LeaseToken, SharedConnectionManager};
use tracing::{debug, error};

use super::{dirty_bit_key, lock_key, watermark_key, CheckpointStore, LockService, StreamLease};
use crate::error::StateError;

/// Redis-backed [`CheckpointStore`] and [`LockService`].
#[derive(Clone)]
pub struct RedisState {
    redis: SharedConnectionManager,
    lock: LeaseLock,
}

impl RedisState {
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self {
            lock: LeaseLock::new(redis.clone()),
            redis,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut conn = self.redis.lock().await.clone();
        run_with_timeout(conn.get(key)).await.map_err(|e| {
            error!("Failed to read {}: {}", key, e);
            StateError::Redis(e)
        })
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StateError> {
        let mut conn = self.redis.lock().await.clone();
        run_with_timeout(conn.set::<_, _, ()>(key, value))
            .await
            .map_err(|e| {
                error!("Failed to write {}: {}", key, e);
                StateError::Redis(e)
            })
    }
}

fn parse_dirty_bit(key: &str, raw: Option<String>) -> Result<bool, StateError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(StateError::Corrupt {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

fn parse_watermark(key: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StateError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let corrupt = || StateError::Corrupt {
        key: key.to_string(),
        value: raw.clone(),
    };
    let secs: i64 = raw.trim().parse().map_err(|_| corrupt())?;
    Utc.timestamp_opt(secs, 0).single().map(Some).ok_or_else(corrupt)
}

#[async_trait]
impl CheckpointStore for RedisState {
    async fn dirty_bit(&self, stream: &str) -> Result<bool, StateError> {
        let key = dirty_bit_key(stream);
        parse_dirty_bit(&key, self.get(&key).await?)
    }

    async fn set_dirty_bit(&self, stream: &str, dirty: bool) -> Result<(), StateError> {
        self.set(&dirty_bit_key(stream), dirty.to_string()).await?;
        debug!(stream, dirty, "Dirty bit written");
        Ok(())
    }

    async fn watermark(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StateError> {
        let key = watermark_key(stream);
        parse_watermark(&key, self.get(&key).await?)
    }

    async fn set_watermark(&self, stream: &str, at: DateTime<Utc>) -> Result<(), StateError> {
        self.set(&watermark_key(stream), at.timestamp().to_string())
            .await?;
        debug!(stream, watermark = at.timestamp(), "Watermark written");
        Ok(())
    }
}

#[async_trait]
impl LockService for RedisState {
    async fn acquire(
        &self,
        stream: &str,
        lease: Duration,
    ) -> Result<Option<StreamLease>, StateError> {
        let token = self.lock.try_acquire(&lock_key(stream), lease).await?;
        Ok(token.map(|t| StreamLease {
            stream: stream.to_string(),
            token: t.token().to_string(),
        }))
    }

    async fn release(&self, lease: StreamLease) -> Result<bool, StateError> {
        let token = LeaseToken::new(lock_key(&lease.stream), lease.token);
        Ok(self.lock.release(&token).await?)
    }
}
