//! Lease-based distributed lock.
//!
//! Acquisition is a single `SET key token NX PX lease`; the lease expires on
//! its own if the holder crashes. Release deletes the key only when it still
//! holds the caller's token, so an expired holder can never release a lock
//! that was re-acquired by someone else.

use redis::{RedisResult, Script};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{run_with_timeout, SharedConnectionManager};

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Proof of lock ownership returned by [`LeaseLock::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    key: String,
    token: String,
}

impl LeaseToken {
    /// Rebuild a token persisted or carried by a caller.
    pub fn new(key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Clone)]
pub struct LeaseLock {
    redis: SharedConnectionManager,
}

impl LeaseLock {
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self { redis }
    }

    /// Try to take `key` for `lease`. Returns `None` if another holder owns it.
    pub async fn try_acquire(&self, key: &str, lease: Duration) -> RedisResult<Option<LeaseToken>> {
        let token = Uuid::new_v4().to_string();
        let lease_ms = usize::try_from(lease.as_millis()).unwrap_or(usize::MAX).max(1);

        let mut conn = self.redis.lock().await.clone();
        let acquired: bool = run_with_timeout(redis::AsyncCommands::set_options(
            &mut conn,
            key,
            &token,
            redis::SetOptions::default()
                .conditional_set(redis::ExistenceCheck::NX)
                .with_expiration(redis::SetExpiry::PX(lease_ms)),
        ))
        .await?;

        if acquired {
            debug!(key, lease_ms, "Lock acquired");
            Ok(Some(LeaseToken {
                key: key.to_string(),
                token,
            }))
        } else {
            debug!(key, "Lock held elsewhere");
            Ok(None)
        }
    }

    /// Release the lock if `token` still owns it. Returns whether a key was deleted.
    pub async fn release(&self, token: &LeaseToken) -> RedisResult<bool> {
        let mut conn = self.redis.lock().await.clone();
        let deleted: i64 = run_with_timeout(
            Script::new(RELEASE_SCRIPT)
                .key(&token.key)
                .arg(&token.token)
                .invoke_async(&mut conn),
        )
        .await?;

        if deleted == 0 {
            warn!(key = %token.key, "Lock lease expired before release");
        } else {
            debug!(key = %token.key, "Lock released");
        }
        Ok(deleted > 0)
    }
}
