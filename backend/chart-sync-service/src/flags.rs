//! Operator feature flags gating polling, consumption and consumer pause.
//!
//! Flags are looked up per use through [`FeatureFlags`] rather than held in
//! process-wide state, so every relay tick sees the current value. Consumer
//! gating is re-read on the flag refresh interval and applied as a pause.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis_utils::{run_with_timeout, SharedConnectionManager};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::FlagDefaults;
use crate::models::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Poll(EntityKind),
    Consume(EntityKind),
    PauseConsumers,
}

impl Flag {
    pub fn name(&self) -> String {
        match self {
            Flag::Poll(entity) => format!("poll_{}", entity.stream_name()),
            Flag::Consume(entity) => format!("consume_{}", entity.stream_name()),
            Flag::PauseConsumers => "pause_consumers".to_string(),
        }
    }
}

#[async_trait]
pub trait FeatureFlags: Send + Sync {
    async fn is_enabled(&self, flag: Flag) -> bool;
}

/// In-process flag values; unknown flags read as disabled.
#[derive(Debug, Default)]
pub struct StaticFlags {
    values: RwLock<HashMap<Flag, bool>>,
}

impl StaticFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_defaults(defaults: &FlagDefaults) -> Self {
        Self::new()
            .with(Flag::Poll(EntityKind::LabResults), defaults.poll_lab_results)
            .with(Flag::Poll(EntityKind::Patients), defaults.poll_patients)
            .with(
                Flag::Consume(EntityKind::LabResults),
                defaults.consume_lab_results,
            )
            .with(Flag::PauseConsumers, defaults.pause_consumers)
    }

    pub fn with(self, flag: Flag, enabled: bool) -> Self {
        self.set(flag, enabled);
        self
    }

    pub fn set(&self, flag: Flag, enabled: bool) {
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(flag, enabled);
    }

    pub fn get(&self, flag: Flag) -> bool {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&flag)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl FeatureFlags for StaticFlags {
    async fn is_enabled(&self, flag: Flag) -> bool {
        self.get(flag)
    }
}

/// Flags stored in Redis as `flag:{name}` = `true|false`.
///
/// Falls back to the configured default when the key is absent, unparsable
/// or Redis is unreachable.
pub struct RedisFlags {
    redis: SharedConnectionManager,
    defaults: StaticFlags,
}

impl RedisFlags {
    pub fn new(redis: SharedConnectionManager, defaults: StaticFlags) -> Self {
        Self { redis, defaults }
    }

    pub fn key(flag: Flag) -> String {
        format!("flag:{}", flag.name())
    }
}

#[async_trait]
impl FeatureFlags for RedisFlags {
    async fn is_enabled(&self, flag: Flag) -> bool {
        let key = Self::key(flag);
        let mut conn = self.redis.lock().await.clone();
        let raw: Result<Option<String>, _> = run_with_timeout(conn.get(&key)).await;

        match raw {
            Ok(Some(value)) => match value.trim().parse::<bool>() {
                Ok(enabled) => enabled,
                Err(_) => {
                    warn!(flag = %key, value = %value, "Unparsable flag value, using default");
                    self.defaults.get(flag)
                }
            },
            Ok(None) => self.defaults.get(flag),
            Err(e) => {
                warn!(flag = %key, error = %e, "Flag lookup failed, using default");
                self.defaults.get(flag)
            }
        }
    }
}

/// Whether consumer delivery should be held back: the operator paused
/// consumers, or lab result consumption is switched off.
pub async fn consumers_held(flags: &dyn FeatureFlags) -> bool {
    flags.is_enabled(Flag::PauseConsumers).await
        || !flags.is_enabled(Flag::Consume(EntityKind::LabResults)).await
}

/// Re-evaluate [`consumers_held`] every `interval` and publish it on a
/// watch channel, seeded with the current value.
///
/// The task stops when `cancel` fires.
pub async fn watch_consumer_hold(
    flags: Arc<dyn FeatureFlags>,
    interval: Duration,
    cancel: CancellationToken,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(consumers_held(flags.as_ref()).await);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let held = consumers_held(flags.as_ref()).await;
                    let changed = tx.send_if_modified(|current| {
                        let changed = *current != held;
                        *current = held;
                        changed
                    });
                    if changed {
                        debug!(held, "Consumer hold changed");
                    }
                }
            }
        }
    });

    rx
}
