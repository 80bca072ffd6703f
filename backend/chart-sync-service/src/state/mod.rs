//! Durable relay state: dirty bit, watermarks and the per-stream lock.
//!
//! Key layout in the key-value store:
//! - `{stream}_dirty_bit`      `"true"` while a poll cycle is in flight
//! - `{stream}_last_processed` unix seconds of the last clean cycle
//! - `{stream}_lock`           lease token of the current relay instance
//!
//! Consumers track their own progress under the stream name
//! `{stream}_consumer`, so `lab_results_consumer_last_processed`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StateError;

pub mod admin;
mod redis_store;

pub use redis_store::RedisState;

pub fn dirty_bit_key(stream: &str) -> String {
    format!("{}_dirty_bit", stream)
}

pub fn watermark_key(stream: &str) -> String {
    format!("{}_last_processed", stream)
}

pub fn lock_key(stream: &str) -> String {
    format!("{}_lock", stream)
}

/// Stream name under which a consumer of `stream` records its watermark.
pub fn consumer_stream(stream: &str) -> String {
    format!("{}_consumer", stream)
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Absent dirty bit reads as `false`.
    async fn dirty_bit(&self, stream: &str) -> Result<bool, StateError>;

    async fn set_dirty_bit(&self, stream: &str, dirty: bool) -> Result<(), StateError>;

    /// `None` means the stream was never processed.
    async fn watermark(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StateError>;

    async fn set_watermark(&self, stream: &str, at: DateTime<Utc>) -> Result<(), StateError>;
}

/// Ownership of a stream's lock for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLease {
    pub stream: String,
    pub token: String,
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// `None` when another instance holds the lock.
    async fn acquire(&self, stream: &str, lease: Duration)
        -> Result<Option<StreamLease>, StateError>;

    /// Returns `false` if the lease had already expired.
    async fn release(&self, lease: StreamLease) -> Result<bool, StateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(dirty_bit_key("lab_results"), "lab_results_dirty_bit");
        assert_eq!(watermark_key("lab_results"), "lab_results_last_processed");
        assert_eq!(lock_key("patients"), "patients_lock");
        assert_eq!(
            watermark_key(&consumer_stream("lab_results")),
            "lab_results_consumer_last_processed"
        );
    }
}
