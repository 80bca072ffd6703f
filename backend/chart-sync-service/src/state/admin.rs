//! Operator edits to relay state.
//!
//! Each edit holds the stream lock for its duration so it cannot interleave
//! with a poll cycle, which would overwrite it on completion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{CheckpointStore, LockService, StreamLease};
use crate::error::{RelayError, StateError};

/// Lease taken by operator edits; they finish well within it.
pub const ADMIN_LEASE: Duration = Duration::from_secs(30);

async fn acquire(locks: &dyn LockService, stream: &str) -> Result<StreamLease, RelayError> {
    locks
        .acquire(stream, ADMIN_LEASE)
        .await?
        .ok_or_else(|| RelayError::LockUnavailable(stream.to_string()))
}

async fn release(locks: &dyn LockService, lease: StreamLease) {
    let stream = lease.stream.clone();
    match locks.release(lease).await {
        Ok(true) => {}
        Ok(false) => warn!(stream = %stream, "Admin lease expired before release"),
        Err(e) => warn!(stream = %stream, error = %e, "Failed to release admin lease"),
    }
}

/// Make the next cycle of `stream` backfill every change since `since`.
///
/// The dirty bit is written before the watermark moves, so a half-applied
/// replay still triggers recovery.
pub async fn replay_since(
    checkpoints: &dyn CheckpointStore,
    locks: &dyn LockService,
    stream: &str,
    since: DateTime<Utc>,
) -> Result<(), RelayError> {
    let lease = acquire(locks, stream).await?;

    let result: Result<(), StateError> = async {
        checkpoints.set_dirty_bit(stream, true).await?;
        checkpoints.set_watermark(stream, since).await
    }
    .await;

    release(locks, lease).await;
    result?;
    info!(stream, since = %since, "Replay scheduled");
    Ok(())
}

/// Drop a pending recovery for `stream`.
pub async fn clear_dirty(
    checkpoints: &dyn CheckpointStore,
    locks: &dyn LockService,
    stream: &str,
) -> Result<(), RelayError> {
    let lease = acquire(locks, stream).await?;
    let result = checkpoints.set_dirty_bit(stream, false).await;
    release(locks, lease).await;
    result?;
    info!(stream, "Dirty bit cleared");
    Ok(())
}
