//! Polling relay: source change lists to broker topic, with crash recovery.
//!
//! One [`PollingRelay`] runs per stream. Each cycle, under the stream lock:
//!
//! ```text
//! lock ─▶ now ─▶ dirty? ──yes, watermark─▶ backfill [watermark, now]
//!                  │                               │
//!                  └──────────────┬────────────────┘
//!                                 ▼
//!             dirty=true ─▶ fetch pages ─▶ publish ─▶ dirty=false ─▶ watermark=now ─▶ unlock
//! ```
//!
//! A failure after `dirty=true` and before the watermark write leaves the
//! dirty bit set, which makes the next cycle backfill the gap. A failed
//! watermark write sets the bit again before the cycle returns.

mod fetch;

pub use fetch::fetch_changes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stream_transport::{Message, MessagePublisher};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::ChangeSource;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::flags::{FeatureFlags, Flag};
use crate::metrics::RelayMetrics;
use crate::models::{ChangeNotification, EntityKind, StreamCursor};
use crate::state::{CheckpointStore, LockService};

/// Header marking messages republished by crash recovery.
pub const BACKFILL_HEADER: &str = "backfill";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outcome of one clean cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records republished by crash recovery
    pub backfilled: usize,
    /// Records published by the normal fetch
    pub published: usize,
    pub publish_failures: usize,
}

/// Collaborators shared by relay instances.
#[derive(Clone)]
pub struct RelayDeps {
    pub source: Arc<dyn ChangeSource>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub locks: Arc<dyn LockService>,
    pub flags: Arc<dyn FeatureFlags>,
    pub clock: Arc<dyn Clock>,
}

pub struct PollingRelay {
    entity: EntityKind,
    topic: String,
    settings: RelayConfig,
    deps: RelayDeps,
    metrics: RelayMetrics,
    subscribed: AtomicBool,
}

impl PollingRelay {
    pub fn new(
        entity: EntityKind,
        topic: impl Into<String>,
        settings: RelayConfig,
        deps: RelayDeps,
    ) -> Self {
        Self {
            entity,
            topic: topic.into(),
            settings,
            deps,
            metrics: RelayMetrics::new(entity.stream_name()),
            subscribed: AtomicBool::new(false),
        }
    }

    pub fn entity(&self) -> EntityKind {
        self.entity
    }

    fn stream(&self) -> &'static str {
        self.entity.stream_name()
    }

    fn cursor(&self, start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> StreamCursor {
        StreamCursor::window(
            start,
            Some(end),
            Some(self.settings.page_size),
            self.settings.leave_unprocessed,
        )
    }

    /// Tick on the poll interval until cancelled.
    ///
    /// The poll flag is re-read every tick. A cycle in flight when `cancel`
    /// fires runs to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            stream = self.stream(),
            topic = %self.topic,
            interval_secs = self.settings.poll_interval.as_secs(),
            "Polling relay started"
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.deps.flags.is_enabled(Flag::Poll(self.entity)).await {
                debug!(stream = self.stream(), "Polling disabled by flag");
                continue;
            }

            if let Err(e) = self.ensure_subscribed().await {
                warn!(stream = self.stream(), error = %e, "Source subscription not active, skipping cycle");
                continue;
            }

            match self.run_cycle().await {
                Ok(report) => info!(
                    stream = self.stream(),
                    backfilled = report.backfilled,
                    published = report.published,
                    publish_failures = report.publish_failures,
                    "Relay cycle complete"
                ),
                Err(RelayError::LockUnavailable(_)) => {
                    info!(stream = self.stream(), "Relay lock held by another instance, skipping cycle");
                }
                Err(e) => error!(stream = self.stream(), error = %e, "Relay cycle failed"),
            }
        }

        info!(stream = self.stream(), "Polling relay stopped");
    }

    /// Subscribe to source change events once per process.
    pub async fn ensure_subscribed(&self) -> Result<(), RelayError> {
        if self.subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let source = &self.deps.source;
        let active = source
            .subscription_active(self.entity)
            .await
            .map_err(|e| RelayError::Subscription(e.to_string()))?;
        if !active {
            source
                .subscribe(self.entity)
                .await
                .map_err(|e| RelayError::Subscription(e.to_string()))?;
        }

        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run one lock-guarded poll cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, RelayError> {
        let stream = self.stream();
        let lease = self
            .deps
            .locks
            .acquire(stream, self.settings.lock_lease)
            .await?
            .ok_or_else(|| RelayError::LockUnavailable(stream.to_string()))?;

        let result = self.locked_cycle().await;

        match self.deps.locks.release(lease).await {
            Ok(true) => {}
            Ok(false) => warn!(stream, "Relay lock lease expired during cycle"),
            Err(e) => warn!(stream, error = %e, "Failed to release relay lock"),
        }

        match &result {
            Ok(_) => self.metrics.cycles.inc(),
            Err(_) => self.metrics.cycle_failures.inc(),
        }
        result
    }

    async fn locked_cycle(&self) -> Result<CycleReport, RelayError> {
        let stream = self.stream();
        let checkpoints = &self.deps.checkpoints;
        let now = self.deps.clock.now();
        let mut report = CycleReport::default();

        let dirty = checkpoints.dirty_bit(stream).await?;
        let previous = checkpoints.watermark(stream).await?;

        if dirty {
            match previous {
                Some(since) => {
                    warn!(
                        stream,
                        since = %since,
                        until = %now,
                        "Dirty bit set, backfilling since last watermark"
                    );
                    self.metrics.backfills.inc();
                    let records = fetch_changes(
                        self.deps.source.as_ref(),
                        self.entity,
                        self.cursor(Some(since), now),
                    )
                    .await?;
                    let (ok, failed) = self.publish_all(&records, true).await;
                    report.backfilled = ok;
                    report.publish_failures += failed;
                }
                None => info!(stream, "Dirty bit set but stream never processed, nothing to backfill"),
            }
        }

        checkpoints.set_dirty_bit(stream, true).await?;

        let records =
            fetch_changes(self.deps.source.as_ref(), self.entity, self.cursor(None, now)).await?;
        let (ok, failed) = self.publish_all(&records, false).await;
        report.published = ok;
        report.publish_failures += failed;

        checkpoints.set_dirty_bit(stream, false).await?;
        match previous {
            Some(previous) if previous >= now => {
                warn!(stream, previous = %previous, now = %now, "Clock behind stored watermark, keeping it");
            }
            _ => {
                if let Err(e) = checkpoints.set_watermark(stream, now).await {
                    // The gap since `previous` is still unrecorded; recover it next cycle.
                    if let Err(restore) = checkpoints.set_dirty_bit(stream, true).await {
                        error!(stream, error = %restore, "Failed to restore dirty bit after watermark write failure");
                    }
                    return Err(e.into());
                }
                self.metrics.watermark.set(now.timestamp());
            }
        }

        Ok(report)
    }

    /// Publish each record; failures are logged per record and counted.
    async fn publish_all(&self, records: &[ChangeNotification], backfill: bool) -> (usize, usize) {
        let mut published = 0;
        let mut failed = 0;

        for record in records {
            let message = match Message::json(&self.topic, &record.entity_id, record) {
                Ok(message) if backfill => message.header(BACKFILL_HEADER, "true"),
                Ok(message) => message,
                Err(e) => {
                    warn!(stream = self.stream(), entity_id = %record.entity_id, error = %e, "Failed to encode change");
                    failed += 1;
                    continue;
                }
            };

            match self.deps.publisher.send(message).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(
                        stream = self.stream(),
                        topic = %self.topic,
                        entity_id = %record.entity_id,
                        backfill,
                        error = %e,
                        "Failed to publish change"
                    );
                    failed += 1;
                }
            }
        }

        self.metrics.published.inc_by(published as u64);
        self.metrics.publish_failures.inc_by(failed as u64);
        (published, failed)
    }
}
