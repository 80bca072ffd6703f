//! Lab result consumer: merges relayed changes into encounter notes.

pub mod merge;

use std::sync::Arc;

use async_trait::async_trait;
use stream_transport::{ConsumedMessage, MessageHandler};
use tracing::{debug, info, warn};

use crate::clients::{ChangeSource, NotesTarget};
use crate::error::ConsumeError;
use crate::metrics::ConsumerMetrics;
use crate::models::{ChangeNotification, EntityKind};
use crate::relay::{Clock, BACKFILL_HEADER};
use crate::state::{consumer_stream, CheckpointStore};

pub use merge::{plan_merge, render_fragment, MergePlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotInterfaceSourced,
    NoObservations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { replace: bool },
    Skipped(SkipReason),
}

pub struct LabResultConsumer {
    source: Arc<dyn ChangeSource>,
    target: Arc<dyn NotesTarget>,
    checkpoints: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    watermark_stream: String,
    metrics: ConsumerMetrics,
}

impl LabResultConsumer {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        target: Arc<dyn NotesTarget>,
        checkpoints: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stream = EntityKind::LabResults.stream_name();
        Self {
            source,
            target,
            checkpoints,
            clock,
            watermark_stream: consumer_stream(stream),
            metrics: ConsumerMetrics::new(stream),
        }
    }

    /// Merge one change notification payload into the encounter's notes.
    pub async fn process(&self, payload: &[u8]) -> Result<MergeOutcome, ConsumeError> {
        let notification: ChangeNotification = serde_json::from_slice(payload)?;
        notification.validate(EntityKind::LabResults)?;

        let lab_result_id = notification.entity_id.as_str();
        let patient_id = notification
            .patient_id
            .as_deref()
            .ok_or(ConsumeError::MissingField("patientId"))?;

        let encounter_id = match notification.encounter() {
            Some(id) => id.to_string(),
            None => {
                let lookup = notification.order_id.as_deref().unwrap_or(lab_result_id);
                debug!(lab_result_id, lookup, "Resolving encounter for lab result");
                self.source.encounter_for_lab_result(lookup).await?
            }
        };

        let document = self.source.lab_result(patient_id, lab_result_id).await?;
        if !document.is_interface_sourced() {
            return Ok(MergeOutcome::Skipped(SkipReason::NotInterfaceSourced));
        }
        if document.observations.is_empty() {
            return Ok(MergeOutcome::Skipped(SkipReason::NoObservations));
        }

        let existing = self.target.discussion_notes(&encounter_id).await?;
        let fragment = render_fragment(&document);
        let plan = plan_merge(&existing, &document.id, &fragment);

        self.target
            .update_discussion_notes(&encounter_id, &plan.content, plan.replace)
            .await?;

        let now = self.clock.now();
        match self.checkpoints.set_watermark(&self.watermark_stream, now).await {
            Ok(()) => self.metrics.watermark.set(now.timestamp()),
            Err(e) => warn!(
                stream = %self.watermark_stream,
                error = %e,
                "Failed to advance consumer watermark"
            ),
        }

        Ok(MergeOutcome::Merged {
            replace: plan.replace,
        })
    }
}

#[async_trait]
impl MessageHandler for LabResultConsumer {
    async fn handle(&self, message: &ConsumedMessage) -> anyhow::Result<()> {
        let backfill = message.header(BACKFILL_HEADER) == Some("true");

        match self.process(&message.value).await {
            Ok(MergeOutcome::Merged { replace }) => {
                self.metrics.merged.inc();
                info!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    replace,
                    backfill,
                    "Lab result merged into discussion notes"
                );
                Ok(())
            }
            Ok(MergeOutcome::Skipped(reason)) => {
                self.metrics.skipped.inc();
                debug!(
                    topic = %message.topic,
                    offset = message.offset,
                    reason = ?reason,
                    "Lab result skipped"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.failed.inc();
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    backfill,
                    error = %e,
                    "Lab result merge failed"
                );
                Err(e.into())
            }
        }
    }
}
