//! In-memory collaborators shared by the service tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chart_sync_service::clients::{ChangeSource, NotesTarget};
use chart_sync_service::config::RelayConfig;
use chart_sync_service::error::{SourceError, StateError, TargetError};
use chart_sync_service::flags::{Flag, StaticFlags};
use chart_sync_service::models::{
    ChangeNotification, EntityKind, LabResultDocument, Observation, StreamCursor,
};
use chart_sync_service::relay::{Clock, RelayDeps};
use chart_sync_service::state::{CheckpointStore, LockService, StreamLease};
use chrono::{DateTime, TimeZone, Utc};
use stream_transport::{Message, MessagePublisher, TransportError, TransportResult};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn lab_change(id: &str, patient: &str, encounter: Option<&str>) -> ChangeNotification {
    ChangeNotification {
        entity_id: id.to_string(),
        patient_id: Some(patient.to_string()),
        encounter_id: encounter.map(str::to_string),
        order_id: None,
    }
}

pub fn lab_document(id: &str, patient: &str, source: &str, values: &[(&str, &str)]) -> LabResultDocument {
    LabResultDocument {
        id: id.to_string(),
        patient_id: patient.to_string(),
        source: source.to_string(),
        description: Some("Basic metabolic panel".to_string()),
        result_date: Some("03/08/2026".to_string()),
        observations: values
            .iter()
            .map(|(name, value)| Observation {
                name: name.to_string(),
                value: Some(value.to_string()),
                units: Some("mmol/L".to_string()),
                reference_range: None,
                abnormal_flag: None,
            })
            .collect(),
    }
}

pub fn relay_config(page_size: u32) -> RelayConfig {
    RelayConfig {
        poll_interval: Duration::from_millis(10),
        lock_lease: Duration::from_secs(30),
        page_size,
        leave_unprocessed: false,
    }
}

/// Source that serves change lists sliced by the cursor's offset and limit.
/// Requests with a start time are served from `backfill`; other listings
/// remove what they return unless the cursor leaves records unprocessed.
#[derive(Default)]
pub struct FakeSource {
    pub changes: Mutex<Vec<ChangeNotification>>,
    pub backfill: Mutex<Vec<ChangeNotification>>,
    pub cursors: Mutex<Vec<StreamCursor>>,
    pub documents: Mutex<HashMap<String, LabResultDocument>>,
    pub encounters: Mutex<HashMap<String, String>>,
    pub subscribed: Mutex<HashSet<EntityKind>>,
    pub subscribe_calls: Mutex<usize>,
    pub fail_list: AtomicBool,
    /// Latency added to every listing
    pub list_delay: Mutex<Option<Duration>>,
}

impl FakeSource {
    pub fn with_changes(changes: Vec<ChangeNotification>) -> Self {
        let source = Self::default();
        *source.changes.lock().unwrap() = changes;
        source
    }

    pub fn add_document(&self, doc: LabResultDocument) {
        self.documents.lock().unwrap().insert(doc.id.clone(), doc);
    }

    pub fn cursors(&self) -> Vec<StreamCursor> {
        self.cursors.lock().unwrap().clone()
    }
}

fn page(records: &[ChangeNotification], cursor: &StreamCursor) -> Vec<ChangeNotification> {
    let start = (cursor.offset as usize).min(records.len());
    let end = match cursor.limit {
        Some(limit) => (start + limit as usize).min(records.len()),
        None => records.len(),
    };
    records[start..end].to_vec()
}

#[async_trait]
impl ChangeSource for FakeSource {
    async fn list_changed(
        &self,
        _entity: EntityKind,
        cursor: &StreamCursor,
    ) -> Result<Vec<ChangeNotification>, SourceError> {
        self.cursors.lock().unwrap().push(cursor.clone());
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(SourceError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        if cursor.start_time.is_some() {
            return Ok(page(&self.backfill.lock().unwrap(), cursor));
        }
        let mut changes = self.changes.lock().unwrap();
        let listed = page(&changes, cursor);
        if !cursor.leave_unprocessed {
            let start = (cursor.offset as usize).min(changes.len());
            changes.drain(start..start + listed.len());
        }
        Ok(listed)
    }

    async fn subscription_active(&self, entity: EntityKind) -> Result<bool, SourceError> {
        Ok(self.subscribed.lock().unwrap().contains(&entity))
    }

    async fn subscribe(&self, entity: EntityKind) -> Result<(), SourceError> {
        *self.subscribe_calls.lock().unwrap() += 1;
        self.subscribed.lock().unwrap().insert(entity);
        Ok(())
    }

    async fn lab_result(
        &self,
        _patient_id: &str,
        lab_result_id: &str,
    ) -> Result<LabResultDocument, SourceError> {
        self.documents
            .lock()
            .unwrap()
            .get(lab_result_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("lab result {}", lab_result_id)))
    }

    async fn encounter_for_lab_result(&self, id: &str) -> Result<String, SourceError> {
        self.encounters
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("encounter for {}", id)))
    }
}

/// Notes store with the downstream replace/append semantics.
#[derive(Default)]
pub struct FakeTarget {
    pub notes: Mutex<HashMap<String, String>>,
    /// `(encounter_id, replace)` per update
    pub updates: Mutex<Vec<(String, bool)>>,
    pub fail_updates: AtomicBool,
}

impl FakeTarget {
    pub fn notes(&self, encounter_id: &str) -> String {
        self.notes
            .lock()
            .unwrap()
            .get(encounter_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn updates(&self) -> Vec<(String, bool)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotesTarget for FakeTarget {
    async fn discussion_notes(&self, encounter_id: &str) -> Result<String, TargetError> {
        Ok(self.notes(encounter_id))
    }

    async fn update_discussion_notes(
        &self,
        encounter_id: &str,
        content: &str,
        replace: bool,
    ) -> Result<(), TargetError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(TargetError::Status {
                status: 500,
                body: "notes store down".to_string(),
            });
        }
        let mut notes = self.notes.lock().unwrap();
        let entry = notes.entry(encounter_id.to_string()).or_default();
        if replace {
            *entry = content.to_string();
        } else {
            entry.push_str(content);
        }
        self.updates
            .lock()
            .unwrap()
            .push((encounter_id.to_string(), replace));
        Ok(())
    }
}

/// Dirty bits, watermarks and locks kept in process memory.
#[derive(Default)]
pub struct MemoryState {
    pub dirty: Mutex<HashMap<String, bool>>,
    pub watermarks: Mutex<HashMap<String, DateTime<Utc>>>,
    pub locks: Mutex<HashMap<String, String>>,
    pub fail_watermark_writes: AtomicBool,
    next_token: Mutex<u64>,
}

impl MemoryState {
    pub fn dirty(&self, stream: &str) -> bool {
        self.dirty.lock().unwrap().get(stream).copied().unwrap_or(false)
    }

    pub fn set_dirty(&self, stream: &str, dirty: bool) {
        self.dirty.lock().unwrap().insert(stream.to_string(), dirty);
    }

    pub fn watermark_of(&self, stream: &str) -> Option<DateTime<Utc>> {
        self.watermarks.lock().unwrap().get(stream).copied()
    }

    pub fn set_watermark_of(&self, stream: &str, at: DateTime<Utc>) {
        self.watermarks.lock().unwrap().insert(stream.to_string(), at);
    }

    /// Simulate another instance holding the stream lock.
    pub fn hold_lock(&self, stream: &str) {
        self.locks
            .lock()
            .unwrap()
            .insert(stream.to_string(), "other-instance".to_string());
    }

    pub fn is_locked(&self, stream: &str) -> bool {
        self.locks.lock().unwrap().contains_key(stream)
    }
}

#[async_trait]
impl CheckpointStore for MemoryState {
    async fn dirty_bit(&self, stream: &str) -> Result<bool, StateError> {
        Ok(self.dirty(stream))
    }

    async fn set_dirty_bit(&self, stream: &str, dirty: bool) -> Result<(), StateError> {
        self.set_dirty(stream, dirty);
        Ok(())
    }

    async fn watermark(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StateError> {
        Ok(self.watermark_of(stream))
    }

    async fn set_watermark(&self, stream: &str, at: DateTime<Utc>) -> Result<(), StateError> {
        if self.fail_watermark_writes.load(Ordering::SeqCst) {
            return Err(StateError::Corrupt {
                key: format!("{}_last_processed", stream),
                value: "write rejected".to_string(),
            });
        }
        self.set_watermark_of(stream, at);
        Ok(())
    }
}

#[async_trait]
impl LockService for MemoryState {
    async fn acquire(
        &self,
        stream: &str,
        _lease: Duration,
    ) -> Result<Option<StreamLease>, StateError> {
        let mut locks = self.locks.lock().unwrap();
        if locks.contains_key(stream) {
            return Ok(None);
        }
        let mut next = self.next_token.lock().unwrap();
        *next += 1;
        let token = format!("token-{}", next);
        locks.insert(stream.to_string(), token.clone());
        Ok(Some(StreamLease {
            stream: stream.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: StreamLease) -> Result<bool, StateError> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(&lease.stream) {
            Some(token) if *token == lease.token => {
                locks.remove(&lease.stream);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Publisher that records every message and rejects chosen keys.
#[derive(Default)]
pub struct RecordingPublisher {
    pub sent: Mutex<Vec<Message>>,
    pub reject_keys: Mutex<HashSet<String>>,
}

impl RecordingPublisher {
    pub fn reject(&self, key: &str) {
        self.reject_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_keys(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| m.key)
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn send(&self, message: Message) -> TransportResult<()> {
        let rejected = message
            .key
            .as_ref()
            .is_some_and(|k| self.reject_keys.lock().unwrap().contains(k));
        if rejected {
            return Err(TransportError::PublishFailed("broker unavailable".to_string()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

pub struct FixedClock(pub Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// All relay collaborators, kept concrete so tests can inspect them.
pub struct Harness {
    pub source: Arc<FakeSource>,
    pub publisher: Arc<RecordingPublisher>,
    pub state: Arc<MemoryState>,
    pub flags: Arc<StaticFlags>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new(source: FakeSource, now: DateTime<Utc>) -> Self {
        let flags = StaticFlags::new()
            .with(Flag::Poll(EntityKind::LabResults), true)
            .with(Flag::Poll(EntityKind::Patients), true);
        Self {
            source: Arc::new(source),
            publisher: Arc::new(RecordingPublisher::default()),
            state: Arc::new(MemoryState::default()),
            flags: Arc::new(flags),
            clock: Arc::new(FixedClock::new(now)),
        }
    }

    pub fn deps(&self) -> RelayDeps {
        RelayDeps {
            source: self.source.clone(),
            publisher: self.publisher.clone(),
            checkpoints: self.state.clone(),
            locks: self.state.clone(),
            flags: self.flags.clone(),
            clock: self.clock.clone(),
        }
    }
}
