use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConsumeError;

/// A logical change stream relayed from the system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    LabResults,
    Patients,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::LabResults, EntityKind::Patients];

    /// Stream name used for state keys, flags and metric labels.
    pub fn stream_name(&self) -> &'static str {
        match self {
            EntityKind::LabResults => "lab_results",
            EntityKind::Patients => "patients",
        }
    }

    /// Path segment of the entity on the source API.
    pub fn api_path(&self) -> &'static str {
        match self {
            EntityKind::LabResults => "lab-results",
            EntityKind::Patients => "patients",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream_name())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "lab_results" | "lab-results" => Ok(EntityKind::LabResults),
            "patients" => Ok(EntityKind::Patients),
            other => Err(format!("unknown stream: {}", other)),
        }
    }
}

/// Identifiers of one changed entity, as listed by the source and carried
/// as the message payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    #[serde(default)]
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encounter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

impl ChangeNotification {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ..Default::default()
        }
    }

    /// Check the identifiers mandatory for `kind`.
    pub fn validate(&self, kind: EntityKind) -> Result<(), ConsumeError> {
        if self.entity_id.trim().is_empty() {
            return Err(ConsumeError::MissingField("entityId"));
        }
        if kind == EntityKind::LabResults
            && self.patient_id.as_deref().map_or(true, |p| p.trim().is_empty())
        {
            return Err(ConsumeError::MissingField("patientId"));
        }
        Ok(())
    }

    /// Encounter id, if present and non-empty.
    pub fn encounter(&self) -> Option<&str> {
        self.encounter_id.as_deref().filter(|e| !e.trim().is_empty())
    }
}

/// Parameters of a single "list changed" request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamCursor {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: u32,
    pub leave_unprocessed: bool,
}

impl StreamCursor {
    pub fn window(
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        limit: Option<u32>,
        leave_unprocessed: bool,
    ) -> Self {
        Self {
            start_time,
            end_time,
            limit,
            offset: 0,
            leave_unprocessed,
        }
    }

    /// Pagination only applies to a bounded page over a time window.
    pub fn is_paginated(&self) -> bool {
        matches!(self.limit, Some(limit) if limit > 0)
            && (self.start_time.is_some() || self.end_time.is_some())
    }

    /// The source marks listed records processed, so the unprocessed set
    /// shrinks under the cursor and every page starts at offset zero.
    pub fn consumes_listing(&self) -> bool {
        self.start_time.is_none() && !self.leave_unprocessed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub reference_range: Option<String>,
    #[serde(default)]
    pub abnormal_flag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabResultDocument {
    pub id: String,
    pub patient_id: String,
    /// Provenance; only interface-sourced results are merged
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub result_date: Option<String>,
    #[serde(default)]
    pub observations: Vec<Observation>,
}

impl LabResultDocument {
    pub fn is_interface_sourced(&self) -> bool {
        self.source.trim().eq_ignore_ascii_case("interface")
    }
}
