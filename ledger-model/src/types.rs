//! Core entities: [`Update`], [`Event`], [`AcsContract`] and [`Cursor`].
//!
//! Raw wire shapes (`Raw*`) preserve every field the API sends, including
//! ones this crate does not name, by keeping the original JSON value
//! alongside the parsed fields. Canonical shapes are what gets written to
//! Parquet.

use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of an [`Update`], resolved by C2 from the wrapper present on the
/// raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Transaction,
    Reassignment,
    Unknown,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Transaction => "transaction",
            UpdateKind::Reassignment => "reassignment",
            UpdateKind::Unknown => "unknown",
        }
    }
}

/// A raw update as received from the ledger API, before normalization.
/// `data` is the complete, unparsed original message -- the named fields
/// below are read out of it, not split off of it, so the blob stays whole
/// for [`crate::normalize::normalize_update`] to preserve verbatim.
#[derive(Debug, Clone)]
pub struct RawUpdate {
    pub update_id: String,
    pub migration_id: i64,
    pub synchronizer_id: String,
    pub record_time: String,
    pub effective_at: Option<String>,
    pub offset: i64,
    pub transaction: Option<Value>,
    pub reassignment: Option<Value>,
    pub data: Value,
}

impl RawUpdate {
    /// Reads the named fields out of `data` without consuming it; `data`
    /// itself is kept as the complete original message.
    pub fn from_value(data: Value) -> Result<Self, IngestError> {
        fn str_field(data: &Value, name: &str) -> Result<String, IngestError> {
            data.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| IngestError::SchemaValidation(format!("update missing `{name}`")))
        }

        let update_id = str_field(&data, "update_id")?;
        let migration_id = data
            .get("migration_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| IngestError::SchemaValidation(format!("update {update_id} missing `migration_id`")))?;
        let synchronizer_id = str_field(&data, "synchronizer_id")?;
        let record_time = str_field(&data, "record_time")?;
        let effective_at = data.get("effective_at").and_then(Value::as_str).map(str::to_string);
        let offset = data
            .get("offset")
            .and_then(Value::as_i64)
            .ok_or_else(|| IngestError::SchemaValidation(format!("update {update_id} missing `offset`")))?;
        let transaction = data.get("transaction").cloned();
        let reassignment = data.get("reassignment").cloned();

        Ok(Self {
            update_id,
            migration_id,
            synchronizer_id,
            record_time,
            effective_at,
            offset,
            transaction,
            reassignment,
            data,
        })
    }
}

/// The canonical, flat row for an update. `update_data` preserves the
/// complete original blob.
#[derive(Debug, Clone)]
pub struct Update {
    pub update_id: String,
    pub migration_id: i64,
    pub synchronizer_id: String,
    pub record_time: DateTime<Utc>,
    pub effective_at: DateTime<Utc>,
    pub offset: i64,
    pub kind: UpdateKind,
    pub root_event_ids: Vec<String>,
    pub event_count: i32,
    pub update_data: String,
}

/// The event type after the `created_event`/`archived_event`/
/// `exercised_event` nesting is unwrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Archived,
    Exercised,
    ReassignCreate,
    ReassignArchive,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Archived => "archived",
            EventType::Exercised => "exercised",
            EventType::ReassignCreate => "reassign_create",
            EventType::ReassignArchive => "reassign_archive",
        }
    }
}

/// A node in an update's event tree.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: Option<String>,
    pub update_id: String,
    pub event_type: EventType,
    pub event_type_original: String,
    pub contract_id: Option<String>,
    pub template_id: Option<String>,
    pub package_name: Option<String>,
    pub migration_id: i64,
    pub child_event_ids: Vec<String>,
    pub payload: Option<String>,
    pub raw_event: String,
}

/// A `template_id` decomposed into its three Daml-style components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateIdParts {
    pub package_name: String,
    pub module_name: String,
    pub entity_name: String,
}

impl TemplateIdParts {
    /// Parses a template id of the form `package:Module:Entity`. Returns
    /// `None` if the id does not have exactly three `:`-separated parts.
    pub fn parse(template_id: &str) -> Option<Self> {
        let mut parts = template_id.splitn(3, ':');
        let package_name = parts.next()?.to_string();
        let module_name = parts.next()?.to_string();
        let entity_name = parts.next()?.to_string();
        Some(Self {
            package_name,
            module_name,
            entity_name,
        })
    }
}

/// An entry in an active-contract-set snapshot.
#[derive(Debug, Clone)]
pub struct AcsContract {
    pub contract_id: String,
    pub event_id: Option<String>,
    pub template_id: Option<TemplateIdParts>,
    pub migration_id: i64,
    pub record_time: DateTime<Utc>,
    pub snapshot_time: DateTime<Utc>,
    pub payload: Option<String>,
    pub raw: String,
}

/// One of the two ledger-data sources: a historical backfill run or the
/// live forward stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Backfill,
    Updates,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Backfill => "backfill",
            Source::Updates => "updates",
        }
    }
}

/// Which row kind a partitioned file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Updates,
    Events,
}

impl PartitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKind::Updates => "updates",
            PartitionKind::Events => "events",
        }
    }
}
