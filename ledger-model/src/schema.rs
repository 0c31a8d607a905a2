//! Arrow schemas and batch builders for the three row kinds this pipeline
//! writes. One builder per row type, mirroring the corpus's convention of a
//! dedicated `*RecordBuilder` per table rather than a single generic one.

use crate::types::{AcsContract, Event, Update};
use arrow::array::{Int32Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

pub fn updates_schema() -> Schema {
    Schema::new(vec![
        Field::new("update_id", DataType::Utf8, false),
        Field::new("migration_id", DataType::Int64, false),
        Field::new("synchronizer_id", DataType::Utf8, false),
        Field::new(
            "record_time",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new(
            "effective_at",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("offset", DataType::Int64, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("root_event_ids", DataType::Utf8, true),
        Field::new("event_count", DataType::Int32, false),
        Field::new("update_data", DataType::Utf8, false),
    ])
}

pub fn events_schema() -> Schema {
    Schema::new(vec![
        Field::new("event_id", DataType::Utf8, true),
        Field::new("update_id", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("event_type_original", DataType::Utf8, false),
        Field::new("contract_id", DataType::Utf8, true),
        Field::new("template_id", DataType::Utf8, true),
        Field::new("package_name", DataType::Utf8, true),
        Field::new("migration_id", DataType::Int64, false),
        Field::new("child_event_ids", DataType::Utf8, true),
        Field::new("payload", DataType::Utf8, true),
        Field::new("raw_event", DataType::Utf8, false),
    ])
}

pub fn acs_schema() -> Schema {
    Schema::new(vec![
        Field::new("contract_id", DataType::Utf8, false),
        Field::new("event_id", DataType::Utf8, true),
        Field::new("package_name", DataType::Utf8, true),
        Field::new("module_name", DataType::Utf8, true),
        Field::new("entity_name", DataType::Utf8, true),
        Field::new("migration_id", DataType::Int64, false),
        Field::new(
            "record_time",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new(
            "snapshot_time",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("payload", DataType::Utf8, true),
        Field::new("raw", DataType::Utf8, false),
    ])
}

/// Builds a [`RecordBatch`] of updates, joining list-valued
/// `root_event_ids` with `,` (the canonical opaque blobs already carry the
/// full structured data; this column is for convenience filtering only).
pub fn updates_to_batch(rows: &[Update]) -> anyhow::Result<RecordBatch> {
    let update_id: StringArray = rows.iter().map(|u| Some(u.update_id.as_str())).collect();
    let migration_id: Int64Array = rows.iter().map(|u| Some(u.migration_id)).collect();
    let synchronizer_id: StringArray = rows.iter().map(|u| Some(u.synchronizer_id.as_str())).collect();
    let record_time: TimestampMicrosecondArray = rows
        .iter()
        .map(|u| Some(u.record_time.timestamp_micros()))
        .collect::<TimestampMicrosecondArray>()
        .with_timezone("UTC");
    let effective_at: TimestampMicrosecondArray = rows
        .iter()
        .map(|u| Some(u.effective_at.timestamp_micros()))
        .collect::<TimestampMicrosecondArray>()
        .with_timezone("UTC");
    let offset: Int64Array = rows.iter().map(|u| Some(u.offset)).collect();
    let kind: StringArray = rows.iter().map(|u| Some(u.kind.as_str())).collect();
    let root_event_ids: StringArray = rows
        .iter()
        .map(|u| Some(u.root_event_ids.join(",")))
        .collect();
    let event_count: Int32Array = rows.iter().map(|u| Some(u.event_count)).collect();
    let update_data: StringArray = rows.iter().map(|u| Some(u.update_data.as_str())).collect();

    Ok(RecordBatch::try_new(
        Arc::new(updates_schema()),
        vec![
            Arc::new(update_id),
            Arc::new(migration_id),
            Arc::new(synchronizer_id),
            Arc::new(record_time),
            Arc::new(effective_at),
            Arc::new(offset),
            Arc::new(kind),
            Arc::new(root_event_ids),
            Arc::new(event_count),
            Arc::new(update_data),
        ],
    )?)
}

/// Builds a [`RecordBatch`] of events.
pub fn events_to_batch(rows: &[Event]) -> anyhow::Result<RecordBatch> {
    let event_id: StringArray = rows.iter().map(|e| e.event_id.as_deref()).collect();
    let update_id: StringArray = rows.iter().map(|e| Some(e.update_id.as_str())).collect();
    let event_type: StringArray = rows.iter().map(|e| Some(e.event_type.as_str())).collect();
    let event_type_original: StringArray = rows
        .iter()
        .map(|e| Some(e.event_type_original.as_str()))
        .collect();
    let contract_id: StringArray = rows.iter().map(|e| e.contract_id.as_deref()).collect();
    let template_id: StringArray = rows.iter().map(|e| e.template_id.as_deref()).collect();
    let package_name: StringArray = rows.iter().map(|e| e.package_name.as_deref()).collect();
    let migration_id: Int64Array = rows.iter().map(|e| Some(e.migration_id)).collect();
    let child_event_ids: StringArray = rows
        .iter()
        .map(|e| Some(e.child_event_ids.join(",")))
        .collect();
    let payload: StringArray = rows.iter().map(|e| e.payload.as_deref()).collect();
    let raw_event: StringArray = rows.iter().map(|e| Some(e.raw_event.as_str())).collect();

    Ok(RecordBatch::try_new(
        Arc::new(events_schema()),
        vec![
            Arc::new(event_id),
            Arc::new(update_id),
            Arc::new(event_type),
            Arc::new(event_type_original),
            Arc::new(contract_id),
            Arc::new(template_id),
            Arc::new(package_name),
            Arc::new(migration_id),
            Arc::new(child_event_ids),
            Arc::new(payload),
            Arc::new(raw_event),
        ],
    )?)
}

/// Builds a [`RecordBatch`] of ACS contracts.
pub fn acs_to_batch(rows: &[AcsContract]) -> anyhow::Result<RecordBatch> {
    let contract_id: StringArray = rows.iter().map(|c| Some(c.contract_id.as_str())).collect();
    let event_id: StringArray = rows.iter().map(|c| c.event_id.as_deref()).collect();
    let package_name: StringArray = rows
        .iter()
        .map(|c| c.template_id.as_ref().map(|t| t.package_name.as_str()))
        .collect();
    let module_name: StringArray = rows
        .iter()
        .map(|c| c.template_id.as_ref().map(|t| t.module_name.as_str()))
        .collect();
    let entity_name: StringArray = rows
        .iter()
        .map(|c| c.template_id.as_ref().map(|t| t.entity_name.as_str()))
        .collect();
    let migration_id: Int64Array = rows.iter().map(|c| Some(c.migration_id)).collect();
    let record_time: TimestampMicrosecondArray = rows
        .iter()
        .map(|c| Some(c.record_time.timestamp_micros()))
        .collect::<TimestampMicrosecondArray>()
        .with_timezone("UTC");
    let snapshot_time: TimestampMicrosecondArray = rows
        .iter()
        .map(|c| Some(c.snapshot_time.timestamp_micros()))
        .collect::<TimestampMicrosecondArray>()
        .with_timezone("UTC");
    let payload: StringArray = rows.iter().map(|c| c.payload.as_deref()).collect();
    let raw: StringArray = rows.iter().map(|c| Some(c.raw.as_str())).collect();

    Ok(RecordBatch::try_new(
        Arc::new(acs_schema()),
        vec![
            Arc::new(contract_id),
            Arc::new(event_id),
            Arc::new(package_name),
            Arc::new(module_name),
            Arc::new(entity_name),
            Arc::new(migration_id),
            Arc::new(record_time),
            Arc::new(snapshot_time),
            Arc::new(payload),
            Arc::new(raw),
        ],
    )?)
}
