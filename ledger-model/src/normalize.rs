//! C2 Record Normalizer.
//!
//! Maps one raw API object into the canonical row. This is the one place
//! where cross-version schema drift is absorbed: the opaque blob fields
//! (`update_data`, `raw_event`, `raw`) always carry the complete original
//! message, verbatim, so a bug here never loses data, only misfiles it.

use crate::error::IngestError;
use crate::types::{AcsContract, Event, EventType, RawUpdate, TemplateIdParts, Update, UpdateKind};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::warn;

/// Strict mode fails on an unresolvable field (e.g. an `unknown` update
/// kind); lenient mode logs a warning and preserves the raw blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizeMode {
    #[default]
    Strict,
    Lenient,
}

/// Parses an ISO-8601 timestamp leniently: a string with no timezone
/// offset is treated as UTC, never local time.
pub fn parse_lenient_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    anyhow::bail!("could not parse timestamp `{s}` as lenient-UTC")
}

fn resolve_kind(raw: &RawUpdate) -> UpdateKind {
    if raw.transaction.is_some() {
        UpdateKind::Transaction
    } else if raw.reassignment.is_some() {
        UpdateKind::Reassignment
    } else {
        UpdateKind::Unknown
    }
}

/// Normalizes one raw update into the canonical row.
pub fn normalize_update(raw: &RawUpdate, mode: NormalizeMode) -> Result<Update, IngestError> {
    let kind = resolve_kind(raw);
    if kind == UpdateKind::Unknown {
        let msg = format!("update {} has neither a transaction nor a reassignment wrapper", raw.update_id);
        match mode {
            NormalizeMode::Strict => return Err(IngestError::SchemaValidation(msg)),
            NormalizeMode::Lenient => warn!("{msg}, keeping raw blob"),
        }
    }

    let record_time = parse_lenient_utc(&raw.record_time)
        .map_err(|e| IngestError::SchemaValidation(format!("record_time: {e}")))?;
    let effective_at = match &raw.effective_at {
        Some(s) => parse_lenient_utc(s)
            .map_err(|e| IngestError::SchemaValidation(format!("effective_at: {e}")))?,
        None => record_time,
    };

    let root_event_ids = extract_root_event_ids(&raw.data);
    let event_count = root_event_ids.len() as i32;

    Ok(Update {
        update_id: raw.update_id.clone(),
        migration_id: raw.migration_id,
        synchronizer_id: raw.synchronizer_id.clone(),
        record_time,
        effective_at,
        offset: raw.offset,
        kind,
        root_event_ids,
        event_count,
        update_data: serde_json::to_string(&raw.data).unwrap_or_default(),
    })
}

fn extract_root_event_ids(data: &Value) -> Vec<String> {
    data.get("root_event_ids")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Unwraps `created_event`/`archived_event`/`exercised_event`/
/// `reassign_create`/`reassign_archive` nesting from one event node in the
/// raw tree. `index` is the node's position in a stable preorder traversal
/// of the update's event forest, used as the dedup fallback key when
/// `event_id` is missing.
pub fn normalize_event(
    raw_event: &Value,
    update_id: &str,
    migration_id: i64,
    index: usize,
    mode: NormalizeMode,
) -> Event {
    let (event_type_original, event_type, body) = unwrap_event_nesting(raw_event);

    let event_id = body
        .get("event_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    if event_id.is_none() {
        let fallback = format!("{update_id}:{index}");
        let msg = format!(
            "event at index {index} of update {update_id} has no event_id, \
             falling back to ({update_id}, {index}) for dedup (would-be id {fallback})"
        );
        match mode {
            NormalizeMode::Strict => warn!("{msg}"),
            NormalizeMode::Lenient => warn!("{msg}"),
        }
    }

    let contract_id = body
        .get("contract_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let template_id = body
        .get("template_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let package_name = body
        .get("package_name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let child_event_ids = body
        .get("child_event_ids")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let payload = body.get("payload").map(|v| v.to_string());

    Event {
        event_id,
        update_id: update_id.to_string(),
        event_type,
        event_type_original,
        contract_id,
        template_id,
        package_name,
        migration_id,
        child_event_ids,
        payload,
        raw_event: raw_event.to_string(),
    }
}

/// Normalizes one raw active-contract-set row into the canonical
/// [`AcsContract`]. Unlike [`normalize_update`], this takes the whole raw
/// JSON node rather than a pre-parsed wire struct -- ACS rows carry no
/// event forest to unwrap, so there is no separate "preserve the
/// remainder" step; `raw` is the complete, untouched node, matching the
/// full-fidelity style [`normalize_event`] uses for `raw_event`.
pub fn normalize_acs_contract(
    raw: &Value,
    migration_id: i64,
    snapshot_time: DateTime<Utc>,
    mode: NormalizeMode,
) -> Result<AcsContract, IngestError> {
    let contract_id = raw
        .get("contract_id")
        .and_then(Value::as_str)
        .ok_or_else(|| IngestError::SchemaValidation("acs contract missing contract_id".to_string()))?
        .to_string();

    let record_time_str = raw
        .get("record_time")
        .and_then(Value::as_str)
        .ok_or_else(|| IngestError::SchemaValidation(format!("contract {contract_id} missing record_time")))?;
    let record_time = parse_lenient_utc(record_time_str)
        .map_err(|e| IngestError::SchemaValidation(format!("contract {contract_id} record_time: {e}")))?;

    let event_id = raw.get("event_id").and_then(Value::as_str).map(str::to_string);

    let template_id = match raw.get("template_id").and_then(Value::as_str) {
        Some(s) => match TemplateIdParts::parse(s) {
            Some(parts) => Some(parts),
            None => {
                let msg = format!("contract {contract_id} has malformed template_id `{s}`");
                match mode {
                    NormalizeMode::Strict => return Err(IngestError::SchemaValidation(msg)),
                    NormalizeMode::Lenient => {
                        warn!("{msg}, keeping contract without parsed template_id");
                        None
                    }
                }
            }
        },
        None => None,
    };

    let payload = raw.get("payload").map(|v| v.to_string());

    Ok(AcsContract {
        contract_id,
        event_id,
        template_id,
        migration_id,
        record_time,
        snapshot_time,
        payload,
        raw: raw.to_string(),
    })
}

/// Returns (original nested type name, flattened short type, the nested body).
fn unwrap_event_nesting(raw_event: &Value) -> (String, EventType, &Value) {
    const WRAPPERS: &[(&str, EventType)] = &[
        ("created_event", EventType::Created),
        ("archived_event", EventType::Archived),
        ("exercised_event", EventType::Exercised),
        ("reassign_create", EventType::ReassignCreate),
        ("reassign_archive", EventType::ReassignArchive),
    ];
    for (wrapper_name, event_type) in WRAPPERS {
        if let Some(body) = raw_event.get(wrapper_name) {
            return (wrapper_name.to_string(), *event_type, body);
        }
    }
    ("unknown".to_string(), EventType::Created, raw_event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(kind_field: &str) -> RawUpdate {
        let mut data = json!({
            "update_id": "u1",
            "migration_id": 1,
            "synchronizer_id": "sync-a",
            "record_time": "2025-01-01T00:00:00Z",
            "offset": 42,
            "root_event_ids": ["u1:0", "u1:1"],
        });
        if !kind_field.is_empty() {
            data[kind_field] = json!({});
        }
        RawUpdate::from_value(data).unwrap()
    }

    #[test]
    fn resolves_transaction_kind() {
        let u = normalize_update(&raw("transaction"), NormalizeMode::Strict).unwrap();
        assert_eq!(u.kind, UpdateKind::Transaction);
        assert_eq!(u.root_event_ids, vec!["u1:0", "u1:1"]);
        assert_eq!(u.event_count, 2);
    }

    #[test]
    fn resolves_reassignment_kind() {
        let u = normalize_update(&raw("reassignment"), NormalizeMode::Strict).unwrap();
        assert_eq!(u.kind, UpdateKind::Reassignment);
    }

    #[test]
    fn unknown_kind_fails_strict() {
        let err = normalize_update(&raw(""), NormalizeMode::Strict).unwrap_err();
        assert!(matches!(err, IngestError::SchemaValidation(_)));
    }

    #[test]
    fn unknown_kind_warns_lenient() {
        let u = normalize_update(&raw(""), NormalizeMode::Lenient).unwrap();
        assert_eq!(u.kind, UpdateKind::Unknown);
    }

    #[test]
    fn timestamp_without_timezone_is_utc() {
        let ts = parse_lenient_utc("2025-01-01T12:00:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-01-01T12:00:00+00:00");
    }

    #[test]
    fn raw_blob_round_trips() {
        let r = raw("transaction");
        let original = r.data.clone();
        let u = normalize_update(&r, NormalizeMode::Strict).unwrap();
        let parsed_back: Value = serde_json::from_str(&u.update_data).unwrap();
        assert_eq!(parsed_back, original);
    }

    #[test]
    fn wire_update_round_trips_through_deserialization() {
        let wire = json!({
            "update_id": "u2",
            "migration_id": 7,
            "synchronizer_id": "sync-b",
            "record_time": "2025-02-01T00:00:00Z",
            "effective_at": "2025-02-01T00:00:01Z",
            "offset": 99,
            "transaction": {
                "workflow_id": "wf-1",
                "events": [
                    {"created_event": {"event_id": "u2:0", "contract_id": "c1", "template_id": "pkg:Mod:Entity"}},
                ],
            },
            "root_event_ids": ["u2:0"],
        });
        let raw = RawUpdate::from_value(wire.clone()).unwrap();
        let u = normalize_update(&raw, NormalizeMode::Strict).unwrap();
        assert_eq!(u.kind, UpdateKind::Transaction);

        let parsed_back: Value = serde_json::from_str(&u.update_data).unwrap();
        assert_eq!(parsed_back, wire);
        assert_eq!(parsed_back["transaction"]["workflow_id"], "wf-1");
    }

    #[test]
    fn unwraps_created_event() {
        let raw_event = json!({"created_event": {"event_id": "u1:0", "contract_id": "c1"}});
        let e = normalize_event(&raw_event, "u1", 1, 0, NormalizeMode::Strict);
        assert_eq!(e.event_type, EventType::Created);
        assert_eq!(e.event_type_original, "created_event");
        assert_eq!(e.event_id.as_deref(), Some("u1:0"));
        assert_eq!(e.contract_id.as_deref(), Some("c1"));
    }

    #[test]
    fn missing_event_id_is_not_synthesized() {
        let raw_event = json!({"archived_event": {"contract_id": "c2"}});
        let e = normalize_event(&raw_event, "u1", 1, 3, NormalizeMode::Lenient);
        assert_eq!(e.event_id, None);
    }

    #[test]
    fn normalizes_acs_contract_with_template_id() {
        let raw = json!({
            "contract_id": "c1",
            "event_id": "u1:0",
            "template_id": "pkg:Mod:Entity",
            "record_time": "2025-01-01T00:00:00Z",
            "payload": {"amount": 10},
        });
        let snapshot_time = Utc::now();
        let c = normalize_acs_contract(&raw, 1, snapshot_time, NormalizeMode::Strict).unwrap();
        assert_eq!(c.contract_id, "c1");
        assert_eq!(c.event_id.as_deref(), Some("u1:0"));
        let parts = c.template_id.unwrap();
        assert_eq!(parts.package_name, "pkg");
        assert_eq!(parts.module_name, "Mod");
        assert_eq!(parts.entity_name, "Entity");
        assert_eq!(c.snapshot_time, snapshot_time);
        let parsed_back: Value = serde_json::from_str(&c.raw).unwrap();
        assert_eq!(parsed_back, raw);
    }

    #[test]
    fn malformed_template_id_fails_strict_warns_lenient() {
        let raw = json!({
            "contract_id": "c2",
            "record_time": "2025-01-01T00:00:00Z",
            "template_id": "not-a-valid-id",
        });
        let snapshot_time = Utc::now();
        assert!(normalize_acs_contract(&raw, 1, snapshot_time, NormalizeMode::Strict).is_err());
        let c = normalize_acs_contract(&raw, 1, snapshot_time, NormalizeMode::Lenient).unwrap();
        assert_eq!(c.template_id, None);
    }

    #[test]
    fn missing_contract_id_is_always_an_error() {
        let raw = json!({"record_time": "2025-01-01T00:00:00Z"});
        assert!(normalize_acs_contract(&raw, 1, Utc::now(), NormalizeMode::Lenient).is_err());
    }
}
