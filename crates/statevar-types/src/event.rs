//! The state variable event model.
//!
//! A [`StateVariableEvent`] is the atomic unit of mutation intent: a small,
//! self-describing record of one desired change to one logical entity.
//! Events are immutable once created and carry a deterministic
//! [idempotency key](StateVariableEvent::idempotency_key) so duplicate
//! submissions can be suppressed downstream.
//!
//! Construction goes through [`StateVariableEvent::create`] (fills in
//! generated fields) or [`StateVariableEvent::normalize`] (accepts a raw,
//! possibly hostile JSON object). Validation never panics: it returns a
//! structured report via the [`validator`] derive, the same way the
//! original service schema did.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::canon::stable_stringify;
use crate::TableRow;

/// Fallback turn identifier for events created without one.
const DEFAULT_TURN_ID: &str = "turn-unknown";
/// Fallback source label.
const DEFAULT_SOURCE: &str = "runtime";
/// Fallback domain.
const DEFAULT_DOMAIN: &str = "unknown";
/// Fallback entity identifier.
const DEFAULT_ENTITY_ID: &str = "entity";
/// Fallback path locator.
const DEFAULT_PATH: &str = "path";

// ---------------------------------------------------------------------------
// Event op
// ---------------------------------------------------------------------------

/// The closed set of mutation operations an event may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    /// Overwrite a single field with the payload value.
    Set,
    /// Apply a numeric delta to the current value of a field.
    Add,
    /// Append one or more rows (inventory-style lists).
    Push,
    /// Remove a field or a row.
    Delete,
    /// Merge an object payload into the target row.
    Upsert,
}

impl EventOp {
    /// The wire spelling of this op.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Push => "push",
            Self::Delete => "delete",
            Self::Upsert => "upsert",
        }
    }

    /// Parse a wire spelling back into an op. Case-insensitive, trimmed.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "set" => Some(Self::Set),
            "add" => Some(Self::Add),
            "push" => Some(Self::Push),
            "delete" => Some(Self::Delete),
            "upsert" => Some(Self::Upsert),
            _ => None,
        }
    }
}

impl core::fmt::Display for EventOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while normalizing raw event input.
///
/// [`EventError::NotAnObject`] is the single fail-fast path; every other
/// problem degrades to a validation failure the caller can report and
/// count as an `invalid_event` skip.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The raw input was not a JSON object at all.
    #[error("state variable event must be an object")]
    NotAnObject,

    /// The `op` field did not name a member of the closed op set.
    #[error("unknown event op: {op}")]
    UnknownOp {
        /// The rejected op spelling.
        op: String,
    },

    /// The normalized event failed schema validation.
    #[error("event failed schema validation: {report}")]
    Invalid {
        /// Field-level validation failures.
        report: validator::ValidationErrors,
    },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single validated state mutation event.
///
/// All string fields are non-empty after trimming; `created_at` is a
/// non-negative epoch-millisecond timestamp. Two events with the same
/// `idempotency_key` must never both apply -- the writer, not the queue,
/// enforces that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StateVariableEvent {
    /// Unique event identifier (generated when absent).
    #[validate(length(min = 1))]
    pub event_id: String,

    /// The turn this event belongs to.
    #[validate(length(min = 1))]
    pub turn_id: String,

    /// Origin label (e.g. `ms:state`, `runtime`).
    #[validate(length(min = 1))]
    pub source: String,

    /// Logical subsystem the event targets (e.g. `global_state`,
    /// `character_resources`, `inventory`, `quest`, ...).
    #[validate(length(min = 1))]
    pub domain: String,

    /// The logical entity within the domain.
    #[validate(length(min = 1))]
    pub entity_id: String,

    /// Normalized locator: a legacy dotted path or a
    /// `sheet.<sheetId>.<entityId>` locator.
    #[validate(length(min = 1))]
    pub path: String,

    /// The requested mutation operation.
    pub op: EventOp,

    /// Opaque payload. Absent and explicit-null are treated alike by the
    /// idempotency signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Optional optimistic-concurrency expectation: the row version the
    /// sender last observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,

    /// Deterministic signature of the event's semantic content.
    #[validate(length(min = 1))]
    pub idempotency_key: String,

    /// Creation timestamp, epoch milliseconds.
    #[validate(range(min = 0))]
    pub created_at: i64,
}

/// Build the deterministic idempotency signature for an event's semantic
/// content.
///
/// The signature covers `(turn, source, domain, entity, path, op, value)`
/// with the value rendered through [`stable_stringify`], so field-order
/// differences in object payloads never change the key.
pub fn build_idempotency_key(
    turn_id: &str,
    source: &str,
    domain: &str,
    entity_id: &str,
    path: &str,
    op: EventOp,
    value: Option<&Value>,
) -> String {
    let value_signature = value.map_or_else(|| String::from("null"), stable_stringify);
    [
        normalize_or(turn_id, DEFAULT_TURN_ID),
        normalize_or(source, DEFAULT_SOURCE),
        normalize_or(domain, DEFAULT_DOMAIN),
        normalize_or(entity_id, DEFAULT_ENTITY_ID),
        normalize_or(path, DEFAULT_PATH),
        String::from(op.as_str()),
        value_signature,
    ]
    .join("::")
}

// ---------------------------------------------------------------------------
// Draft
// ---------------------------------------------------------------------------

/// A partially specified event, as accepted by [`StateVariableEvent::create`].
///
/// Every field is optional; `create` fills the gaps with deterministic
/// fallbacks and generated identifiers.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    /// Explicit event id, if the caller has one.
    pub event_id: Option<String>,
    /// The turn this event belongs to.
    pub turn_id: Option<String>,
    /// Origin label.
    pub source: Option<String>,
    /// Target domain.
    pub domain: Option<String>,
    /// Target entity.
    pub entity_id: Option<String>,
    /// Target path locator.
    pub path: Option<String>,
    /// Requested operation (defaults to [`EventOp::Upsert`]).
    pub op: Option<EventOp>,
    /// Opaque payload.
    pub value: Option<Value>,
    /// Optimistic-concurrency expectation.
    pub expected_version: Option<u64>,
    /// Explicit idempotency key (derived from content when absent).
    pub idempotency_key: Option<String>,
    /// Creation timestamp override, epoch milliseconds.
    pub created_at: Option<i64>,
}

impl StateVariableEvent {
    /// Create an event from a draft, filling in `event_id`, `created_at`,
    /// and `idempotency_key` when absent.
    ///
    /// String fields are trimmed; empty fields fall back to the fixed
    /// sentinels (`turn-unknown`, `runtime`, `unknown`, `entity`, `path`).
    pub fn create(draft: EventDraft) -> Self {
        let created_at = draft.created_at.map_or_else(now_millis, |stamp| stamp.max(0));
        let turn_id = normalize_opt(draft.turn_id.as_deref(), DEFAULT_TURN_ID);
        let source = normalize_opt(draft.source.as_deref(), DEFAULT_SOURCE);
        let domain = normalize_opt(draft.domain.as_deref(), DEFAULT_DOMAIN);
        let entity_id = normalize_opt(draft.entity_id.as_deref(), DEFAULT_ENTITY_ID);
        let path = normalize_opt(draft.path.as_deref(), DEFAULT_PATH);
        let op = draft.op.unwrap_or(EventOp::Upsert);

        let idempotency_key = draft
            .idempotency_key
            .as_deref()
            .and_then(trimmed)
            .unwrap_or_else(|| {
                build_idempotency_key(
                    &turn_id,
                    &source,
                    &domain,
                    &entity_id,
                    &path,
                    op,
                    draft.value.as_ref(),
                )
            });

        let event_id = draft.event_id.as_deref().and_then(trimmed).unwrap_or_else(|| {
            format!("sve_{turn_id}_{created_at}_{}", short_suffix())
        });

        Self {
            event_id,
            turn_id,
            source,
            domain,
            entity_id,
            path,
            op,
            value: draft.value,
            expected_version: draft.expected_version,
            idempotency_key,
            created_at,
        }
    }

    /// Normalize a raw JSON value into a validated event.
    ///
    /// The only fail-fast condition is a non-object input
    /// ([`EventError::NotAnObject`]); an unknown `op` or a field that fails
    /// schema validation degrades to a typed error the caller can count
    /// and report.
    pub fn normalize(raw: &Value) -> Result<Self, EventError> {
        let map = raw.as_object().ok_or(EventError::NotAnObject)?;

        let op = match map.get("op") {
            None | Some(Value::Null) => EventOp::Upsert,
            Some(Value::String(text)) if text.trim().is_empty() => EventOp::Upsert,
            Some(Value::String(text)) => EventOp::parse(text).ok_or_else(|| EventError::UnknownOp {
                op: text.trim().to_owned(),
            })?,
            Some(other) => {
                return Err(EventError::UnknownOp {
                    op: other.to_string(),
                })
            }
        };

        let draft = EventDraft {
            event_id: read_string(map, "event_id"),
            turn_id: read_string(map, "turn_id"),
            source: read_string(map, "source"),
            domain: read_string(map, "domain"),
            entity_id: read_string(map, "entity_id"),
            path: read_string(map, "path"),
            op: Some(op),
            value: map.get("value").cloned(),
            expected_version: map.get("expected_version").and_then(value_to_index),
            idempotency_key: read_string(map, "idempotency_key"),
            created_at: map.get("created_at").and_then(value_to_epoch_millis),
        };

        let event = Self::create(draft);
        event
            .validate()
            .map_err(|report| EventError::Invalid { report })?;
        Ok(event)
    }

    /// The partition key used to serialize consumption of this event.
    pub fn partition_key(&self) -> String {
        format!("{}::{}", self.domain, self.entity_id)
    }
}

// ---------------------------------------------------------------------------
// Batch envelope
// ---------------------------------------------------------------------------

/// Metadata for wrapping a batch of events into an envelope.
#[derive(Debug, Clone)]
pub struct BatchMeta {
    /// The turn the batch belongs to; also the per-event fallback.
    pub turn_id: String,
    /// The batch source label; also the per-event fallback.
    pub source: String,
    /// Explicit batch id (generated when absent).
    pub batch_id: Option<String>,
    /// Creation timestamp override, epoch milliseconds.
    pub created_at: Option<i64>,
}

/// A validated batch of events sharing a turn and source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct EventBatchEnvelope {
    /// Unique batch identifier.
    #[validate(length(min = 1))]
    pub batch_id: String,
    /// The turn the batch belongs to.
    #[validate(length(min = 1))]
    pub turn_id: String,
    /// The batch source label.
    #[validate(length(min = 1))]
    pub source: String,
    /// Creation timestamp, epoch milliseconds.
    #[validate(range(min = 0))]
    pub created_at: i64,
    /// The normalized member events.
    pub events: Vec<StateVariableEvent>,
}

impl EventBatchEnvelope {
    /// Normalize raw events into a batch envelope.
    ///
    /// Each member inherits the envelope's `turn_id` and `source` when it
    /// does not carry its own. Fails on the first member that cannot be
    /// normalized.
    pub fn create(raw_events: &[Value], meta: &BatchMeta) -> Result<Self, EventError> {
        let created_at = meta.created_at.map_or_else(now_millis, |stamp| stamp.max(0));
        let mut events = Vec::with_capacity(raw_events.len());

        for raw in raw_events {
            let map = raw.as_object().ok_or(EventError::NotAnObject)?;
            let mut patched: TableRow = map.clone();
            if read_string(&patched, "turn_id").is_none() {
                patched.insert("turn_id".to_owned(), Value::String(meta.turn_id.clone()));
            }
            if read_string(&patched, "source").is_none() {
                patched.insert("source".to_owned(), Value::String(meta.source.clone()));
            }
            events.push(StateVariableEvent::normalize(&Value::Object(patched))?);
        }

        let batch_id = meta
            .batch_id
            .as_deref()
            .and_then(trimmed)
            .unwrap_or_else(|| format!("svb_{}_{created_at}", meta.turn_id));

        let envelope = Self {
            batch_id,
            turn_id: normalize_or(&meta.turn_id, DEFAULT_TURN_ID),
            source: normalize_or(&meta.source, DEFAULT_SOURCE),
            created_at,
            events,
        };
        envelope
            .validate()
            .map_err(|report| EventError::Invalid { report })?;
        Ok(envelope)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current wall-clock time in epoch milliseconds.
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Trim a string, returning `None` when nothing remains.
fn trimmed(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    }
}

/// Trim a string, falling back to a sentinel when nothing remains.
fn normalize_or(raw: &str, fallback: &str) -> String {
    trimmed(raw).unwrap_or_else(|| fallback.to_owned())
}

/// Trim an optional string, falling back to a sentinel.
fn normalize_opt(raw: Option<&str>, fallback: &str) -> String {
    raw.and_then(trimmed).unwrap_or_else(|| fallback.to_owned())
}

/// Read a trimmed string field from a JSON object, coercing numbers.
fn read_string(map: &TableRow, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(text) => trimmed(text),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

/// Coerce a JSON value into a non-negative index (floors negatives to 0).
fn value_to_index(value: &Value) -> Option<u64> {
    value.as_i64().map(|num| u64::try_from(num.max(0)).unwrap_or(0))
}

/// Coerce a JSON value into a non-negative epoch-millisecond stamp.
fn value_to_epoch_millis(value: &Value) -> Option<i64> {
    value.as_i64().map(|num| num.max(0))
}

/// A short random suffix for generated event ids.
fn short_suffix() -> String {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(6);
    hex
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn draft(op: EventOp, value: Option<Value>) -> EventDraft {
        EventDraft {
            turn_id: Some(String::from("7")),
            source: Some(String::from("ms:state")),
            domain: Some(String::from("global_state")),
            entity_id: Some(String::from("GLOBAL")),
            path: Some(String::from("gameState.当前场景")),
            op: Some(op),
            value,
            ..EventDraft::default()
        }
    }

    #[test]
    fn create_fills_generated_fields() {
        let event = StateVariableEvent::create(draft(EventOp::Set, Some(json!("公会本部"))));
        assert!(event.event_id.starts_with("sve_7_"));
        assert!(event.created_at >= 0);
        assert!(!event.idempotency_key.is_empty());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn idempotency_key_ignores_object_key_order() {
        let left = StateVariableEvent::create(draft(
            EventOp::Upsert,
            Some(json!({ "b": 1, "a": 2 })),
        ));
        let right = StateVariableEvent::create(draft(
            EventOp::Upsert,
            Some(json!({ "a": 2, "b": 1 })),
        ));
        assert_eq!(left.idempotency_key, right.idempotency_key);
    }

    #[test]
    fn idempotency_key_distinguishes_ops() {
        let set = StateVariableEvent::create(draft(EventOp::Set, Some(json!(1))));
        let add = StateVariableEvent::create(draft(EventOp::Add, Some(json!(1))));
        assert_ne!(set.idempotency_key, add.idempotency_key);
    }

    #[test]
    fn normalize_rejects_non_objects() {
        assert!(matches!(
            StateVariableEvent::normalize(&json!("not an event")),
            Err(EventError::NotAnObject)
        ));
        assert!(matches!(
            StateVariableEvent::normalize(&json!([1, 2])),
            Err(EventError::NotAnObject)
        ));
    }

    #[test]
    fn normalize_rejects_unknown_op() {
        let raw = json!({
            "turn_id": "1",
            "source": "s",
            "domain": "global_state",
            "entity_id": "GLOBAL",
            "path": "gameState.当前场景",
            "op": "merge"
        });
        assert!(matches!(
            StateVariableEvent::normalize(&raw),
            Err(EventError::UnknownOp { .. })
        ));
    }

    #[test]
    fn normalize_trims_and_defaults() {
        let raw = json!({
            "turn_id": "  3  ",
            "source": "",
            "domain": "inventory",
            "entity_id": "INVENTORY",
            "path": "gameState.背包",
            "op": "push",
            "value": { "物品ID": "itm_001" }
        });
        let event = StateVariableEvent::normalize(&raw).unwrap();
        assert_eq!(event.turn_id, "3");
        assert_eq!(event.source, "runtime");
        assert_eq!(event.op, EventOp::Push);
    }

    #[test]
    fn normalize_coerces_numeric_turn_ids() {
        let raw = json!({
            "turn_id": 12,
            "source": "replay",
            "domain": "quest",
            "entity_id": "QUEST",
            "path": "sheet.QUEST_Active.Q1",
            "op": "upsert",
            "value": { "任务ID": "Q1" }
        });
        let event = StateVariableEvent::normalize(&raw).unwrap();
        assert_eq!(event.turn_id, "12");
    }

    #[test]
    fn negative_expected_version_clamps_to_zero() {
        let raw = json!({
            "turn_id": "1",
            "source": "s",
            "domain": "global_state",
            "entity_id": "GLOBAL",
            "path": "gameState.当前回合",
            "op": "set",
            "value": 2,
            "expected_version": -4
        });
        let event = StateVariableEvent::normalize(&raw).unwrap();
        assert_eq!(event.expected_version, Some(0));
    }

    #[test]
    fn batch_envelope_applies_fallbacks() {
        let raws = vec![
            json!({
                "domain": "global_state",
                "entity_id": "GLOBAL",
                "path": "gameState.当前场景",
                "op": "set",
                "value": "市场"
            }),
            json!({
                "turn_id": "9",
                "source": "override",
                "domain": "inventory",
                "entity_id": "INVENTORY",
                "path": "gameState.背包",
                "op": "push",
                "value": { "物品ID": "itm_002" }
            }),
        ];
        let meta = BatchMeta {
            turn_id: String::from("5"),
            source: String::from("ms:batch"),
            batch_id: None,
            created_at: Some(1_000),
        };
        let envelope = EventBatchEnvelope::create(&raws, &meta).unwrap();
        assert_eq!(envelope.batch_id, "svb_5_1000");
        assert_eq!(envelope.events.len(), 2);
        let first = envelope.events.first().unwrap();
        assert_eq!(first.turn_id, "5");
        assert_eq!(first.source, "ms:batch");
        let second = envelope.events.get(1).unwrap();
        assert_eq!(second.turn_id, "9");
        assert_eq!(second.source, "override");
    }

    #[test]
    fn op_round_trips_through_wire_spelling() {
        for op in [EventOp::Set, EventOp::Add, EventOp::Push, EventOp::Delete, EventOp::Upsert] {
            assert_eq!(EventOp::parse(op.as_str()), Some(op));
        }
        assert_eq!(EventOp::parse("MERGE"), None);
    }
}
