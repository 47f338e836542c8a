//! Replay reconstruction: from an event sequence (or a persisted event
//! log) back to a pilot-sheet snapshot.
//!
//! Replay feeds events through the writer in shadow mode against a cloned
//! baseline, then folds the resulting commands onto a working copy of the
//! pilot-sheet snapshot (upsert = field merge by key, delete = row
//! removal by id). The replayed snapshot is what the diff compares
//! against the live one.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use statevar_types::sheets::{default_key_field, is_pilot_sheet, sheet_ids, PILOT_SHEETS};
use statevar_types::{
    SheetCommand, StateSnapshot, StateVariableEvent, TableRow, WriterCommand,
};
use statevar_writer::writer::event_log_row;
use statevar_writer::{ConsumeBatch, StateVariableWriter, WriterMode};

use crate::diff::{DiffSheetSnapshot, DiffSnapshot};

// ---------------------------------------------------------------------------
// Snapshot collection
// ---------------------------------------------------------------------------

/// Collect the pilot-sheet rows of a state into a diffable snapshot.
pub fn collect_diff_snapshot(state: &StateSnapshot) -> DiffSnapshot {
    let mut snapshot = DiffSnapshot::new();
    for sheet_id in PILOT_SHEETS {
        snapshot.insert(
            (*sheet_id).to_owned(),
            DiffSheetSnapshot {
                key_field: default_key_field(sheet_id).to_owned(),
                rows: state.sheet_rows(sheet_id).to_vec(),
            },
        );
    }
    snapshot
}

// ---------------------------------------------------------------------------
// Command folding
// ---------------------------------------------------------------------------

/// Read a row identity with a positional fallback, the way snapshot
/// stores index identity-less rows.
fn row_id_or_position(row: &TableRow, key_field: &str, index: usize) -> String {
    statevar_types::sheets::read_row_id(row, key_field)
        .unwrap_or_else(|| format!("__row_{}", index.saturating_add(1)))
}

/// Fold writer commands onto a pilot-sheet snapshot: upsert merges by
/// key, delete removes by id. Non-pilot sheets are ignored.
pub fn apply_commands_to_snapshot(
    base: &DiffSnapshot,
    commands: &[WriterCommand],
) -> DiffSnapshot {
    // Index each sheet's rows by identity, preserving insertion order.
    let mut store: BTreeMap<String, (String, Vec<(String, TableRow)>)> = BTreeMap::new();
    for sheet_id in PILOT_SHEETS {
        let key_field = base
            .get(*sheet_id)
            .map(|sheet| sheet.key_field.trim())
            .filter(|field| !field.is_empty())
            .unwrap_or_else(|| default_key_field(sheet_id))
            .to_owned();
        let rows = base.get(*sheet_id).map_or_else(Vec::new, |sheet| {
            sheet
                .rows
                .iter()
                .enumerate()
                .map(|(index, row)| (row_id_or_position(row, &key_field, index), row.clone()))
                .collect()
        });
        store.insert((*sheet_id).to_owned(), (key_field, rows));
    }

    for command in commands {
        match &command.command {
            SheetCommand::UpsertSheetRows(payload) => {
                if !is_pilot_sheet(&payload.sheet_id) {
                    continue;
                }
                let Some((sheet_key_field, rows)) = store.get_mut(&payload.sheet_id) else {
                    continue;
                };
                let key_field = if payload.key_field.trim().is_empty() {
                    sheet_key_field.clone()
                } else {
                    payload.key_field.clone()
                };
                for (row_index, incoming) in payload.rows.iter().enumerate() {
                    let row_id = row_id_or_position(incoming, &key_field, row_index);
                    match rows.iter_mut().find(|(held_id, _)| *held_id == row_id) {
                        Some((_, held)) => {
                            for (key, value) in incoming {
                                held.insert(key.clone(), value.clone());
                            }
                        }
                        None => rows.push((row_id, incoming.clone())),
                    }
                }
            }
            SheetCommand::DeleteSheetRows(payload) => {
                if !is_pilot_sheet(&payload.sheet_id) {
                    continue;
                }
                if let Some((_, rows)) = store.get_mut(&payload.sheet_id) {
                    rows.retain(|(held_id, _)| !payload.row_ids.contains(held_id));
                }
            }
        }
    }

    let mut snapshot = DiffSnapshot::new();
    for (sheet_id, (key_field, rows)) in store {
        snapshot.insert(
            sheet_id,
            DiffSheetSnapshot {
                key_field,
                rows: rows.into_iter().map(|(_, row)| row).collect(),
            },
        );
    }
    snapshot
}

// ---------------------------------------------------------------------------
// Event-log parsing
// ---------------------------------------------------------------------------

/// The outcome of parsing persisted event-log rows.
#[derive(Debug, Clone, Default)]
pub struct ParsedEventLog {
    /// The valid events, sorted by `(created_at, event_id)`.
    pub events: Vec<StateVariableEvent>,
    /// How many rows were excluded as invalid.
    pub invalid_rows: u64,
    /// Excluded rows per reason (`missing_required`, `invalid_created_at`,
    /// `invalid_event_payload`).
    pub invalid_rows_by_reason: BTreeMap<String, u64>,
}

/// Required string columns of a persisted event-log row.
const REQUIRED_LOG_COLUMNS: &[&str] = &[
    "event_id",
    "turn_id",
    "source",
    "domain",
    "entity_id",
    "path",
    "op",
    "idempotency_key",
];

/// Read a log column as a trimmed string, coercing numbers.
fn log_column(row: &TableRow, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

/// Parse the persisted payload column back into a value.
///
/// Absent, null, or blank payloads mean "no value". A non-empty string
/// must be valid JSON; anything unparsable invalidates the row.
fn parse_payload(raw: Option<&Value>) -> Result<Option<Value>, ()> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Null) => Ok(None),
                Ok(value) => Ok(Some(value)),
                Err(_) => Err(()),
            }
        }
        Some(other) => Ok(Some(other.clone())),
    }
}

/// Parse persisted event-log rows back into events.
///
/// A row missing a required column, with a non-numeric `created_at`, or
/// with unparsable payload JSON is excluded and counted under a typed
/// reason. Valid events come back sorted by `(created_at, event_id)`.
pub fn parse_event_log_rows(rows: &[TableRow]) -> ParsedEventLog {
    let mut parsed = ParsedEventLog::default();
    let mut bump = |by_reason: &mut BTreeMap<String, u64>, total: &mut u64, reason: &str| {
        *total = total.saturating_add(1);
        let counter = by_reason.entry(reason.to_owned()).or_insert(0);
        *counter = counter.saturating_add(1);
    };

    for row in rows {
        let missing_required = REQUIRED_LOG_COLUMNS
            .iter()
            .any(|column| log_column(row, column).is_none());
        let created_at = row.get("created_at").and_then(Value::as_i64);
        if missing_required || created_at.is_none() {
            let reason = if missing_required {
                "missing_required"
            } else {
                "invalid_created_at"
            };
            bump(&mut parsed.invalid_rows_by_reason, &mut parsed.invalid_rows, reason);
            continue;
        }

        let Ok(payload) = parse_payload(row.get("payload")) else {
            bump(
                &mut parsed.invalid_rows_by_reason,
                &mut parsed.invalid_rows,
                "invalid_event_payload",
            );
            continue;
        };

        let mut raw_event = TableRow::new();
        for column in REQUIRED_LOG_COLUMNS {
            if let Some(text) = log_column(row, column) {
                raw_event.insert((*column).to_owned(), Value::String(text));
            }
        }
        if let Some(value) = payload {
            raw_event.insert("value".to_owned(), value);
        }
        if let Some(expected) = row.get("expected_version") {
            if !expected.is_null() {
                raw_event.insert("expected_version".to_owned(), expected.clone());
            }
        }
        if let Some(stamp) = created_at {
            raw_event.insert("created_at".to_owned(), Value::from(stamp));
        }

        match StateVariableEvent::normalize(&Value::Object(raw_event)) {
            Ok(event) => parsed.events.push(event),
            Err(error) => {
                debug!(%error, "event log row failed normalization");
                bump(
                    &mut parsed.invalid_rows_by_reason,
                    &mut parsed.invalid_rows,
                    "invalid_event_payload",
                );
            }
        }
    }

    parsed
        .events
        .sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.event_id.cmp(&right.event_id))
        });
    parsed
}

/// Render events into the persisted event-log row shape.
pub fn create_event_log_rows(events: &[StateVariableEvent]) -> Vec<TableRow> {
    events.iter().map(event_log_row).collect()
}

/// Read the persisted event-log rows carried on a state.
pub fn read_event_log_rows(state: &StateSnapshot) -> Vec<TableRow> {
    state.sheet_rows(sheet_ids::SYS_STATE_VAR_EVENT_LOG).to_vec()
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// The outcome of replaying an event sequence onto a baseline.
#[derive(Debug, Clone)]
pub struct ReplayResult {
    /// The replayed pilot-sheet snapshot.
    pub snapshot: DiffSnapshot,
    /// Events the writer accepted.
    pub accepted_events: u64,
    /// Events the writer skipped.
    pub skipped_events: u64,
    /// The commands the writer synthesized.
    pub commands: Vec<WriterCommand>,
    /// The audit commands the writer synthesized.
    pub audit_commands: Vec<WriterCommand>,
}

/// The outcome of replaying a persisted event log.
#[derive(Debug, Clone)]
pub struct LogReplayResult {
    /// The replay outcome.
    pub replay: ReplayResult,
    /// Event-log rows excluded as invalid.
    pub invalid_event_log_rows: u64,
    /// Excluded rows per reason.
    pub invalid_event_log_rows_by_reason: BTreeMap<String, u64>,
}

/// Replay a sequence of raw events onto a cloned baseline via the writer
/// in shadow mode, folding the resulting commands onto the pilot-sheet
/// snapshot.
pub fn replay_events_to_snapshot(baseline: &StateSnapshot, events: &[Value]) -> ReplayResult {
    let mut writer = StateVariableWriter::new();
    let report = writer.consume_events(&ConsumeBatch {
        snapshot: baseline,
        events,
        mode: WriterMode::Shadow,
        executor: None,
    });
    let base_snapshot = collect_diff_snapshot(baseline);
    let snapshot = apply_commands_to_snapshot(&base_snapshot, &report.commands);
    ReplayResult {
        snapshot,
        accepted_events: report.metrics.accepted_count,
        skipped_events: report.metrics.skipped_count,
        commands: report.commands,
        audit_commands: report.audit_commands,
    }
}

/// Replay the event log persisted on one state against a baseline state.
pub fn replay_event_log_from_state(
    baseline: &StateSnapshot,
    event_log_state: &StateSnapshot,
) -> LogReplayResult {
    let rows = read_event_log_rows(event_log_state);
    let parsed = parse_event_log_rows(&rows);
    let raw_events: Vec<Value> = parsed
        .events
        .iter()
        .map(|event| serde_json::to_value(event).unwrap_or(Value::Null))
        .collect();
    let replay = replay_events_to_snapshot(baseline, &raw_events);
    LogReplayResult {
        replay,
        invalid_event_log_rows: parsed.invalid_rows,
        invalid_event_log_rows_by_reason: parsed.invalid_rows_by_reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use statevar_writer::bridge::{
        build_events_from_commands, BridgeCommand, BridgeOptions, SheetRowsPayload,
    };

    use crate::diff::diff_snapshots;

    use super::*;

    fn row(pairs: &[(&str, serde_json::Value)]) -> TableRow {
        let mut map = TableRow::new();
        for (key, value) in pairs {
            map.insert((*key).to_owned(), value.clone());
        }
        map
    }

    fn baseline() -> StateSnapshot {
        let mut state = StateSnapshot::default();
        state.globals.insert("当前场景".to_owned(), json!("旧城区"));
        state.globals.insert("当前回合".to_owned(), json!(3));
        let mut player = TableRow::new();
        player.insert("法利".to_owned(), json!(100));
        state.characters.insert(String::from("PLAYER"), player);
        state.bag.push(row(&[
            ("物品ID", json!("itm_001")),
            ("物品名称", json!("苹果")),
            ("数量", json!(2)),
        ]));
        state.table_rows.insert(
            String::from("SYS_GlobalState"),
            vec![row(&[
                ("_global_id", json!("GLOBAL_STATE")),
                ("当前场景", json!("旧城区")),
                ("当前回合", json!(3)),
            ])],
        );
        state.table_rows.insert(
            String::from("CHARACTER_Resources"),
            vec![row(&[("CHAR_ID", json!("PLAYER")), ("法利", json!(100))])],
        );
        state.table_rows.insert(
            String::from("ITEM_Inventory"),
            vec![row(&[
                ("物品ID", json!("itm_001")),
                ("物品名称", json!("苹果")),
                ("数量", json!(2)),
            ])],
        );
        state
    }

    fn bridge_events() -> Vec<StateVariableEvent> {
        let commands = vec![
            BridgeCommand::Set {
                key: String::from("gameState.当前场景"),
                value: Some(json!("公会本部")),
                expected_row_version: None,
            },
            BridgeCommand::Add {
                key: String::from("gameState.角色.法利"),
                value: Some(json!(30)),
                expected_row_version: None,
            },
            BridgeCommand::Push {
                key: String::from("gameState.背包"),
                // Object payload with deliberately unsorted keys.
                value: Some(json!({
                    "数量": 1,
                    "物品ID": "itm_002",
                    "物品名称": "短剑",
                    "属性": { "b": 2, "a": 1 }
                })),
                expected_row_version: None,
            },
            BridgeCommand::UpsertSheetRows {
                payloads: vec![SheetRowsPayload {
                    sheet_id: String::from("CHARACTER_Resources"),
                    rows: vec![row(&[("CHAR_ID", json!("PLAYER")), ("体力", json!(50))])],
                }],
                expected_row_version: None,
            },
        ];
        build_events_from_commands(
            &commands,
            &BridgeOptions {
                turn_id: String::from("9"),
                source: String::from("ms:bridge"),
                include_sheets: Vec::new(),
            },
        )
    }

    #[test]
    fn direct_replay_and_event_log_replay_agree() {
        let base = baseline();
        let events = bridge_events();

        // Direct path: replay the events themselves.
        let raw: Vec<Value> = events
            .iter()
            .map(|event| serde_json::to_value(event).unwrap())
            .collect();
        let direct = replay_events_to_snapshot(&base, &raw);
        assert_eq!(direct.accepted_events, 4);

        // Log path: persist the events, read them back, replay.
        let mut log_state = StateSnapshot::default();
        log_state.table_rows.insert(
            String::from("SYS_StateVarEventLog"),
            create_event_log_rows(&events),
        );
        let from_log = replay_event_log_from_state(&base, &log_state);
        assert_eq!(from_log.invalid_event_log_rows, 0);

        let diff = diff_snapshots(&direct.snapshot, &from_log.replay.snapshot);
        assert!(diff.matched);
        assert_eq!(diff.totals.changed_cells, 0);
    }

    #[test]
    fn replay_folds_upserts_and_deletes() {
        let base = baseline();
        let events = vec![
            json!({
                "turn_id": "1",
                "source": "t",
                "domain": "inventory",
                "entity_id": "INVENTORY",
                "path": "gameState.背包",
                "op": "push",
                "value": { "物品ID": "itm_002", "物品名称": "短剑", "数量": 1 },
                "created_at": 1_000
            }),
            json!({
                "turn_id": "1",
                "source": "t",
                "domain": "inventory",
                "entity_id": "INVENTORY",
                "path": "gameState.背包[0]",
                "op": "delete",
                "value": { "物品ID": "itm_001" },
                "created_at": 1_001
            }),
        ];
        let result = replay_events_to_snapshot(&base, &events);
        let inventory = result.snapshot.get("ITEM_Inventory").unwrap();
        assert_eq!(inventory.rows.len(), 1);
        assert_eq!(
            inventory.rows.first().unwrap().get("物品ID"),
            Some(&json!("itm_002"))
        );
    }

    #[test]
    fn replayed_upsert_merges_instead_of_replacing() {
        let base = baseline();
        let events = vec![json!({
            "turn_id": "1",
            "source": "t",
            "domain": "character_resources",
            "entity_id": "PLAYER",
            "path": "sheet.CHARACTER_Resources.PLAYER",
            "op": "upsert",
            "value": { "CHAR_ID": "PLAYER", "体力": 50 },
            "created_at": 1_000
        })];
        let result = replay_events_to_snapshot(&base, &events);
        let characters = result.snapshot.get("CHARACTER_Resources").unwrap();
        let player = characters.rows.first().unwrap();
        // The merge keeps the unspecified field.
        assert_eq!(player.get("法利"), Some(&json!(100)));
        assert_eq!(player.get("体力"), Some(&json!(50)));
    }

    #[test]
    fn invalid_log_rows_are_excluded_by_reason() {
        let rows = vec![
            // Valid.
            row(&[
                ("event_id", json!("e1")),
                ("turn_id", json!("1")),
                ("source", json!("t")),
                ("domain", json!("global_state")),
                ("entity_id", json!("GLOBAL")),
                ("path", json!("gameState.当前场景")),
                ("op", json!("set")),
                ("idempotency_key", json!("k1")),
                ("payload", json!("\"市场\"")),
                ("created_at", json!(2_000)),
            ]),
            // Missing a required column.
            row(&[
                ("event_id", json!("e2")),
                ("turn_id", json!("1")),
                ("source", json!("t")),
                ("domain", json!("global_state")),
                ("entity_id", json!("GLOBAL")),
                ("op", json!("set")),
                ("idempotency_key", json!("k2")),
                ("created_at", json!(2_001)),
            ]),
            // Unusable created_at.
            row(&[
                ("event_id", json!("e3")),
                ("turn_id", json!("1")),
                ("source", json!("t")),
                ("domain", json!("global_state")),
                ("entity_id", json!("GLOBAL")),
                ("path", json!("gameState.当前场景")),
                ("op", json!("set")),
                ("idempotency_key", json!("k3")),
                ("created_at", json!("soon")),
            ]),
            // Unparsable payload JSON.
            row(&[
                ("event_id", json!("e4")),
                ("turn_id", json!("1")),
                ("source", json!("t")),
                ("domain", json!("global_state")),
                ("entity_id", json!("GLOBAL")),
                ("path", json!("gameState.当前场景")),
                ("op", json!("set")),
                ("idempotency_key", json!("k4")),
                ("payload", json!("{not json")),
                ("created_at", json!(2_002)),
            ]),
        ];

        let parsed = parse_event_log_rows(&rows);
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.invalid_rows, 3);
        assert_eq!(
            parsed.invalid_rows_by_reason.get("missing_required").copied(),
            Some(1)
        );
        assert_eq!(
            parsed.invalid_rows_by_reason.get("invalid_created_at").copied(),
            Some(1)
        );
        assert_eq!(
            parsed
                .invalid_rows_by_reason
                .get("invalid_event_payload")
                .copied(),
            Some(1)
        );
    }

    #[test]
    fn parsed_events_sort_by_stamp_then_id() {
        let make = |event_id: &str, created_at: i64| {
            row(&[
                ("event_id", json!(event_id)),
                ("turn_id", json!("1")),
                ("source", json!("t")),
                ("domain", json!("global_state")),
                ("entity_id", json!("GLOBAL")),
                ("path", json!("gameState.当前场景")),
                ("op", json!("set")),
                ("idempotency_key", json!(format!("k_{event_id}"))),
                ("created_at", json!(created_at)),
            ])
        };
        let parsed = parse_event_log_rows(&[make("b", 2_000), make("a", 2_000), make("c", 1_000)]);
        let ids: Vec<&str> = parsed.events.iter().map(|event| event.event_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn event_log_rows_round_trip_through_parsing() {
        let events = bridge_events();
        let rows = create_event_log_rows(&events);
        let parsed = parse_event_log_rows(&rows);
        assert_eq!(parsed.invalid_rows, 0);
        assert_eq!(parsed.events.len(), events.len());
        let original_keys: Vec<&str> = events
            .iter()
            .map(|event| event.idempotency_key.as_str())
            .collect();
        assert!(parsed
            .events
            .iter()
            .all(|event| original_keys.contains(&event.idempotency_key.as_str())));
    }
}
