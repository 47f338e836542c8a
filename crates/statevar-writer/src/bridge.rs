//! The bridge: converting higher-level commands into state variable
//! events.
//!
//! External callers speak in commands (`set`/`add`/`push`/`delete` with a
//! dotted key, or whole-sheet `upsert_sheet_rows` payloads). The bridge
//! runs them through the domain mapper and emits normalized events with
//! deterministic ids and idempotency keys, ready for the queue and
//! writer. Commands that do not land on a pilot domain are silently
//! dropped -- they belong to collaborators, not to this engine.

use serde_json::Value;

use statevar_types::sheets::is_pilot_sheet;
use statevar_types::{EventDraft, EventOp, StateVariableEvent, TableRow};

use crate::mapping::{map_legacy_path, map_sheet_row};

/// One sheet's worth of rows inside an `upsert_sheet_rows` command.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRowsPayload {
    /// The target sheet.
    pub sheet_id: String,
    /// The rows to upsert.
    pub rows: Vec<TableRow>,
}

/// A higher-level command accepted by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    /// Overwrite the value at a legacy dotted key.
    Set {
        /// The legacy dotted key.
        key: String,
        /// The value to write.
        value: Option<Value>,
        /// Row version the sender last observed.
        expected_row_version: Option<u64>,
    },
    /// Apply a numeric delta at a legacy dotted key.
    Add {
        /// The legacy dotted key.
        key: String,
        /// The delta payload.
        value: Option<Value>,
        /// Row version the sender last observed.
        expected_row_version: Option<u64>,
    },
    /// Append to the list at a legacy dotted key.
    Push {
        /// The legacy dotted key.
        key: String,
        /// The item payload.
        value: Option<Value>,
        /// Row version the sender last observed.
        expected_row_version: Option<u64>,
    },
    /// Remove the value at a legacy dotted key.
    Delete {
        /// The legacy dotted key.
        key: String,
        /// An optional payload identifying what to remove.
        value: Option<Value>,
        /// Row version the sender last observed.
        expected_row_version: Option<u64>,
    },
    /// Upsert whole rows into one or more sheets.
    UpsertSheetRows {
        /// The per-sheet payloads.
        payloads: Vec<SheetRowsPayload>,
        /// Row version the sender last observed.
        expected_row_version: Option<u64>,
    },
}

impl BridgeCommand {
    /// The legacy action spelling, for legacy-path commands.
    const fn legacy_op(&self) -> Option<EventOp> {
        match self {
            Self::Set { .. } => Some(EventOp::Set),
            Self::Add { .. } => Some(EventOp::Add),
            Self::Push { .. } => Some(EventOp::Push),
            Self::Delete { .. } => Some(EventOp::Delete),
            Self::UpsertSheetRows { .. } => None,
        }
    }

    /// The legacy key, value, and expectation, for legacy-path commands.
    const fn legacy_parts(&self) -> Option<(&String, &Option<Value>, Option<u64>)> {
        match self {
            Self::Set {
                key,
                value,
                expected_row_version,
            }
            | Self::Add {
                key,
                value,
                expected_row_version,
            }
            | Self::Push {
                key,
                value,
                expected_row_version,
            }
            | Self::Delete {
                key,
                value,
                expected_row_version,
            } => Some((key, value, *expected_row_version)),
            Self::UpsertSheetRows { .. } => None,
        }
    }
}

/// Options for a bridge conversion pass.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    /// The turn all produced events belong to.
    pub turn_id: String,
    /// The source label stamped on produced events.
    pub source: String,
    /// When non-empty, only these sheets produce events from
    /// `upsert_sheet_rows` payloads.
    pub include_sheets: Vec<String>,
}

/// Convert a command list into normalized events via the domain mapper.
///
/// Only the row-version expectation passes through; sheet versions belong
/// to the transaction layer and never become an event's
/// `expected_version`.
pub fn build_events_from_commands(
    commands: &[BridgeCommand],
    options: &BridgeOptions,
) -> Vec<StateVariableEvent> {
    let mut events = Vec::new();

    for (command_index, command) in commands.iter().enumerate() {
        if let (Some(op), Some((key, value, expected))) =
            (command.legacy_op(), command.legacy_parts())
        {
            let Some(target) = map_legacy_path(key) else {
                continue;
            };
            events.push(StateVariableEvent::create(EventDraft {
                turn_id: Some(options.turn_id.clone()),
                source: Some(options.source.clone()),
                domain: Some(target.domain),
                entity_id: Some(target.entity_id),
                path: Some(target.path.clone()),
                op: Some(op),
                value: value.clone(),
                expected_version: expected,
                event_id: Some(format!("legacy_{}_{}", options.turn_id, command_index)),
                idempotency_key: Some(format!(
                    "{}:legacy:{}:{}:{}",
                    options.turn_id,
                    command_index,
                    op.as_str(),
                    target.path
                )),
                created_at: None,
            }));
            continue;
        }

        let BridgeCommand::UpsertSheetRows {
            payloads,
            expected_row_version,
        } = command
        else {
            continue;
        };

        for (payload_index, payload) in payloads.iter().enumerate() {
            if !is_pilot_sheet(&payload.sheet_id) {
                continue;
            }
            if !options.include_sheets.is_empty()
                && !options.include_sheets.contains(&payload.sheet_id)
            {
                continue;
            }
            for (row_index, row) in payload.rows.iter().enumerate() {
                let Some(target) = map_sheet_row(&payload.sheet_id, row) else {
                    continue;
                };
                events.push(StateVariableEvent::create(EventDraft {
                    turn_id: Some(options.turn_id.clone()),
                    source: Some(options.source.clone()),
                    domain: Some(target.domain),
                    entity_id: Some(target.entity_id.clone()),
                    path: Some(target.path),
                    op: Some(EventOp::Upsert),
                    value: Some(Value::Object(row.clone())),
                    expected_version: *expected_row_version,
                    event_id: Some(format!(
                        "sheet_{}_{}_{}_{}",
                        options.turn_id, command_index, payload_index, row_index
                    )),
                    idempotency_key: Some(format!(
                        "{}:sheet:{}:{}:{}:{}",
                        options.turn_id,
                        payload.sheet_id,
                        target.entity_id,
                        command_index,
                        row_index
                    )),
                    created_at: None,
                }));
            }
        }
    }

    events
}
