//! End-to-end replay verification across the Statevar crates.
//!
//! These tests drive the whole pipeline the way a host would: bridge
//! commands become events, events flow through the partitioned queue into
//! the writer, the writer's commands land on the table store as patches,
//! and the persisted event log is replayed and diffed against the live
//! snapshot to produce a gate verdict.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use statevar_queue::PartitionedQueue;
use statevar_replay::{
    create_event_log_rows, diff_snapshots, evaluate_replay_gate, replay_event_log_from_state,
    DiffSheetSnapshot, DiffSnapshot, GateStatus, GateThresholds,
};
use statevar_store::{ProjectedTable, TableStore};
use statevar_types::sheets::PILOT_SHEETS;
use statevar_types::{SkipReason, StateSnapshot, StateVariableEvent, TableRow};
use statevar_writer::bridge::{
    build_events_from_commands, BridgeCommand, BridgeOptions, SheetRowsPayload,
};
use statevar_writer::{ConsumeBatch, StateVariableWriter, WriterMode};

// =============================================================================
// Helpers: baseline state, store, and bridge commands
// =============================================================================

fn row(pairs: &[(&str, Value)]) -> TableRow {
    let mut map = TableRow::new();
    for (key, value) in pairs {
        map.insert((*key).to_owned(), value.clone());
    }
    map
}

fn global_row() -> TableRow {
    row(&[
        ("_global_id", json!("GLOBAL_STATE")),
        ("当前场景", json!("旧城区")),
        ("当前回合", json!(3)),
    ])
}

fn player_row() -> TableRow {
    row(&[("CHAR_ID", json!("PLAYER")), ("法利", json!(100))])
}

fn apple_row() -> TableRow {
    row(&[
        ("物品ID", json!("itm_001")),
        ("物品名称", json!("苹果")),
        ("数量", json!(2)),
    ])
}

/// The baseline snapshot the writer reads against, with its read views
/// and persisted pilot-sheet rows agreeing with [`baseline_store`].
fn baseline_snapshot() -> StateSnapshot {
    let mut state = StateSnapshot::default();
    state.globals.insert("当前场景".to_owned(), json!("旧城区"));
    state.globals.insert("当前回合".to_owned(), json!(3));
    let mut player = TableRow::new();
    player.insert("法利".to_owned(), json!(100));
    state.characters.insert(String::from("PLAYER"), player);
    state.bag.push(apple_row());
    state
        .table_rows
        .insert(String::from("SYS_GlobalState"), vec![global_row()]);
    state
        .table_rows
        .insert(String::from("CHARACTER_Resources"), vec![player_row()]);
    state
        .table_rows
        .insert(String::from("ITEM_Inventory"), vec![apple_row()]);
    state
}

/// A live table store bootstrapped from the same rows as the snapshot.
fn baseline_store() -> TableStore {
    let tables = vec![
        ProjectedTable {
            id: String::from("SYS_GlobalState"),
            label: None,
            columns: Vec::new(),
            rows: vec![global_row()],
        },
        ProjectedTable {
            id: String::from("CHARACTER_Resources"),
            label: None,
            columns: Vec::new(),
            rows: vec![player_row()],
        },
        ProjectedTable {
            id: String::from("ITEM_Inventory"),
            label: None,
            columns: Vec::new(),
            rows: vec![apple_row()],
        },
    ];
    TableStore::from_projected_tables(&tables, None)
}

/// Collect the store's pilot sheets into a diffable snapshot.
fn store_diff_snapshot(store: &TableStore) -> DiffSnapshot {
    let mut snapshot = DiffSnapshot::new();
    for sheet_id in PILOT_SHEETS {
        let sheet = store.snapshot_sheet(sheet_id);
        snapshot.insert(
            (*sheet_id).to_owned(),
            DiffSheetSnapshot {
                key_field: sheet.key_field,
                rows: sheet.rows,
            },
        );
    }
    snapshot
}

/// One turn's worth of bridge commands touching every bespoke domain.
fn turn_commands() -> Vec<BridgeCommand> {
    vec![
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
            // Unsorted object keys exercise the canonical-equality path.
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
    ]
}

fn bridge_events() -> Vec<StateVariableEvent> {
    build_events_from_commands(
        &turn_commands(),
        &BridgeOptions {
            turn_id: String::from("9"),
            source: String::from("ms:bridge"),
            include_sheets: Vec::new(),
        },
    )
}

/// Drain events through the queue in partition order, collecting the raw
/// values the writer will consume.
async fn collect_through_queue(events: Vec<StateVariableEvent>) -> Vec<Value> {
    let queue = PartitionedQueue::new();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let results = queue
        .enqueue_batch(events, move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock()
                    .unwrap()
                    .push(serde_json::to_value(&event).unwrap());
            }
        })
        .await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(queue.pending_partitions(), 0);
    let collected = seen.lock().unwrap();
    collected.clone()
}

// =============================================================================
// Full pipeline: live apply vs event-log replay
// =============================================================================

#[tokio::test]
async fn live_apply_and_event_log_replay_agree() {
    let baseline = baseline_snapshot();
    let raws = collect_through_queue(bridge_events()).await;

    // Consume the batch in shadow mode and apply the commands to the
    // live store as patches.
    let mut writer = StateVariableWriter::new();
    let report = writer.consume_events(&ConsumeBatch {
        snapshot: &baseline,
        events: &raws,
        mode: WriterMode::Shadow,
        executor: None,
    });
    assert_eq!(report.accepted_events.len(), 4);
    assert!(report.skipped_events.is_empty());

    let mut store = baseline_store();
    let patches: Vec<_> = report
        .commands
        .iter()
        .flat_map(statevar_types::WriterCommand::to_patches)
        .collect();
    let apply = store.apply_patches_with_report(&patches);
    assert!(apply.conflicts.is_empty());
    assert_eq!(apply.applied, patches.len());

    // The live store reflects the turn.
    let live = store_diff_snapshot(&store);
    let globals = live.get("SYS_GlobalState").unwrap();
    assert_eq!(
        globals.rows.first().unwrap().get("当前场景"),
        Some(&json!("公会本部"))
    );
    let characters = live.get("CHARACTER_Resources").unwrap();
    assert_eq!(
        characters.rows.first().unwrap().get("法利"),
        Some(&json!(130))
    );
    assert_eq!(live.get("ITEM_Inventory").unwrap().rows.len(), 2);

    // Persist the accepted events, replay the log, and diff.
    let mut log_state = StateSnapshot::default();
    log_state.table_rows.insert(
        String::from("SYS_StateVarEventLog"),
        create_event_log_rows(&report.accepted_events),
    );
    let replayed = replay_event_log_from_state(&baseline, &log_state);
    assert_eq!(replayed.invalid_event_log_rows, 0);
    assert_eq!(replayed.replay.accepted_events, 4);

    let diff = diff_snapshots(&live, &replayed.replay.snapshot);
    assert!(diff.matched);
    assert_eq!(diff.totals.changed_cells, 0);

    let gate = evaluate_replay_gate(&diff, replayed.invalid_event_log_rows, GateThresholds::default());
    assert_eq!(gate.status, GateStatus::Pass);
    assert!(gate.reasons.is_empty());
}

#[tokio::test]
async fn stale_events_are_excluded_from_both_sides() {
    let mut baseline = baseline_snapshot();
    baseline.meta.row_versions.insert(
        String::from("CHARACTER_Resources::PLAYER"),
        3,
    );

    let mut raws = collect_through_queue(bridge_events()).await;
    raws.push(json!({
        "turn_id": "9",
        "source": "ms:late",
        "domain": "character_resources",
        "entity_id": "PLAYER",
        "path": "gameState.角色.法利",
        "op": "set",
        "value": 1,
        "expected_version": 1,
        "created_at": 9_000
    }));

    let mut writer = StateVariableWriter::new();
    let report = writer.consume_events(&ConsumeBatch {
        snapshot: &baseline,
        events: &raws,
        mode: WriterMode::Shadow,
        executor: None,
    });
    assert_eq!(report.accepted_events.len(), 4);
    assert_eq!(report.skipped_events.len(), 1);
    assert_eq!(
        report.skipped_events.first().unwrap().reason,
        SkipReason::StaleEvent
    );

    // Only accepted events reach the log, so replay agrees with the live
    // apply even though a stale event was in the batch.
    let mut store = baseline_store();
    let patches: Vec<_> = report
        .commands
        .iter()
        .flat_map(statevar_types::WriterCommand::to_patches)
        .collect();
    store.apply_patches_with_report(&patches);

    let mut log_state = StateSnapshot::default();
    log_state.table_rows.insert(
        String::from("SYS_StateVarEventLog"),
        create_event_log_rows(&report.accepted_events),
    );
    let replayed = replay_event_log_from_state(&baseline, &log_state);
    let diff = diff_snapshots(&store_diff_snapshot(&store), &replayed.replay.snapshot);
    assert!(diff.matched);
}

// =============================================================================
// Gate degradation on log damage
// =============================================================================

#[tokio::test]
async fn missing_log_row_degrades_the_gate() {
    let baseline = baseline_snapshot();
    let raws = collect_through_queue(bridge_events()).await;

    let mut writer = StateVariableWriter::new();
    let report = writer.consume_events(&ConsumeBatch {
        snapshot: &baseline,
        events: &raws,
        mode: WriterMode::Shadow,
        executor: None,
    });

    let mut store = baseline_store();
    let patches: Vec<_> = report
        .commands
        .iter()
        .flat_map(statevar_types::WriterCommand::to_patches)
        .collect();
    store.apply_patches_with_report(&patches);

    // Drop the inventory push from the persisted log: the replayed
    // snapshot is now missing a row the live store has.
    let mut rows = create_event_log_rows(&report.accepted_events);
    rows.retain(|logged| logged.get("domain") != Some(&json!("inventory")));
    let mut log_state = StateSnapshot::default();
    log_state
        .table_rows
        .insert(String::from("SYS_StateVarEventLog"), rows);

    let replayed = replay_event_log_from_state(&baseline, &log_state);
    let diff = diff_snapshots(&store_diff_snapshot(&store), &replayed.replay.snapshot);
    assert!(!diff.matched);
    assert_eq!(diff.totals.missing_in_replay, 1);

    let gate = evaluate_replay_gate(&diff, replayed.invalid_event_log_rows, GateThresholds::default());
    assert_eq!(gate.status, GateStatus::Warn);
    assert!(gate.reasons.iter().any(|reason| reason == "missingRows>=1"));
}

#[tokio::test]
async fn corrupted_payload_counts_as_an_invalid_row() {
    let baseline = baseline_snapshot();
    let raws = collect_through_queue(bridge_events()).await;

    let mut writer = StateVariableWriter::new();
    let report = writer.consume_events(&ConsumeBatch {
        snapshot: &baseline,
        events: &raws,
        mode: WriterMode::Shadow,
        executor: None,
    });

    let mut store = baseline_store();
    let patches: Vec<_> = report
        .commands
        .iter()
        .flat_map(statevar_types::WriterCommand::to_patches)
        .collect();
    store.apply_patches_with_report(&patches);

    // Corrupt the scene-set payload: the row is excluded from replay and
    // counted, and the drift it leaves behind shows up in the diff.
    let mut rows = create_event_log_rows(&report.accepted_events);
    for logged in &mut rows {
        if logged.get("path") == Some(&json!("gameState.当前场景")) {
            logged.insert("payload".to_owned(), json!("{not json"));
        }
    }
    let mut log_state = StateSnapshot::default();
    log_state
        .table_rows
        .insert(String::from("SYS_StateVarEventLog"), rows);

    let replayed = replay_event_log_from_state(&baseline, &log_state);
    assert_eq!(replayed.invalid_event_log_rows, 1);
    assert_eq!(
        replayed
            .invalid_event_log_rows_by_reason
            .get("invalid_event_payload")
            .copied(),
        Some(1)
    );

    let diff = diff_snapshots(&store_diff_snapshot(&store), &replayed.replay.snapshot);
    let gate = evaluate_replay_gate(&diff, replayed.invalid_event_log_rows, GateThresholds::default());
    assert_eq!(gate.status, GateStatus::Warn);
    assert!(gate.reasons.iter().any(|reason| reason == "invalidRows>=1"));
}
