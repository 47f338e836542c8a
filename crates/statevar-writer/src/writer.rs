//! The writer: validation, deduplication, staleness rejection, command
//! synthesis, metrics, and the audit trail.
//!
//! Per-event pipeline: `received -> validated|invalid_event ->
//! duplicate_idempotency|unique -> stale_event|fresh ->
//! no_command|has_commands -> accepted`. Every skip is counted in
//! aggregate *and* itemized per event, so a caller can always explain why
//! a given event did not take effect.
//!
//! The writer owns its [`WriterState`] explicitly (constructor injection)
//! and returns metrics alongside the snapshot; nothing is ever attached
//! to the snapshot object. Conflict stats accumulate across calls and are
//! never reset implicitly.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info};

use statevar_types::sheets::{fields, read_row_id, sheet_ids};
use statevar_types::snapshot::bag_item_id;
use statevar_types::{
    ConflictReason, ConflictStats, DomainRegistry, SheetCommand, SkipCounters, SkipReason,
    StateSnapshot, StateVariableEvent, TableRow, UpsertRowsPayload, WriterCommand, WriterMetrics,
    WriterState,
};

use crate::commands::{build_commands_for_event, is_stale_event};

// ---------------------------------------------------------------------------
// Collaborator seam
// ---------------------------------------------------------------------------

/// The result of the external command executor.
#[derive(Debug, Clone)]
pub struct ExecutorOutcome {
    /// The state after command execution.
    pub snapshot: StateSnapshot,
    /// Whether execution reported an error.
    pub has_error: bool,
    /// Whether execution rolled the state back.
    pub rolled_back: bool,
}

/// The injected command-execution collaborator, called only in apply
/// mode. Owned externally; the writer never interprets its output beyond
/// the returned flags.
pub trait CommandExecutor {
    /// Apply a command list to a state, returning the new state plus
    /// error/rollback flags.
    fn apply(&self, snapshot: StateSnapshot, commands: &[WriterCommand]) -> ExecutorOutcome;
}

/// Execution mode for a consumption pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriterMode {
    /// Compute commands and metrics without mutating live state. The
    /// default; used for dry runs and replay verification.
    #[default]
    Shadow,
    /// Additionally invoke the injected executor with the synthesized
    /// commands.
    Apply,
}

// ---------------------------------------------------------------------------
// Batch input and report
// ---------------------------------------------------------------------------

/// One batch of raw events to consume against a baseline snapshot.
pub struct ConsumeBatch<'a> {
    /// The baseline snapshot. Cloned before anything is applied; never
    /// mutated in place.
    pub snapshot: &'a StateSnapshot,
    /// Raw, possibly invalid event objects.
    pub events: &'a [Value],
    /// Shadow or apply.
    pub mode: WriterMode,
    /// The executor used in apply mode.
    pub executor: Option<&'a dyn CommandExecutor>,
}

/// An event the writer did not accept, with the reason.
#[derive(Debug, Clone)]
pub struct SkippedEvent {
    /// The normalized event, or `None` when the input never normalized.
    pub event: Option<StateVariableEvent>,
    /// Why the event was skipped.
    pub reason: SkipReason,
}

/// The outcome of one consumption pass.
#[derive(Debug, Clone)]
pub struct ConsumeReport {
    /// The resulting snapshot: the baseline (shadow mode) or the
    /// executor's output (apply mode).
    pub snapshot: StateSnapshot,
    /// Events accepted, in input order.
    pub accepted_events: Vec<StateVariableEvent>,
    /// Events skipped, in input order, each with its reason.
    pub skipped_events: Vec<SkippedEvent>,
    /// Sheet commands synthesized from the accepted events.
    pub commands: Vec<WriterCommand>,
    /// Audit-trail commands (always produced, even in shadow mode).
    pub audit_commands: Vec<WriterCommand>,
    /// Metrics for this pass.
    pub metrics: WriterMetrics,
    /// Whether the executor reported an error (apply mode only).
    pub has_error: bool,
    /// Whether the executor rolled back (apply mode only).
    pub rolled_back: bool,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// The event-consumption state machine.
#[derive(Debug, Default)]
pub struct StateVariableWriter {
    state: WriterState,
    registry: DomainRegistry,
}

impl StateVariableWriter {
    /// Create a writer with empty state and the standard domain registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer owning previously persisted state.
    pub fn with_state(state: WriterState) -> Self {
        Self {
            state,
            registry: DomainRegistry::standard(),
        }
    }

    /// The writer's current state (ledger, metrics, conflict stats).
    pub const fn state(&self) -> &WriterState {
        &self.state
    }

    /// Consume the writer, yielding its state for persistence.
    pub fn into_state(self) -> WriterState {
        self.state
    }

    /// Consume one batch of raw events.
    ///
    /// Works against a cloned read view of the baseline so the caller's
    /// snapshot is never mutated. Accepted commands fold into that read
    /// view before the next event is examined, so intra-batch reads see
    /// prior-in-batch writes.
    pub fn consume_events(&mut self, batch: &ConsumeBatch<'_>) -> ConsumeReport {
        let stamp = now_millis();
        let mut read_view = batch.snapshot.clone();
        let mut accepted: Vec<StateVariableEvent> = Vec::new();
        let mut skipped: Vec<SkippedEvent> = Vec::new();
        let mut commands: Vec<WriterCommand> = Vec::new();
        let mut skip_by_reason = SkipCounters::default();
        let mut failed_by_domain: BTreeMap<String, u64> = BTreeMap::new();
        let mut batch_conflicts = ConflictStats::default();

        for raw in batch.events {
            let event = match StateVariableEvent::normalize(raw) {
                Ok(event) => event,
                Err(error) => {
                    debug!(%error, "event failed normalization");
                    skip_by_reason.bump(SkipReason::InvalidEvent);
                    bump_domain(&mut failed_by_domain, "invalid");
                    skipped.push(SkippedEvent {
                        event: None,
                        reason: SkipReason::InvalidEvent,
                    });
                    continue;
                }
            };

            if self.state.idempotency_keys.contains(&event.idempotency_key) {
                skip_by_reason.bump(SkipReason::DuplicateIdempotency);
                batch_conflicts.record(ConflictReason::IdempotencyConflict, stamp);
                bump_domain(&mut failed_by_domain, &event.domain);
                skipped.push(SkippedEvent {
                    event: Some(event),
                    reason: SkipReason::DuplicateIdempotency,
                });
                continue;
            }

            if is_stale_event(&event, &read_view, &self.registry) {
                skip_by_reason.bump(SkipReason::StaleEvent);
                batch_conflicts.record(ConflictReason::StaleEvent, stamp);
                bump_domain(&mut failed_by_domain, &event.domain);
                skipped.push(SkippedEvent {
                    event: Some(event),
                    reason: SkipReason::StaleEvent,
                });
                continue;
            }

            let event_commands = build_commands_for_event(&event, &read_view, &self.registry);
            if event_commands.is_empty() {
                skip_by_reason.bump(SkipReason::NoCommand);
                bump_domain(&mut failed_by_domain, &event.domain);
                skipped.push(SkippedEvent {
                    event: Some(event),
                    reason: SkipReason::NoCommand,
                });
                continue;
            }

            self.state
                .idempotency_keys
                .insert(event.idempotency_key.clone());
            fold_commands_into_read_view(&mut read_view, &event_commands);
            commands.extend(event_commands);
            accepted.push(event);
        }

        let audit_commands = build_audit_commands(&accepted, stamp);
        let metrics = WriterMetrics {
            backlog: 0,
            retry_count: 0,
            failed_by_domain,
            skip_by_reason,
            accepted_count: count(accepted.len()),
            skipped_count: count(skipped.len()),
            command_count: count(commands.len()),
            audit_command_count: count(audit_commands.len()),
            updated_at: stamp,
        };
        self.state.metrics = metrics.clone();
        self.state.conflict_stats.absorb(&batch_conflicts);

        info!(
            accepted = accepted.len(),
            skipped = skipped.len(),
            commands = commands.len(),
            mode = ?batch.mode,
            "consumed state variable events"
        );

        let should_apply =
            batch.mode == WriterMode::Apply && batch.executor.is_some() && !commands.is_empty();
        if should_apply {
            if let Some(executor) = batch.executor {
                let outcome = executor.apply(batch.snapshot.clone(), &commands);
                return ConsumeReport {
                    snapshot: outcome.snapshot,
                    accepted_events: accepted,
                    skipped_events: skipped,
                    commands,
                    audit_commands,
                    metrics,
                    has_error: outcome.has_error,
                    rolled_back: outcome.rolled_back,
                };
            }
        }

        ConsumeReport {
            snapshot: batch.snapshot.clone(),
            accepted_events: accepted,
            skipped_events: skipped,
            commands,
            audit_commands,
            metrics,
            has_error: false,
            rolled_back: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// Render one event into its persisted event-log row shape.
pub fn event_log_row(event: &StateVariableEvent) -> TableRow {
    let mut row = TableRow::new();
    row.insert("event_id".to_owned(), Value::String(event.event_id.clone()));
    row.insert("turn_id".to_owned(), Value::String(event.turn_id.clone()));
    row.insert("source".to_owned(), Value::String(event.source.clone()));
    row.insert("domain".to_owned(), Value::String(event.domain.clone()));
    row.insert("entity_id".to_owned(), Value::String(event.entity_id.clone()));
    row.insert("path".to_owned(), Value::String(event.path.clone()));
    row.insert("op".to_owned(), Value::String(event.op.as_str().to_owned()));
    row.insert(
        "idempotency_key".to_owned(),
        Value::String(event.idempotency_key.clone()),
    );
    row.insert(
        "expected_version".to_owned(),
        event.expected_version.map_or(Value::Null, Value::from),
    );
    let payload = event.value.clone().unwrap_or(Value::Null);
    row.insert(
        "payload".to_owned(),
        Value::String(serde_json::to_string(&payload).unwrap_or_else(|_| String::from("null"))),
    );
    row.insert("created_at".to_owned(), Value::from(event.created_at));
    row
}

/// Build the audit commands for the accepted events: the event-log rows
/// and one queued apply record per event. Produced even in shadow mode --
/// this is the durable trail replay later re-derives events from.
fn build_audit_commands(events: &[StateVariableEvent], stamp: i64) -> Vec<WriterCommand> {
    if events.is_empty() {
        return Vec::new();
    }

    let event_rows: Vec<TableRow> = events.iter().map(event_log_row).collect();
    let apply_rows: Vec<TableRow> = events
        .iter()
        .enumerate()
        .map(|(index, event)| {
            let mut row = TableRow::new();
            row.insert(
                "apply_id".to_owned(),
                Value::String(format!("{}:shadow:{}", event.event_id, index.saturating_add(1))),
            );
            row.insert("event_id".to_owned(), Value::String(event.event_id.clone()));
            row.insert("tx_id".to_owned(), Value::String(String::new()));
            row.insert("sheet_id".to_owned(), Value::String(event.domain.clone()));
            row.insert("row_id".to_owned(), Value::String(event.entity_id.clone()));
            row.insert("result".to_owned(), Value::String(String::from("queued")));
            row.insert("conflict_reason".to_owned(), Value::String(String::new()));
            row.insert("retry_count".to_owned(), Value::from(0));
            row.insert("latency_ms".to_owned(), Value::from(0));
            row.insert("applied_at".to_owned(), Value::from(stamp));
            row
        })
        .collect();

    vec![
        WriterCommand::upsert(sheet_ids::SYS_STATE_VAR_EVENT_LOG, "event_id", event_rows),
        WriterCommand::upsert(sheet_ids::SYS_STATE_VAR_APPLY_LOG, "apply_id", apply_rows),
    ]
}

// ---------------------------------------------------------------------------
// Read-view folding
// ---------------------------------------------------------------------------

/// Fold accepted commands into the working read view so later events in
/// the same batch observe prior-in-batch writes.
fn fold_commands_into_read_view(view: &mut StateSnapshot, commands: &[WriterCommand]) {
    for command in commands {
        match &command.command {
            SheetCommand::UpsertSheetRows(payload) => {
                fold_upsert_into_table_rows(view, payload);
                match payload.sheet_id.as_str() {
                    sheet_ids::SYS_GLOBAL_STATE => {
                        for row in &payload.rows {
                            for (key, value) in row {
                                if key != fields::GLOBAL_ID {
                                    view.globals.insert(key.clone(), value.clone());
                                }
                            }
                        }
                    }
                    sheet_ids::CHARACTER_RESOURCES => {
                        for row in &payload.rows {
                            let entity = read_row_id(row, fields::CHAR_ID)
                                .unwrap_or_else(|| fields::PLAYER.to_owned());
                            let target = view.characters.entry(entity).or_default();
                            for (key, value) in row {
                                target.insert(key.clone(), value.clone());
                            }
                        }
                    }
                    sheet_ids::ITEM_INVENTORY => {
                        for row in &payload.rows {
                            let Some(row_id) = read_row_id(row, fields::ITEM_ID) else {
                                continue;
                            };
                            let position = view
                                .bag
                                .iter()
                                .position(|item| bag_item_id(item).as_deref() == Some(&row_id));
                            match position.and_then(|index| view.bag.get_mut(index)) {
                                Some(existing) => {
                                    for (key, value) in row {
                                        existing.insert(key.clone(), value.clone());
                                    }
                                }
                                None => view.bag.push(row.clone()),
                            }
                        }
                    }
                    _ => {}
                }
            }
            SheetCommand::DeleteSheetRows(payload) => {
                if let Some(rows) = view.table_rows.get_mut(&payload.sheet_id) {
                    rows.retain(|row| {
                        read_row_id(row, &payload.key_field)
                            .is_none_or(|row_id| !payload.row_ids.contains(&row_id))
                    });
                }
                if payload.sheet_id == sheet_ids::ITEM_INVENTORY {
                    view.bag.retain(|item| {
                        bag_item_id(item).is_none_or(|row_id| !payload.row_ids.contains(&row_id))
                    });
                }
            }
        }
    }
}

/// Merge an upsert payload into the read view's persisted table rows.
fn fold_upsert_into_table_rows(view: &mut StateSnapshot, payload: &UpsertRowsPayload) {
    let rows = view.table_rows.entry(payload.sheet_id.clone()).or_default();
    for incoming in &payload.rows {
        let Some(row_id) = read_row_id(incoming, &payload.key_field) else {
            continue;
        };
        let position = rows
            .iter()
            .position(|row| read_row_id(row, &payload.key_field).as_deref() == Some(&row_id));
        match position.and_then(|index| rows.get_mut(index)) {
            Some(existing) => {
                for (key, value) in incoming {
                    existing.insert(key.clone(), value.clone());
                }
            }
            None => rows.push(incoming.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current wall-clock time in epoch milliseconds.
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Count a collection length as a metric value.
fn count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

/// Bump a per-domain failure counter.
fn bump_domain(failed_by_domain: &mut BTreeMap<String, u64>, domain: &str) {
    let key = {
        let trimmed = domain.trim();
        if trimmed.is_empty() {
            "unknown"
        } else {
            trimmed
        }
    };
    let counter = failed_by_domain.entry(key.to_owned()).or_insert(0);
    *counter = counter.saturating_add(1);
}
