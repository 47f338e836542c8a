//! Snapshot diffing and event-log replay verification for the Statevar
//! engine.
//!
//! The verification loop: take a live pilot-sheet snapshot, reconstruct an
//! equivalent snapshot by replaying the persisted event log through the
//! writer in shadow mode, diff the two at row/cell granularity, and reduce
//! the diff into a pass/warn/fail verdict against configurable
//! thresholds. Replay must reproduce the live snapshot bit-for-bit at the
//! row/cell level; anything else is drift, and drift is never silently
//! reported as a pass.
//!
//! # Modules
//!
//! - [`diff`] -- Row-identity indexing and cell-level snapshot diffing
//! - [`gate`] -- Threshold configuration and the pass/warn/fail verdict
//! - [`replay`] -- Replay reconstruction and event-log row parsing

pub mod diff;
pub mod gate;
pub mod replay;

pub use diff::{
    diff_snapshots, DiffResult, DiffSheetSnapshot, DiffSnapshot, DiffTotals, NoiseTotals,
    SheetDiffNoise, SheetDiffSummary,
};
pub use gate::{evaluate_replay_gate, GateResult, GateStatus, GateThresholds};
pub use replay::{
    collect_diff_snapshot, create_event_log_rows, parse_event_log_rows,
    replay_event_log_from_state, replay_events_to_snapshot, LogReplayResult, ParsedEventLog,
    ReplayResult,
};
