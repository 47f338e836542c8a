//! Shared type definitions for the Statevar engine.
//!
//! This crate is the single source of truth for the types used across the
//! Statevar workspace: the event model, sheet patches and conflicts,
//! runtime concurrency metadata, the sheet/domain registry, and the
//! canonical-JSON utilities that idempotency hashing and snapshot diffing
//! both depend on.
//!
//! # Modules
//!
//! - [`canon`] -- Canonical JSON rendering and structural equality
//! - [`command`] -- Sheet-level write commands emitted by the writer
//! - [`event`] -- The state variable event model and batch envelope
//! - [`meta`] -- Runtime concurrency metadata (versions, locks, stats)
//! - [`patch`] -- Row-level patches, conflicts, and apply reports
//! - [`sheets`] -- Sheet identifiers, key fields, and domain strategies
//! - [`snapshot`] -- The baseline state snapshot consumed by the writer
//! - [`writer_state`] -- Writer-owned ledger and runtime metrics

pub mod canon;
pub mod command;
pub mod event;
pub mod meta;
pub mod patch;
pub mod sheets;
pub mod snapshot;
pub mod writer_state;

/// A table row: a flat JSON object mapping column names to values.
pub type TableRow = serde_json::Map<String, serde_json::Value>;

// Re-export primary types at crate root for convenience.
pub use canon::{as_finite_number, number_value, stable_stringify, structurally_equal};
pub use command::{
    DeleteRowsPayload, SheetCommand, UpsertRowsPayload, WriterCommand, STATE_WRITER_SOURCE,
};
pub use event::{
    BatchMeta, EventBatchEnvelope, EventDraft, EventError, EventOp, StateVariableEvent,
};
pub use meta::{CellLock, ConflictStats, RowLock, RuntimeMeta};
pub use patch::{ApplyReport, ConflictReason, PatchConflict, PatchOp, SheetPatch};
pub use sheets::{DomainRegistry, DomainSpec, StateVariableTarget};
pub use snapshot::StateSnapshot;
pub use writer_state::{SkipCounters, SkipReason, WriterMetrics, WriterState};
