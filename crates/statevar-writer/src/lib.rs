//! Event consumption for the Statevar engine.
//!
//! This crate owns the write path: the domain mapper that turns legacy
//! paths and sheet rows into normalized targets, the per-domain rules that
//! turn accepted events into sheet commands, and the
//! [`StateVariableWriter`] state machine that validates, deduplicates,
//! staleness-checks, and meters a batch of raw events against a cloned
//! working snapshot.
//!
//! # Modules
//!
//! - [`bridge`] -- Converts higher-level commands into events
//! - [`commands`] -- Per-domain command synthesis rules
//! - [`mapping`] -- The pure domain mapper (legacy paths, sheet rows)
//! - [`quality`] -- Item quality-label canonicalization
//! - [`writer`] -- The writer state machine, metrics, and audit trail

pub mod bridge;
pub mod commands;
pub mod mapping;
pub mod quality;
pub mod writer;

pub use bridge::{build_events_from_commands, BridgeCommand, BridgeOptions, SheetRowsPayload};
pub use commands::build_commands_for_event;
pub use mapping::{map_legacy_path, map_sheet_row, normalize_game_state_path};
pub use quality::{normalize_quality, normalize_quality_label, QualityKey};
pub use writer::{
    CommandExecutor, ConsumeBatch, ConsumeReport, ExecutorOutcome, SkippedEvent,
    StateVariableWriter, WriterMode,
};
