//! In-memory versioned table store for the Statevar engine.
//!
//! The [`TableStore`] holds named sheets of keyed rows with per-sheet and
//! per-row version counters, row locks, and cell locks. Patches apply
//! transactionally per row with conflict detection: a conflicting patch is
//! skipped and reported as data, never thrown, so a caller can apply a
//! batch and inspect exactly which rows were rejected and why.
//!
//! # Invariants
//!
//! - The store exclusively owns row/version/lock state; all mutation goes
//!   through its public methods.
//! - `apply_patches_with_report` applies patches strictly in array order
//!   and short-circuits only the individual conflicting patch.
//! - Version counters only ever increase; conflict stats accumulate and
//!   survive an export/reseed round trip.

pub mod store;

pub use store::{PatchOutcome, ProjectedTable, SheetSnapshot, StoreError, TableStore};
