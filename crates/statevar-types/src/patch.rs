//! Row-level patches, conflicts, and apply reports.
//!
//! A [`SheetPatch`] is the unit the table store consumes: one operation
//! against one row, carrying optional optimistic-version expectations and
//! a lock owner. Conflicts are data, never errors -- the store returns a
//! [`PatchConflict`] per rejected patch alongside the count of patches
//! that succeeded.

use serde::{Deserialize, Serialize};

use crate::TableRow;

// ---------------------------------------------------------------------------
// Conflict reasons
// ---------------------------------------------------------------------------

/// The closed set of reasons a write can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The patch's expected sheet version did not match the store.
    SheetVersionConflict,
    /// The patch's expected row version did not match the store.
    RowVersionConflict,
    /// The target row is locked by a different owner.
    RowLocked,
    /// A written field is cell-locked by a different owner.
    CellLocked,
    /// The patch source is not on the allow-list. Emitted by the external
    /// command-guard collaborator; carried here so its stats round-trip.
    SourceNotAllowed,
    /// A duplicate idempotency key was suppressed by the writer.
    IdempotencyConflict,
    /// An event's optimistic version expectation was behind the row.
    StaleEvent,
}

impl ConflictReason {
    /// The wire spelling of this reason.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SheetVersionConflict => "sheet_version_conflict",
            Self::RowVersionConflict => "row_version_conflict",
            Self::RowLocked => "row_locked",
            Self::CellLocked => "cell_locked",
            Self::SourceNotAllowed => "source_not_allowed",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::StaleEvent => "stale_event",
        }
    }
}

impl core::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// The operation a patch performs on its target row.
///
/// An upsert always carries its row payload, so "upsert without a row" is
/// unrepresentable and patch application has no throw path for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "operation", content = "row")]
pub enum PatchOp {
    /// Merge the given fields into the target row (insert when absent).
    Upsert(TableRow),
    /// Remove the target row.
    Delete,
}

/// One row-level write against a sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetPatch {
    /// The sheet being written.
    pub sheet_id: String,
    /// Identity of the target row (value of the sheet's key field).
    pub row_id: String,
    /// The operation and, for upserts, the row payload.
    #[serde(flatten)]
    pub op: PatchOp,
    /// Reject unless the sheet version equals this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sheet_version: Option<u64>,
    /// Reject unless the row version equals this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_row_version: Option<u64>,
    /// Lock owner on whose behalf this patch writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    /// Fields this patch intends to touch; used for cell-lock granularity.
    /// Empty means "unscoped" and conflicts with any foreign cell lock.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
}

impl SheetPatch {
    /// Build an upsert patch.
    pub fn upsert(sheet_id: impl Into<String>, row_id: impl Into<String>, row: TableRow) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            row_id: row_id.into(),
            op: PatchOp::Upsert(row),
            expected_sheet_version: None,
            expected_row_version: None,
            lock_owner: None,
            changed_fields: Vec::new(),
        }
    }

    /// Build a delete patch.
    pub fn delete(sheet_id: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            row_id: row_id.into(),
            op: PatchOp::Delete,
            expected_sheet_version: None,
            expected_row_version: None,
            lock_owner: None,
            changed_fields: Vec::new(),
        }
    }

    /// Set the expected sheet version.
    #[must_use]
    pub const fn with_expected_sheet_version(mut self, version: u64) -> Self {
        self.expected_sheet_version = Some(version);
        self
    }

    /// Set the expected row version.
    #[must_use]
    pub const fn with_expected_row_version(mut self, version: u64) -> Self {
        self.expected_row_version = Some(version);
        self
    }

    /// Declare the lock owner writing this patch.
    #[must_use]
    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    /// Declare the fields this patch touches.
    #[must_use]
    pub fn with_changed_fields(mut self, fields: Vec<String>) -> Self {
        self.changed_fields = fields;
        self
    }
}

// ---------------------------------------------------------------------------
// Conflicts and reports
// ---------------------------------------------------------------------------

/// A rejected patch, with enough detail to explain the rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchConflict {
    /// The sheet the rejected patch targeted.
    pub sheet_id: String,
    /// The row the rejected patch targeted.
    pub row_id: String,
    /// Why the patch was rejected.
    pub reason: ConflictReason,
    /// Human-readable description.
    pub message: String,
    /// The version the patch expected, for version conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    /// The version the store actually held, for version conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
    /// The locked field, for cell-lock conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// The outcome of applying a batch of patches with conflict reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// How many patches applied successfully.
    pub applied: usize,
    /// The rejected patches, in batch order.
    pub conflicts: Vec<PatchConflict>,
}
