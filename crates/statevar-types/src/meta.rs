//! Runtime concurrency metadata: version counters, locks, conflict stats.
//!
//! This is the state the table store owns exclusively. It can be exported
//! as a plain value (for persistence by the host) and used to seed a fresh
//! store, so "this store already has history" is expressible in tests and
//! replay scenarios.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::patch::ConflictReason;

/// Build the composite key used to track a row version: `sheet::row`.
pub fn row_version_key(sheet_id: &str, row_id: &str) -> String {
    format!("{sheet_id}::{row_id}")
}

/// A row-granular lock held by an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLock {
    /// The locked sheet.
    pub sheet_id: String,
    /// The locked row.
    pub row_id: String,
    /// The owner whose patches may still write the row.
    pub owner: String,
    /// Why the lock was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the lock was taken, epoch milliseconds.
    #[serde(default)]
    pub created_at: i64,
}

/// A cell-granular lock held by an owner on a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLock {
    /// The locked sheet.
    pub sheet_id: String,
    /// The locked row.
    pub row_id: String,
    /// The locked field.
    pub field: String,
    /// The owner whose patches may still write the field.
    pub owner: String,
    /// Why the lock was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the lock was taken, epoch milliseconds.
    #[serde(default)]
    pub created_at: i64,
}

/// Cumulative conflict counters, by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictStats {
    /// Total conflicts recorded.
    pub total: u64,
    /// Conflicts per reason.
    #[serde(default)]
    pub by_reason: BTreeMap<ConflictReason, u64>,
    /// Last update stamp, epoch milliseconds.
    #[serde(default)]
    pub updated_at: i64,
}

impl ConflictStats {
    /// Record one conflict for the given reason.
    pub fn record(&mut self, reason: ConflictReason, stamp: i64) {
        self.total = self.total.saturating_add(1);
        let counter = self.by_reason.entry(reason).or_insert(0);
        *counter = counter.saturating_add(1);
        self.updated_at = stamp;
    }

    /// Merge another set of counters into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.total = self.total.saturating_add(other.total);
        for (reason, count) in &other.by_reason {
            let counter = self.by_reason.entry(*reason).or_insert(0);
            *counter = counter.saturating_add(*count);
        }
        self.updated_at = self.updated_at.max(other.updated_at);
    }

    /// The count recorded for one reason.
    pub fn count(&self, reason: ConflictReason) -> u64 {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }
}

/// The full concurrency metadata owned by the table store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMeta {
    /// Per-sheet version counters.
    #[serde(default)]
    pub sheet_versions: BTreeMap<String, u64>,
    /// Per-row version counters, keyed `sheet::row`.
    #[serde(default)]
    pub row_versions: BTreeMap<String, u64>,
    /// Active row locks.
    #[serde(default)]
    pub row_locks: Vec<RowLock>,
    /// Active cell locks.
    #[serde(default)]
    pub cell_locks: Vec<CellLock>,
    /// Cumulative conflict counters.
    #[serde(default)]
    pub conflict_stats: ConflictStats,
}

impl RuntimeMeta {
    /// The tracked version of one row, zero when never written.
    pub fn row_version(&self, sheet_id: &str, row_id: &str) -> u64 {
        self.row_versions
            .get(&row_version_key(sheet_id, row_id))
            .copied()
            .unwrap_or(0)
    }
}
