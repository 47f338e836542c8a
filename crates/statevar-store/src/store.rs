//! The table store: sheets, versions, locks, and patch application.

use std::collections::BTreeMap;

use tracing::debug;

use statevar_types::meta::row_version_key;
use statevar_types::patch::{ApplyReport, ConflictReason, PatchConflict, PatchOp, SheetPatch};
use statevar_types::sheets::{default_key_field, merge_row, read_row_id};
use statevar_types::{CellLock, ConflictStats, RowLock, RuntimeMeta, TableRow};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the simple (non-reporting) store entry points.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A row offered to `upsert` had no usable value in the sheet's key
    /// field.
    #[error("row for sheet '{sheet_id}' has no usable value in key field '{key_field}'")]
    MissingRowId {
        /// The sheet being written.
        sheet_id: String,
        /// The key field that failed to resolve.
        key_field: String,
    },

    /// A patch was rejected by the conflict check.
    #[error("patch conflict on {sheet_id}/{row_id}: {message}")]
    Conflict {
        /// The sheet the rejected patch targeted.
        sheet_id: String,
        /// The row the rejected patch targeted.
        row_id: String,
        /// Why the patch was rejected.
        reason: ConflictReason,
        /// Human-readable description.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// A table supplied by the external projection collaborator, used to
/// bootstrap a store.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProjectedTable {
    /// The sheet identifier.
    pub id: String,
    /// Human-readable label, if the projection carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Declared column names, in display order.
    #[serde(default)]
    pub columns: Vec<String>,
    /// The projected rows.
    #[serde(default)]
    pub rows: Vec<TableRow>,
}

/// A read-only snapshot of one sheet.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SheetSnapshot {
    /// The sheet's key field.
    pub key_field: String,
    /// The rows, in insertion order.
    pub rows: Vec<TableRow>,
    /// The sheet version counter.
    pub sheet_version: u64,
}

/// The outcome of attempting a single patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    /// Whether the patch mutated the store. A delete of an absent row is
    /// neither applied nor a conflict.
    pub applied: bool,
    /// The conflict that rejected the patch, when one did.
    pub conflict: Option<PatchConflict>,
}

/// One sheet's live state.
#[derive(Debug, Clone)]
struct TableState {
    key_field: String,
    rows: Vec<TableRow>,
    index_by_id: BTreeMap<String, usize>,
    row_version_by_id: BTreeMap<String, u64>,
    sheet_version: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The in-memory table store.
///
/// See the crate docs for the invariants this type maintains.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: BTreeMap<String, TableState>,
    seed_sheet_versions: BTreeMap<String, u64>,
    seed_row_versions: BTreeMap<String, u64>,
    row_locks: Vec<RowLock>,
    cell_locks: Vec<CellLock>,
    conflict_stats: ConflictStats,
}

impl TableStore {
    /// Create an empty store with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with previously exported runtime metadata.
    ///
    /// Only version/lock/stat state is seeded; no rows. Used to simulate
    /// "this store already has history" in conflict scenarios.
    pub fn from_runtime_meta(meta: &RuntimeMeta) -> Self {
        Self {
            tables: BTreeMap::new(),
            seed_sheet_versions: meta.sheet_versions.clone(),
            seed_row_versions: meta.row_versions.clone(),
            row_locks: meta.row_locks.clone(),
            cell_locks: meta.cell_locks.clone(),
            conflict_stats: meta.conflict_stats.clone(),
        }
    }

    /// Bootstrap a store from externally projected tables, optionally
    /// seeding runtime metadata first.
    ///
    /// Rows without a usable key value get a positional `sheet_N`
    /// identity so nothing is silently dropped during bootstrap.
    pub fn from_projected_tables(tables: &[ProjectedTable], meta: Option<&RuntimeMeta>) -> Self {
        let mut store = meta.map_or_else(Self::new, Self::from_runtime_meta);
        for table in tables {
            let key_field = default_key_field(&table.id).to_owned();
            for (index, row) in table.rows.iter().enumerate() {
                let row_id = read_row_id(row, &key_field)
                    .unwrap_or_else(|| format!("{}_{}", table.id, index.saturating_add(1)));
                store.upsert_with_id(&table.id, &row_id, row.clone());
            }
        }
        store
    }

    // -- reads --------------------------------------------------------------

    /// All rows of a sheet, cloned, in insertion order. No versioning side
    /// effects.
    pub fn select(&self, sheet_id: &str) -> Vec<TableRow> {
        self.tables
            .get(sheet_id)
            .map_or_else(Vec::new, |table| table.rows.clone())
    }

    /// One row by identity, cloned. No versioning side effects.
    pub fn get_by_id(&self, sheet_id: &str, row_id: &str) -> Option<TableRow> {
        let table = self.tables.get(sheet_id)?;
        let index = table.index_by_id.get(row_id)?;
        table.rows.get(*index).cloned()
    }

    /// The current version counter of a sheet.
    pub fn sheet_version(&self, sheet_id: &str) -> u64 {
        self.tables.get(sheet_id).map_or_else(
            || self.seed_sheet_versions.get(sheet_id).copied().unwrap_or(0),
            |table| table.sheet_version,
        )
    }

    /// The current version counter of a row.
    pub fn row_version(&self, sheet_id: &str, row_id: &str) -> u64 {
        self.tables
            .get(sheet_id)
            .and_then(|table| table.row_version_by_id.get(row_id).copied())
            .or_else(|| {
                self.seed_row_versions
                    .get(&row_version_key(sheet_id, row_id))
                    .copied()
            })
            .unwrap_or(0)
    }

    /// A read-only snapshot of one sheet.
    pub fn snapshot_sheet(&self, sheet_id: &str) -> SheetSnapshot {
        self.tables.get(sheet_id).map_or_else(
            || SheetSnapshot {
                key_field: default_key_field(sheet_id).to_owned(),
                rows: Vec::new(),
                sheet_version: self.sheet_version(sheet_id),
            },
            |table| SheetSnapshot {
                key_field: table.key_field.clone(),
                rows: table.rows.clone(),
                sheet_version: table.sheet_version,
            },
        )
    }

    /// Read-only snapshots of every live sheet.
    pub fn snapshot(&self) -> BTreeMap<String, SheetSnapshot> {
        self.tables
            .keys()
            .map(|sheet_id| (sheet_id.clone(), self.snapshot_sheet(sheet_id)))
            .collect()
    }

    // -- writes -------------------------------------------------------------

    /// Merge a row into a sheet by its key field.
    ///
    /// Incoming fields overwrite, unspecified fields persist. Bumps the
    /// sheet version and the affected row's version.
    pub fn upsert(&mut self, sheet_id: &str, row: TableRow) -> Result<TableRow, StoreError> {
        let key_field = self
            .tables
            .get(sheet_id)
            .map_or_else(|| default_key_field(sheet_id).to_owned(), |table| {
                table.key_field.clone()
            });
        let row_id = read_row_id(&row, &key_field).ok_or_else(|| StoreError::MissingRowId {
            sheet_id: sheet_id.to_owned(),
            key_field,
        })?;
        Ok(self.upsert_with_id(sheet_id, &row_id, row))
    }

    /// Remove a row; returns whether anything was removed.
    pub fn delete(&mut self, sheet_id: &str, row_id: &str) -> bool {
        self.ensure_sheet(sheet_id);
        let Some(table) = self.tables.get_mut(sheet_id) else {
            return false;
        };
        let Some(index) = table.index_by_id.get(row_id).copied() else {
            return false;
        };
        if index < table.rows.len() {
            table.rows.remove(index);
        }
        table.index_by_id.remove(row_id);
        // Reindex the rows that shifted down.
        let key_field = table.key_field.clone();
        for (position, row) in table.rows.iter().enumerate().skip(index) {
            if let Some(shifted_id) = read_row_id(row, &key_field) {
                table.index_by_id.insert(shifted_id, position);
            }
        }
        self.bump_versions(sheet_id, row_id);
        true
    }

    // -- locks --------------------------------------------------------------

    /// Take (or reassert) a row lock. Re-locking by the same owner is a
    /// no-op.
    pub fn lock_row(&mut self, lock: RowLock) {
        let mut normalized = lock;
        if normalized.created_at == 0 {
            normalized.created_at = now_millis();
        }
        let exists = self.row_locks.iter().any(|held| {
            held.sheet_id == normalized.sheet_id
                && held.row_id == normalized.row_id
                && held.owner == normalized.owner
        });
        if !exists {
            self.row_locks.push(normalized);
        }
    }

    /// Release row locks matching the sheet, row, and (when given) owner.
    pub fn unlock_row(&mut self, sheet_id: &str, row_id: &str, owner: Option<&str>) {
        self.row_locks.retain(|lock| {
            lock.sheet_id != sheet_id
                || lock.row_id != row_id
                || owner.is_some_and(|expected| lock.owner != expected)
        });
    }

    /// Take (or reassert) a cell lock. Locks with an empty field are
    /// ignored; re-locking by the same owner is a no-op.
    pub fn lock_cell(&mut self, lock: CellLock) {
        let mut normalized = lock;
        normalized.field = normalized.field.trim().to_owned();
        if normalized.field.is_empty() {
            return;
        }
        if normalized.created_at == 0 {
            normalized.created_at = now_millis();
        }
        let exists = self.cell_locks.iter().any(|held| {
            held.sheet_id == normalized.sheet_id
                && held.row_id == normalized.row_id
                && held.field == normalized.field
                && held.owner == normalized.owner
        });
        if !exists {
            self.cell_locks.push(normalized);
        }
    }

    /// Release cell locks matching the sheet, row, field, and (when given)
    /// owner.
    pub fn unlock_cell(&mut self, sheet_id: &str, row_id: &str, field: &str, owner: Option<&str>) {
        self.cell_locks.retain(|lock| {
            lock.sheet_id != sheet_id
                || lock.row_id != row_id
                || lock.field != field
                || owner.is_some_and(|expected| lock.owner != expected)
        });
    }

    // -- patch application --------------------------------------------------

    /// Attempt one patch: check the conflict ladder, then apply.
    pub fn try_apply_patch(&mut self, patch: &SheetPatch) -> PatchOutcome {
        self.ensure_sheet(&patch.sheet_id);
        if let Some(conflict) = self.check_patch_conflict(patch) {
            debug!(
                sheet_id = %conflict.sheet_id,
                row_id = %conflict.row_id,
                reason = %conflict.reason,
                "patch rejected"
            );
            self.conflict_stats.record(conflict.reason, now_millis());
            return PatchOutcome {
                applied: false,
                conflict: Some(conflict),
            };
        }

        let applied = match &patch.op {
            PatchOp::Upsert(row) => {
                self.upsert_with_id(&patch.sheet_id, &patch.row_id, row.clone());
                true
            }
            PatchOp::Delete => self.delete(&patch.sheet_id, &patch.row_id),
        };
        PatchOutcome {
            applied,
            conflict: None,
        }
    }

    /// Apply an ordered list of patches, failing fast on the first
    /// conflict. For simple scenarios and tests; prefer
    /// [`apply_patches_with_report`](Self::apply_patches_with_report) when
    /// conflicts are expected.
    pub fn apply_patches(&mut self, patches: &[SheetPatch]) -> Result<(), StoreError> {
        for patch in patches {
            let outcome = self.try_apply_patch(patch);
            if let Some(conflict) = outcome.conflict {
                return Err(StoreError::Conflict {
                    sheet_id: conflict.sheet_id,
                    row_id: conflict.row_id,
                    reason: conflict.reason,
                    message: conflict.message,
                });
            }
        }
        Ok(())
    }

    /// Apply an ordered list of patches, collecting conflicts as data.
    ///
    /// Each conflicting patch is skipped individually; the rest of the
    /// batch still applies. Never panics, never returns an error.
    pub fn apply_patches_with_report(&mut self, patches: &[SheetPatch]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for patch in patches {
            let outcome = self.try_apply_patch(patch);
            if let Some(conflict) = outcome.conflict {
                report.conflicts.push(conflict);
                continue;
            }
            if outcome.applied {
                report.applied = report.applied.saturating_add(1);
            }
        }
        report
    }

    // -- metadata -----------------------------------------------------------

    /// Export the store's runtime metadata: versions (live and seeded),
    /// locks, and cumulative conflict stats.
    pub fn export_meta(&self) -> RuntimeMeta {
        let mut sheet_versions = BTreeMap::new();
        let mut row_versions = BTreeMap::new();

        for (sheet_id, table) in &self.tables {
            sheet_versions.insert(sheet_id.clone(), table.sheet_version);
            for (row_id, version) in &table.row_version_by_id {
                row_versions.insert(row_version_key(sheet_id, row_id), *version);
            }
        }
        for (sheet_id, version) in &self.seed_sheet_versions {
            sheet_versions.entry(sheet_id.clone()).or_insert(*version);
        }
        for (key, version) in &self.seed_row_versions {
            row_versions.entry(key.clone()).or_insert(*version);
        }

        let mut conflict_stats = self.conflict_stats.clone();
        conflict_stats.updated_at = now_millis();

        RuntimeMeta {
            sheet_versions,
            row_versions,
            row_locks: self.row_locks.clone(),
            cell_locks: self.cell_locks.clone(),
            conflict_stats,
        }
    }

    // -- internals ----------------------------------------------------------

    /// Make sure a sheet exists, seeding its versions from any runtime
    /// metadata the store was constructed with.
    fn ensure_sheet(&mut self, sheet_id: &str) {
        if self.tables.contains_key(sheet_id) {
            return;
        }
        let mut row_version_by_id = BTreeMap::new();
        let prefix = format!("{sheet_id}::");
        for (key, version) in &self.seed_row_versions {
            if let Some(row_id) = key.strip_prefix(&prefix) {
                row_version_by_id.insert(row_id.to_owned(), *version);
            }
        }
        self.tables.insert(
            sheet_id.to_owned(),
            TableState {
                key_field: default_key_field(sheet_id).to_owned(),
                rows: Vec::new(),
                index_by_id: BTreeMap::new(),
                row_version_by_id,
                sheet_version: self.seed_sheet_versions.get(sheet_id).copied().unwrap_or(0),
            },
        );
    }

    /// Merge a row in under an explicit identity and bump versions.
    fn upsert_with_id(&mut self, sheet_id: &str, row_id: &str, row: TableRow) -> TableRow {
        self.ensure_sheet(sheet_id);
        let merged = if let Some(table) = self.tables.get_mut(sheet_id) {
            let key_field = table.key_field.clone();
            if let Some(index) = table.index_by_id.get(row_id).copied() {
                if let Some(existing) = table.rows.get_mut(index) {
                    merge_row(existing, &row);
                    existing.clone()
                } else {
                    row
                }
            } else {
                let mut fresh = row;
                if !fresh.contains_key(&key_field) {
                    fresh.insert(key_field, serde_json::Value::String(row_id.to_owned()));
                }
                table.index_by_id.insert(row_id.to_owned(), table.rows.len());
                table.rows.push(fresh.clone());
                fresh
            }
        } else {
            row
        };
        self.bump_versions(sheet_id, row_id);
        merged
    }

    /// Bump the sheet and row version counters after a successful write.
    fn bump_versions(&mut self, sheet_id: &str, row_id: &str) {
        if let Some(table) = self.tables.get_mut(sheet_id) {
            table.sheet_version = table.sheet_version.saturating_add(1);
            let next = table
                .row_version_by_id
                .get(row_id)
                .copied()
                .unwrap_or(0)
                .saturating_add(1);
            table.row_version_by_id.insert(row_id.to_owned(), next);
            self.seed_sheet_versions
                .insert(sheet_id.to_owned(), table.sheet_version);
            self.seed_row_versions
                .insert(row_version_key(sheet_id, row_id), next);
        }
    }

    /// Walk the conflict ladder for one patch: sheet version, row version,
    /// row lock, cell lock. Returns the first conflict found.
    fn check_patch_conflict(&self, patch: &SheetPatch) -> Option<PatchConflict> {
        let sheet_version = self.sheet_version(&patch.sheet_id);
        if let Some(expected) = patch.expected_sheet_version {
            if expected != sheet_version {
                return Some(build_conflict(
                    patch,
                    ConflictReason::SheetVersionConflict,
                    format!("sheet version conflict: expected {expected}, actual {sheet_version}"),
                    Some(expected),
                    Some(sheet_version),
                    None,
                ));
            }
        }

        let row_version = self.row_version(&patch.sheet_id, &patch.row_id);
        if let Some(expected) = patch.expected_row_version {
            if expected != row_version {
                return Some(build_conflict(
                    patch,
                    ConflictReason::RowVersionConflict,
                    format!("row version conflict: expected {expected}, actual {row_version}"),
                    Some(expected),
                    Some(row_version),
                    None,
                ));
            }
        }

        let foreign_row_lock = self.row_locks.iter().find(|lock| {
            lock.sheet_id == patch.sheet_id
                && lock.row_id == patch.row_id
                && patch.lock_owner.as_deref() != Some(lock.owner.as_str())
        });
        if let Some(lock) = foreign_row_lock {
            return Some(build_conflict(
                patch,
                ConflictReason::RowLocked,
                format!("row locked by {}", lock.owner),
                None,
                None,
                None,
            ));
        }

        let foreign_cell_lock = self.cell_locks.iter().find(|lock| {
            if lock.sheet_id != patch.sheet_id || lock.row_id != patch.row_id {
                return false;
            }
            if patch.lock_owner.as_deref() == Some(lock.owner.as_str()) {
                return false;
            }
            if matches!(patch.op, PatchOp::Delete) {
                return true;
            }
            // An unscoped patch conflicts with any foreign cell lock;
            // a scoped one only when it touches the locked field.
            patch.changed_fields.is_empty() || patch.changed_fields.contains(&lock.field)
        });
        if let Some(lock) = foreign_cell_lock {
            return Some(build_conflict(
                patch,
                ConflictReason::CellLocked,
                format!("cell locked by {} ({})", lock.owner, lock.field),
                None,
                None,
                Some(lock.field.clone()),
            ));
        }

        None
    }
}

/// Assemble a conflict record for one rejected patch.
fn build_conflict(
    patch: &SheetPatch,
    reason: ConflictReason,
    message: String,
    expected: Option<u64>,
    actual: Option<u64>,
    field: Option<String>,
) -> PatchConflict {
    PatchConflict {
        sheet_id: patch.sheet_id.clone(),
        row_id: patch.row_id.clone(),
        reason,
        message,
        expected,
        actual,
        field,
    }
}

/// Current wall-clock time in epoch milliseconds.
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
