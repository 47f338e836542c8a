//! Row-identity indexing and cell-level snapshot diffing.
//!
//! Rows are identified by the sheet's key field. Rows without a usable
//! key value are still counted (as a quality signal) but receive a
//! synthetic per-index identity so they never collide; duplicate key
//! values index only their first occurrence. Structural noise -- missing
//! keys, duplicates, row reordering -- is reported separately and never
//! affects `matched`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use statevar_types::canon::stable_stringify;
use statevar_types::sheets::{default_key_field, value_to_row_id, PILOT_SHEETS};
use statevar_types::TableRow;

/// One sheet's rows plus the key field they are identified by.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffSheetSnapshot {
    /// The key field identifying rows in this sheet.
    pub key_field: String,
    /// The rows, in their stored order.
    pub rows: Vec<TableRow>,
}

/// A pilot-sheet snapshot: sheet id to rows.
pub type DiffSnapshot = BTreeMap<String, DiffSheetSnapshot>;

/// Structural noise observed while diffing one sheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetDiffNoise {
    /// Baseline rows whose key field was empty or absent.
    pub missing_key_field_rows_baseline: u64,
    /// Replay rows whose key field was empty or absent.
    pub missing_key_field_rows_replay: u64,
    /// Baseline rows whose key duplicated an earlier row.
    pub duplicate_key_rows_baseline: u64,
    /// Replay rows whose key duplicated an earlier row.
    pub duplicate_key_rows_replay: u64,
    /// Whether the shared rows appear in a different order.
    pub row_order_changed: bool,
}

/// The diff summary for one pilot sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetDiffSummary {
    /// The sheet diffed.
    pub sheet_id: String,
    /// The key field used for row identity.
    pub key_field: String,
    /// Baseline row count.
    pub baseline_rows: usize,
    /// Replay row count.
    pub replay_rows: usize,
    /// Rows present in the baseline but absent from the replay.
    pub missing_in_replay: u64,
    /// Rows present in the replay but absent from the baseline.
    pub missing_in_baseline: u64,
    /// Rows present in both with at least one differing cell.
    pub changed_rows: u64,
    /// Total differing cells across shared rows.
    pub changed_cells: u64,
    /// Structural noise (diagnostic only).
    pub noise: SheetDiffNoise,
}

/// Totals across all pilot sheets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffTotals {
    /// Rows missing from the replay.
    pub missing_in_replay: u64,
    /// Rows missing from the baseline.
    pub missing_in_baseline: u64,
    /// Rows with differing cells.
    pub changed_rows: u64,
    /// Differing cells.
    pub changed_cells: u64,
}

/// Noise totals across all pilot sheets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseTotals {
    /// Rows with missing key fields, both sides.
    pub missing_key_field_rows: u64,
    /// Rows with duplicate keys, both sides.
    pub duplicate_key_rows: u64,
    /// Sheets whose shared-row order differs.
    pub row_order_changes: u64,
}

/// The outcome of diffing two pilot-sheet snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    /// True iff all four totals are zero. Noise does not affect this.
    pub matched: bool,
    /// Per-sheet summaries, in pilot-sheet order.
    pub sheet_summaries: Vec<SheetDiffSummary>,
    /// Totals across sheets.
    pub totals: DiffTotals,
    /// Noise totals across sheets.
    pub noise_totals: NoiseTotals,
}

/// One side's indexed rows.
struct RowStats<'a> {
    by_id: BTreeMap<String, &'a TableRow>,
    order: Vec<String>,
    missing_key_field_rows: u64,
    duplicate_key_rows: u64,
}

/// Index one side's rows by identity, tracking key-quality noise.
fn build_row_stats<'a>(rows: &'a [TableRow], key_field: &str) -> RowStats<'a> {
    let mut by_id: BTreeMap<String, &TableRow> = BTreeMap::new();
    let mut order = Vec::with_capacity(rows.len());
    let mut missing_key_field_rows: u64 = 0;
    let mut duplicate_key_rows: u64 = 0;

    for (index, row) in rows.iter().enumerate() {
        let row_id = row.get(key_field).and_then(value_to_row_id).unwrap_or_else(|| {
            missing_key_field_rows = missing_key_field_rows.saturating_add(1);
            format!("__missing_id_{}", index.saturating_add(1))
        });
        order.push(row_id.clone());
        if by_id.contains_key(&row_id) {
            duplicate_key_rows = duplicate_key_rows.saturating_add(1);
            continue;
        }
        by_id.insert(row_id, row);
    }

    RowStats {
        by_id,
        order,
        missing_key_field_rows,
        duplicate_key_rows,
    }
}

/// Whether the rows shared by both sides appear in a different order.
///
/// Compares the order of the id intersection only, so added/removed rows
/// do not register as reordering.
fn is_row_order_changed(baseline_order: &[String], replay_order: &[String]) -> bool {
    let baseline_set: BTreeSet<&String> = baseline_order.iter().collect();
    let replay_set: BTreeSet<&String> = replay_order.iter().collect();
    let baseline_filtered: Vec<&String> = baseline_order
        .iter()
        .filter(|id| replay_set.contains(id))
        .collect();
    let replay_filtered: Vec<&String> = replay_order
        .iter()
        .filter(|id| baseline_set.contains(id))
        .collect();
    if baseline_filtered.len() <= 1 || replay_filtered.len() <= 1 {
        return false;
    }
    baseline_filtered != replay_filtered
}

/// Diff two pilot-sheet snapshots at row/cell granularity.
pub fn diff_snapshots(baseline: &DiffSnapshot, replay: &DiffSnapshot) -> DiffResult {
    let mut sheet_summaries = Vec::with_capacity(PILOT_SHEETS.len());
    let mut totals = DiffTotals::default();
    let mut noise_totals = NoiseTotals::default();

    for sheet_id in PILOT_SHEETS {
        let baseline_sheet = baseline.get(*sheet_id);
        let replay_sheet = replay.get(*sheet_id);
        let key_field = baseline_sheet
            .map(|sheet| sheet.key_field.trim())
            .filter(|field| !field.is_empty())
            .or_else(|| {
                replay_sheet
                    .map(|sheet| sheet.key_field.trim())
                    .filter(|field| !field.is_empty())
            })
            .unwrap_or_else(|| default_key_field(sheet_id))
            .to_owned();

        let empty: Vec<TableRow> = Vec::new();
        let baseline_rows = baseline_sheet.map_or(&empty, |sheet| &sheet.rows);
        let replay_rows = replay_sheet.map_or(&empty, |sheet| &sheet.rows);
        let baseline_stats = build_row_stats(baseline_rows, &key_field);
        let replay_stats = build_row_stats(replay_rows, &key_field);

        let mut row_ids: BTreeSet<&String> = baseline_stats.by_id.keys().collect();
        row_ids.extend(replay_stats.by_id.keys());

        let mut missing_in_replay: u64 = 0;
        let mut missing_in_baseline: u64 = 0;
        let mut changed_rows: u64 = 0;
        let mut changed_cells: u64 = 0;

        for row_id in row_ids {
            let base_row = baseline_stats.by_id.get(row_id);
            let replay_row = replay_stats.by_id.get(row_id);
            let (Some(base_row), Some(replay_row)) = (base_row, replay_row) else {
                if base_row.is_none() {
                    missing_in_baseline = missing_in_baseline.saturating_add(1);
                } else {
                    missing_in_replay = missing_in_replay.saturating_add(1);
                }
                continue;
            };

            let mut fields: BTreeSet<&String> = base_row.keys().collect();
            fields.extend(replay_row.keys());
            let mut row_changed = false;
            for field in fields {
                let cells_equal = match (base_row.get(field), replay_row.get(field)) {
                    (Some(left), Some(right)) => {
                        stable_stringify(left) == stable_stringify(right)
                    }
                    (None, None) => true,
                    _ => false,
                };
                if !cells_equal {
                    row_changed = true;
                    changed_cells = changed_cells.saturating_add(1);
                }
            }
            if row_changed {
                changed_rows = changed_rows.saturating_add(1);
            }
        }

        let noise = SheetDiffNoise {
            missing_key_field_rows_baseline: baseline_stats.missing_key_field_rows,
            missing_key_field_rows_replay: replay_stats.missing_key_field_rows,
            duplicate_key_rows_baseline: baseline_stats.duplicate_key_rows,
            duplicate_key_rows_replay: replay_stats.duplicate_key_rows,
            row_order_changed: is_row_order_changed(&baseline_stats.order, &replay_stats.order),
        };

        totals.missing_in_replay = totals.missing_in_replay.saturating_add(missing_in_replay);
        totals.missing_in_baseline = totals.missing_in_baseline.saturating_add(missing_in_baseline);
        totals.changed_rows = totals.changed_rows.saturating_add(changed_rows);
        totals.changed_cells = totals.changed_cells.saturating_add(changed_cells);
        noise_totals.missing_key_field_rows = noise_totals
            .missing_key_field_rows
            .saturating_add(noise.missing_key_field_rows_baseline)
            .saturating_add(noise.missing_key_field_rows_replay);
        noise_totals.duplicate_key_rows = noise_totals
            .duplicate_key_rows
            .saturating_add(noise.duplicate_key_rows_baseline)
            .saturating_add(noise.duplicate_key_rows_replay);
        if noise.row_order_changed {
            noise_totals.row_order_changes = noise_totals.row_order_changes.saturating_add(1);
        }

        sheet_summaries.push(SheetDiffSummary {
            sheet_id: (*sheet_id).to_owned(),
            key_field,
            baseline_rows: baseline_rows.len(),
            replay_rows: replay_rows.len(),
            missing_in_replay,
            missing_in_baseline,
            changed_rows,
            changed_cells,
            noise,
        });
    }

    DiffResult {
        matched: totals.missing_in_replay == 0
            && totals.missing_in_baseline == 0
            && totals.changed_rows == 0
            && totals.changed_cells == 0,
        sheet_summaries,
        totals,
        noise_totals,
    }
}
