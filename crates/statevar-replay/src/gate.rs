//! The replay gate: threshold configuration and the pass/warn/fail
//! verdict.

use serde::{Deserialize, Serialize};

use crate::diff::DiffResult;

const fn default_warn_threshold() -> u64 {
    1
}

const fn default_fail_threshold() -> u64 {
    3
}

const fn default_changed_cells_fail() -> u64 {
    5
}

/// Warn/fail thresholds for the replay gate.
///
/// Loadable from the host's config file; every field has a default so a
/// partial table works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateThresholds {
    /// Invalid event-log rows that degrade the verdict to warn.
    #[serde(default = "default_warn_threshold")]
    pub invalid_rows_warn: u64,
    /// Invalid event-log rows that fail the gate.
    #[serde(default = "default_fail_threshold")]
    pub invalid_rows_fail: u64,
    /// Missing rows (both directions summed) that degrade to warn.
    #[serde(default = "default_warn_threshold")]
    pub missing_rows_warn: u64,
    /// Missing rows that fail the gate.
    #[serde(default = "default_fail_threshold")]
    pub missing_rows_fail: u64,
    /// Changed rows that degrade to warn.
    #[serde(default = "default_warn_threshold")]
    pub changed_rows_warn: u64,
    /// Changed rows that fail the gate.
    #[serde(default = "default_fail_threshold")]
    pub changed_rows_fail: u64,
    /// Changed cells that degrade to warn.
    #[serde(default = "default_warn_threshold")]
    pub changed_cells_warn: u64,
    /// Changed cells that fail the gate.
    #[serde(default = "default_changed_cells_fail")]
    pub changed_cells_fail: u64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            invalid_rows_warn: default_warn_threshold(),
            invalid_rows_fail: default_fail_threshold(),
            missing_rows_warn: default_warn_threshold(),
            missing_rows_fail: default_fail_threshold(),
            changed_rows_warn: default_warn_threshold(),
            changed_rows_fail: default_fail_threshold(),
            changed_cells_warn: default_warn_threshold(),
            changed_cells_fail: default_changed_cells_fail(),
        }
    }
}

/// The gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    /// Replay reproduced the live snapshot within thresholds.
    Pass,
    /// Drift observed, below the failure thresholds.
    Warn,
    /// Drift crossed a failure threshold.
    Fail,
}

impl GateStatus {
    /// The wire spelling of this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

/// The gate's verdict with the reasons that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    /// The verdict.
    pub status: GateStatus,
    /// The crossed thresholds, in evaluation order.
    pub reasons: Vec<String>,
    /// The thresholds the verdict was computed against.
    pub thresholds: GateThresholds,
}

/// Check one metric against its warn/fail pair, escalating the status and
/// recording the crossed threshold.
fn check_metric(
    label: &str,
    value: u64,
    warn: u64,
    fail: u64,
    status: &mut GateStatus,
    reasons: &mut Vec<String>,
) {
    if value >= fail {
        reasons.push(format!("{label}>={fail}"));
        *status = GateStatus::Fail;
    } else if value >= warn && *status != GateStatus::Fail {
        reasons.push(format!("{label}>={warn}"));
        if *status == GateStatus::Pass {
            *status = GateStatus::Warn;
        }
    }
}

/// Reduce a diff plus the invalid-row count into a gate verdict.
///
/// If no threshold triggers but the diff is not matched, the verdict
/// degrades to warn with reason `diff-not-matched`, so silent drift is
/// never reported as a pass.
pub fn evaluate_replay_gate(
    diff: &DiffResult,
    invalid_rows: u64,
    thresholds: GateThresholds,
) -> GateResult {
    let missing_rows = diff
        .totals
        .missing_in_replay
        .saturating_add(diff.totals.missing_in_baseline);
    let mut status = GateStatus::Pass;
    let mut reasons = Vec::new();

    check_metric(
        "invalidRows",
        invalid_rows,
        thresholds.invalid_rows_warn,
        thresholds.invalid_rows_fail,
        &mut status,
        &mut reasons,
    );
    check_metric(
        "missingRows",
        missing_rows,
        thresholds.missing_rows_warn,
        thresholds.missing_rows_fail,
        &mut status,
        &mut reasons,
    );
    check_metric(
        "changedRows",
        diff.totals.changed_rows,
        thresholds.changed_rows_warn,
        thresholds.changed_rows_fail,
        &mut status,
        &mut reasons,
    );
    check_metric(
        "changedCells",
        diff.totals.changed_cells,
        thresholds.changed_cells_warn,
        thresholds.changed_cells_fail,
        &mut status,
        &mut reasons,
    );

    if !diff.matched && reasons.is_empty() {
        reasons.push(String::from("diff-not-matched"));
        status = GateStatus::Warn;
    }

    GateResult {
        status,
        reasons,
        thresholds,
    }
}
