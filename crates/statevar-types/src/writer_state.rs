//! Writer-owned state: the idempotency ledger and runtime metrics.
//!
//! The writer owns this state explicitly and returns it alongside the
//! snapshot it produces; it is never attached to the snapshot object
//! itself. Conflict stats accumulate across calls and are never reset
//! implicitly.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::meta::ConflictStats;

/// The closed set of reasons the writer skips an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The input failed event-model validation.
    InvalidEvent,
    /// The event's idempotency key was already in the ledger.
    DuplicateIdempotency,
    /// The event's optimistic version expectation was behind the row.
    StaleEvent,
    /// No domain rule produced a command -- a normal, non-error outcome.
    NoCommand,
}

impl SkipReason {
    /// The wire spelling of this reason.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidEvent => "invalid_event",
            Self::DuplicateIdempotency => "duplicate_idempotency",
            Self::StaleEvent => "stale_event",
            Self::NoCommand => "no_command",
        }
    }
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-reason skip counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounters {
    /// Events skipped as duplicates.
    pub duplicate_idempotency: u64,
    /// Events skipped as schema-invalid.
    pub invalid_event: u64,
    /// Events that produced no command.
    pub no_command: u64,
    /// Events rejected by the optimistic staleness check.
    pub stale_event: u64,
}

impl SkipCounters {
    /// Record one skip for the given reason.
    pub fn bump(&mut self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::DuplicateIdempotency => &mut self.duplicate_idempotency,
            SkipReason::InvalidEvent => &mut self.invalid_event,
            SkipReason::NoCommand => &mut self.no_command,
            SkipReason::StaleEvent => &mut self.stale_event,
        };
        *counter = counter.saturating_add(1);
    }

    /// Total skips across all reasons.
    pub const fn total(&self) -> u64 {
        self.duplicate_idempotency
            .saturating_add(self.invalid_event)
            .saturating_add(self.no_command)
            .saturating_add(self.stale_event)
    }
}

/// Runtime metrics describing the writer's most recent consumption pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterMetrics {
    /// Events accepted but not yet applied (always zero after a
    /// synchronous consumption pass).
    pub backlog: u64,
    /// Automatic retries performed (this layer never retries; external
    /// drivers may).
    pub retry_count: u64,
    /// Skips per domain, including the `invalid` pseudo-domain for events
    /// that never normalized.
    pub failed_by_domain: BTreeMap<String, u64>,
    /// Skips per reason.
    pub skip_by_reason: SkipCounters,
    /// Events accepted this pass.
    pub accepted_count: u64,
    /// Events skipped this pass.
    pub skipped_count: u64,
    /// Sheet commands synthesized this pass.
    pub command_count: u64,
    /// Audit commands synthesized this pass.
    pub audit_command_count: u64,
    /// Last update stamp, epoch milliseconds.
    pub updated_at: i64,
}

impl WriterMetrics {
    /// Record one skip against a domain.
    pub fn bump_failed_domain(&mut self, domain: &str) {
        let key = {
            let trimmed = domain.trim();
            if trimmed.is_empty() {
                "unknown"
            } else {
                trimmed
            }
        };
        let counter = self.failed_by_domain.entry(key.to_owned()).or_insert(0);
        *counter = counter.saturating_add(1);
    }
}

/// The writer's durable state: idempotency ledger, metrics, conflict
/// stats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterState {
    /// Idempotency keys of every event ever accepted.
    pub idempotency_keys: BTreeSet<String>,
    /// Metrics from the most recent consumption pass.
    pub metrics: WriterMetrics,
    /// Conflict stats accumulated across all passes.
    pub conflict_stats: ConflictStats,
}
