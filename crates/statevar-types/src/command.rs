//! Sheet-level write commands emitted by the writer.
//!
//! A [`SheetCommand`] is the multi-row unit the writer synthesizes from an
//! accepted event. Commands can be handed to the external command
//! executor, folded onto a snapshot during replay, or lowered to
//! row-level [`SheetPatch`](crate::patch::SheetPatch)es for the table
//! store.

use serde::{Deserialize, Serialize};

use crate::patch::SheetPatch;
use crate::sheets::read_row_id;
use crate::TableRow;

/// The source label stamped onto every command the writer emits.
pub const STATE_WRITER_SOURCE: &str = "ms:state-writer";

/// The payload of an upsert command: rows to merge into one sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertRowsPayload {
    /// The target sheet.
    pub sheet_id: String,
    /// The sheet's key field.
    pub key_field: String,
    /// The rows to merge, in order.
    pub rows: Vec<TableRow>,
}

/// The payload of a delete command: row identities to remove from one sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRowsPayload {
    /// The target sheet.
    pub sheet_id: String,
    /// The sheet's key field.
    pub key_field: String,
    /// The row identities to remove.
    pub row_ids: Vec<String>,
}

/// A sheet-level write command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "value")]
pub enum SheetCommand {
    /// Merge rows into a sheet.
    UpsertSheetRows(UpsertRowsPayload),
    /// Remove rows from a sheet.
    DeleteSheetRows(DeleteRowsPayload),
}

/// A [`SheetCommand`] paired with its optimistic-concurrency expectation
/// and origin label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterCommand {
    /// The sheet-level write.
    #[serde(flatten)]
    pub command: SheetCommand,
    /// Row version the originating event expected, passed through to the
    /// store's conflict check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_row_version: Option<u64>,
    /// Origin label (always [`STATE_WRITER_SOURCE`] for writer output).
    pub source: String,
}

impl WriterCommand {
    /// Build an upsert command with the writer's source label.
    pub fn upsert(
        sheet_id: impl Into<String>,
        key_field: impl Into<String>,
        rows: Vec<TableRow>,
    ) -> Self {
        Self {
            command: SheetCommand::UpsertSheetRows(UpsertRowsPayload {
                sheet_id: sheet_id.into(),
                key_field: key_field.into(),
                rows,
            }),
            expected_row_version: None,
            source: String::from(STATE_WRITER_SOURCE),
        }
    }

    /// Build a delete command with the writer's source label.
    pub fn delete(
        sheet_id: impl Into<String>,
        key_field: impl Into<String>,
        row_ids: Vec<String>,
    ) -> Self {
        Self {
            command: SheetCommand::DeleteSheetRows(DeleteRowsPayload {
                sheet_id: sheet_id.into(),
                key_field: key_field.into(),
                row_ids,
            }),
            expected_row_version: None,
            source: String::from(STATE_WRITER_SOURCE),
        }
    }

    /// Attach an expected row version to the command.
    #[must_use]
    pub const fn with_expected_row_version(mut self, version: Option<u64>) -> Self {
        self.expected_row_version = version;
        self
    }

    /// The sheet this command targets.
    pub fn sheet_id(&self) -> &str {
        match &self.command {
            SheetCommand::UpsertSheetRows(payload) => &payload.sheet_id,
            SheetCommand::DeleteSheetRows(payload) => &payload.sheet_id,
        }
    }

    /// Lower this command into row-level patches for the table store.
    ///
    /// Rows whose key field does not yield a usable identity are skipped:
    /// the store cannot address them. Upsert patches declare their touched
    /// fields so cell locks stay field-granular.
    pub fn to_patches(&self) -> Vec<SheetPatch> {
        match &self.command {
            SheetCommand::UpsertSheetRows(payload) => payload
                .rows
                .iter()
                .filter_map(|row| {
                    let row_id = read_row_id(row, &payload.key_field)?;
                    let changed: Vec<String> = row.keys().cloned().collect();
                    let mut patch = SheetPatch::upsert(payload.sheet_id.clone(), row_id, row.clone())
                        .with_changed_fields(changed);
                    patch.expected_row_version = self.expected_row_version;
                    Some(patch)
                })
                .collect(),
            SheetCommand::DeleteSheetRows(payload) => payload
                .row_ids
                .iter()
                .map(|row_id| {
                    let mut patch = SheetPatch::delete(payload.sheet_id.clone(), row_id.clone());
                    patch.expected_row_version = self.expected_row_version;
                    patch
                })
                .collect(),
        }
    }
}
