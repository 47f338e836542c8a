//! The baseline state snapshot the writer and replay operate on.
//!
//! The host supplies the snapshot (projected from its own game state);
//! the engine clones it before applying anything, so the caller's input
//! is never mutated in place. The snapshot bundles the read views the
//! domain rules need -- global fields, per-character resource rows, the
//! ordered inventory bag -- plus any persisted table rows and the store's
//! runtime metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canon::as_finite_number;
use crate::meta::RuntimeMeta;
use crate::sheets::fields;
use crate::TableRow;

/// A cloned, mutable view of the game state the engine writes against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Root global-state fields (scene, time, weather, coordinates, ...).
    #[serde(default)]
    pub globals: TableRow,
    /// Per-entity character resource rows, keyed by entity id.
    #[serde(default)]
    pub characters: BTreeMap<String, TableRow>,
    /// The ordered inventory bag. Order matters: legacy delete events may
    /// address items by index.
    #[serde(default)]
    pub bag: Vec<TableRow>,
    /// Persisted/projected sheet rows, keyed by sheet id.
    #[serde(default)]
    pub table_rows: BTreeMap<String, Vec<TableRow>>,
    /// Runtime concurrency metadata (versions, locks, conflict stats).
    #[serde(default)]
    pub meta: RuntimeMeta,
}

impl StateSnapshot {
    /// The rows held for one sheet, empty when the sheet is absent.
    pub fn sheet_rows(&self, sheet_id: &str) -> &[TableRow] {
        self.table_rows.get(sheet_id).map_or(&[], Vec::as_slice)
    }

    /// Read a numeric global field.
    ///
    /// The flat coordinate columns read through to the nested coordinate
    /// object when the flat column is absent.
    pub fn global_number(&self, field: &str) -> Option<f64> {
        if field == fields::WORLD_COORD_X {
            return self.coord_component("x");
        }
        if field == fields::WORLD_COORD_Y {
            return self.coord_component("y");
        }
        self.globals.get(field).and_then(as_finite_number)
    }

    /// Read a numeric field from one character's resource row.
    pub fn character_number(&self, entity_id: &str, field: &str) -> Option<f64> {
        self.characters
            .get(entity_id)
            .and_then(|row| row.get(field))
            .and_then(as_finite_number)
    }

    /// Find a bag item by its id (checking the id alias columns).
    pub fn bag_item(&self, item_id: &str) -> Option<&TableRow> {
        self.bag.iter().find(|item| {
            bag_item_id(item).as_deref() == Some(item_id)
        })
    }

    /// The bag item at a given list index.
    pub fn bag_item_at(&self, index: usize) -> Option<&TableRow> {
        self.bag.get(index)
    }

    /// Read one component of the nested world coordinate object, accepting
    /// the lower/upper/canonical spellings.
    fn coord_component(&self, axis: &str) -> Option<f64> {
        let coord = self.globals.get(fields::WORLD_COORD)?.as_object()?;
        let upper = axis.to_uppercase();
        let canonical = if axis == "x" {
            fields::WORLD_COORD_X
        } else {
            fields::WORLD_COORD_Y
        };
        coord
            .get(axis)
            .or_else(|| coord.get(&upper))
            .or_else(|| coord.get(canonical))
            .and_then(as_finite_number)
    }
}

/// Read an item's identity from the bag id alias columns.
pub fn bag_item_id(item: &TableRow) -> Option<String> {
    [fields::ITEM_ID, "id", "item_id"].iter().find_map(|alias| {
        item.get(*alias)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_owned)
    })
}
