//! Sheet identifiers, key fields, and domain write strategies.
//!
//! Sheets are named tables keyed by a declared key field. Only a small
//! allow-list of "pilot" sheets participates in event-sourced writes;
//! everything else is projection-only and never flows through the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TableRow;

// ---------------------------------------------------------------------------
// Sheet id constants
// ---------------------------------------------------------------------------

/// Well-known sheet identifier constants.
pub mod sheet_ids {
    /// The single-row global state sheet.
    pub const SYS_GLOBAL_STATE: &str = "SYS_GlobalState";
    /// Per-character resource rows.
    pub const CHARACTER_RESOURCES: &str = "CHARACTER_Resources";
    /// Item inventory rows.
    pub const ITEM_INVENTORY: &str = "ITEM_Inventory";
    /// Persisted state-variable event log (the replay source of truth).
    pub const SYS_STATE_VAR_EVENT_LOG: &str = "SYS_StateVarEventLog";
    /// Persisted per-event apply records.
    pub const SYS_STATE_VAR_APPLY_LOG: &str = "SYS_StateVarApplyLog";
    /// Narrative log summaries.
    pub const LOG_SUMMARY: &str = "LOG_Summary";
    /// NPC registry.
    pub const NPC_REGISTRY: &str = "NPC_Registry";
    /// Active quests.
    pub const QUEST_ACTIVE: &str = "QUEST_Active";
    /// Economy ledger entries.
    pub const ECON_LEDGER: &str = "ECON_Ledger";
    /// Mainline story beats.
    pub const STORY_MAINLINE: &str = "STORY_Mainline";
    /// Phone messages.
    pub const PHONE_MESSAGES: &str = "PHONE_Messages";
    /// Forum posts.
    pub const FORUM_POSTS: &str = "FORUM_Posts";
    /// Exploration map locations.
    pub const EXPLORATION_MAP_DATA: &str = "EXPLORATION_Map_Data";
}

/// Well-known column/field name constants shared across domain rules.
pub mod fields {
    /// Key field of the global state sheet.
    pub const GLOBAL_ID: &str = "_global_id";
    /// The fixed row id of the single global state row.
    pub const GLOBAL_ROW_ID: &str = "GLOBAL_STATE";
    /// Key field of the character resources sheet.
    pub const CHAR_ID: &str = "CHAR_ID";
    /// The default character entity.
    pub const PLAYER: &str = "PLAYER";
    /// The inventory sentinel entity.
    pub const INVENTORY_ENTITY: &str = "INVENTORY";
    /// Item id column (inventory key field).
    pub const ITEM_ID: &str = "物品ID";
    /// Item display name column.
    pub const ITEM_NAME: &str = "物品名称";
    /// Item quantity column.
    pub const QUANTITY: &str = "数量";
    /// Item quality column.
    pub const QUALITY: &str = "品质";
    /// Item rarity column (quality mirror).
    pub const RARITY: &str = "稀有度";
    /// Item category column.
    pub const CATEGORY: &str = "类别";
    /// Item type column (category mirror).
    pub const ITEM_TYPE: &str = "类型";
    /// Item description column.
    pub const DESCRIPTION: &str = "描述";
    /// Canonical scene column on the global sheet.
    pub const CURRENT_SCENE: &str = "当前场景";
    /// Legacy alias for [`CURRENT_SCENE`].
    pub const CURRENT_LOCATION: &str = "当前地点";
    /// Canonical weather column on the global sheet.
    pub const WEATHER_STATE: &str = "天气状况";
    /// Legacy alias for [`WEATHER_STATE`].
    pub const WEATHER: &str = "天气";
    /// The nested world coordinate object field.
    pub const WORLD_COORD: &str = "世界坐标";
    /// Flat world X coordinate column.
    pub const WORLD_COORD_X: &str = "世界坐标X";
    /// Flat world Y coordinate column.
    pub const WORLD_COORD_Y: &str = "世界坐标Y";
}

// ---------------------------------------------------------------------------
// Domain name constants
// ---------------------------------------------------------------------------

/// Logical domain name constants.
pub mod domains {
    /// Global scene/time/weather state.
    pub const GLOBAL_STATE: &str = "global_state";
    /// Per-character resources.
    pub const CHARACTER_RESOURCES: &str = "character_resources";
    /// Item inventory.
    pub const INVENTORY: &str = "inventory";
    /// Quests.
    pub const QUEST: &str = "quest";
    /// Story beats.
    pub const STORY: &str = "story";
    /// Phone messages.
    pub const PHONE: &str = "phone";
    /// Forum posts.
    pub const FORUM: &str = "forum";
    /// Exploration world data.
    pub const WORLD: &str = "world";
}

// ---------------------------------------------------------------------------
// Key fields and pilot allow-list
// ---------------------------------------------------------------------------

/// The pilot sheets that participate in event-sourced writes.
pub const PILOT_SHEETS: &[&str] = &[
    sheet_ids::SYS_GLOBAL_STATE,
    sheet_ids::CHARACTER_RESOURCES,
    sheet_ids::ITEM_INVENTORY,
];

/// Whether the given sheet is on the pilot allow-list.
pub fn is_pilot_sheet(sheet_id: &str) -> bool {
    PILOT_SHEETS.contains(&sheet_id)
}

/// The declared key field for a sheet, falling back to `id`.
pub fn default_key_field(sheet_id: &str) -> &'static str {
    match sheet_id {
        sheet_ids::SYS_GLOBAL_STATE => fields::GLOBAL_ID,
        sheet_ids::CHARACTER_RESOURCES => fields::CHAR_ID,
        sheet_ids::ITEM_INVENTORY => fields::ITEM_ID,
        sheet_ids::SYS_STATE_VAR_EVENT_LOG => "event_id",
        sheet_ids::SYS_STATE_VAR_APPLY_LOG => "apply_id",
        sheet_ids::LOG_SUMMARY => "编码索引",
        sheet_ids::NPC_REGISTRY => "NPC_ID",
        sheet_ids::QUEST_ACTIVE => "任务ID",
        sheet_ids::ECON_LEDGER => "ledger_id",
        sheet_ids::STORY_MAINLINE => "mainline_id",
        sheet_ids::PHONE_MESSAGES => "message_id",
        sheet_ids::FORUM_POSTS => "post_id",
        sheet_ids::EXPLORATION_MAP_DATA => "LocationName",
        _ => "id",
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Coerce a JSON value into a usable row identity.
///
/// Non-empty strings (trimmed) and finite numbers qualify; everything else
/// is "identity-less".
pub fn value_to_row_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

/// Read a row's identity from its key field.
pub fn read_row_id(row: &TableRow, key_field: &str) -> Option<String> {
    row.get(key_field).and_then(value_to_row_id)
}

/// Merge `incoming` into `base` field by field: incoming fields overwrite,
/// unspecified fields persist.
pub fn merge_row(base: &mut TableRow, incoming: &TableRow) {
    for (key, value) in incoming {
        base.insert(key.clone(), value.clone());
    }
}

// ---------------------------------------------------------------------------
// Domain targets and strategies
// ---------------------------------------------------------------------------

/// A normalized write target resolved by the domain mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVariableTarget {
    /// The logical domain.
    pub domain: String,
    /// The pilot sheet backing the domain.
    pub sheet_id: String,
    /// The logical entity within the domain.
    pub entity_id: String,
    /// The normalized path locator.
    pub path: String,
}

/// A config-driven write strategy for one generic pilot domain.
///
/// Resolved once at startup; the writer consults it to turn events for
/// domains without bespoke rules (quest, story, phone, forum, world) into
/// sheet commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainSpec {
    /// The domain name this strategy serves.
    pub domain: &'static str,
    /// The sheet all writes for the domain land on.
    pub sheet_id: &'static str,
    /// The sheet's key field.
    pub key_field: &'static str,
    /// Payload fields that may carry the row identity, in priority order.
    pub row_id_aliases: &'static [&'static str],
    /// Entity sentinel used when no alias resolves.
    pub default_entity_id: &'static str,
}

/// The built-in strategies for the generic pilot domains.
const GENERIC_DOMAIN_SPECS: &[DomainSpec] = &[
    DomainSpec {
        domain: domains::QUEST,
        sheet_id: sheet_ids::QUEST_ACTIVE,
        key_field: "任务ID",
        row_id_aliases: &["任务ID", "quest_id", "task_id", "id"],
        default_entity_id: "QUEST",
    },
    DomainSpec {
        domain: domains::STORY,
        sheet_id: sheet_ids::STORY_MAINLINE,
        key_field: "mainline_id",
        row_id_aliases: &["mainline_id", "story_id", "id"],
        default_entity_id: "MAINLINE",
    },
    DomainSpec {
        domain: domains::PHONE,
        sheet_id: sheet_ids::PHONE_MESSAGES,
        key_field: "message_id",
        row_id_aliases: &["message_id", "id"],
        default_entity_id: "PHONE",
    },
    DomainSpec {
        domain: domains::FORUM,
        sheet_id: sheet_ids::FORUM_POSTS,
        key_field: "post_id",
        row_id_aliases: &["post_id", "id"],
        default_entity_id: "FORUM",
    },
    DomainSpec {
        domain: domains::WORLD,
        sheet_id: sheet_ids::EXPLORATION_MAP_DATA,
        key_field: "LocationName",
        row_id_aliases: &["LocationName", "location_name", "地点名称", "id"],
        default_entity_id: "WORLD",
    },
];

/// Registry mapping generic domain names to their write strategies.
#[derive(Debug, Clone)]
pub struct DomainRegistry {
    specs: BTreeMap<&'static str, &'static DomainSpec>,
}

impl DomainRegistry {
    /// Build the standard registry covering quest, story, phone, forum,
    /// and world.
    pub fn standard() -> Self {
        let mut specs = BTreeMap::new();
        for spec in GENERIC_DOMAIN_SPECS {
            specs.insert(spec.domain, spec);
        }
        Self { specs }
    }

    /// Look up the strategy for a domain.
    pub fn get(&self, domain: &str) -> Option<&'static DomainSpec> {
        self.specs.get(domain).copied()
    }

    /// The registered domain names, in sorted order.
    pub fn domains(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.keys().copied()
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl DomainSpec {
    /// Resolve a row identity from a payload row via the alias list.
    pub fn resolve_row_id(&self, row: &TableRow) -> Option<String> {
        self.row_id_aliases
            .iter()
            .find_map(|alias| row.get(*alias).and_then(value_to_row_id))
    }
}
