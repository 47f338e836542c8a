//! The domain mapper: pure translation from legacy dotted paths and sheet
//! rows to normalized write targets.
//!
//! Both paths are side-effect-free and order-independent. A `None` result
//! means "not a pilot domain" -- the caller drops the event; it is not an
//! error.

use statevar_types::sheets::{domains, fields, is_pilot_sheet, sheet_ids, value_to_row_id};
use statevar_types::{StateVariableTarget, TableRow};

/// The root-level global state keys recognized by the legacy path mapper.
const GLOBAL_STATE_KEYS: &[&str] = &[
    "当前场景",
    "场景描述",
    "当前日期",
    "游戏时间",
    "上轮时间",
    "流逝时长",
    "世界坐标X",
    "世界坐标Y",
    "天气状况",
    "战斗模式",
    "当前回合",
    "系统通知",
    "当前地点",
];

/// The legacy root prefix stripped from incoming paths.
const ROOT_PREFIX: &str = "gameState.";

/// The character-object path prefix.
const CHARACTER_PREFIX: &str = "角色.";

/// The inventory-list path segment.
const BAG_SEGMENT: &str = "背包";

/// Normalize a raw locator: trim, strip the `gameState.` root prefix, and
/// rewrite `[N]` index brackets to `.N`.
pub fn normalize_game_state_path(raw: &str) -> String {
    let source = raw.trim();
    if source.is_empty() {
        return String::new();
    }
    let path = source.strip_prefix(ROOT_PREFIX).unwrap_or(source);
    rewrite_index_brackets(path)
}

/// Rewrite `name[3].field` into `name.3.field`. Non-numeric bracket
/// content is left untouched.
fn rewrite_index_brackets(path: &str) -> String {
    let mut output = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '[' {
            output.push(ch);
            continue;
        }
        let mut digits = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() {
                digits.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if !digits.is_empty() && chars.peek() == Some(&']') {
            chars.next();
            output.push('.');
            output.push_str(&digits);
        } else {
            output.push('[');
            output.push_str(&digits);
        }
    }
    output
}

/// Map a legacy dotted path to a pilot-domain write target.
///
/// Returns `None` when the path does not belong to a pilot domain.
pub fn map_legacy_path(raw: &str) -> Option<StateVariableTarget> {
    let path = normalize_game_state_path(raw);
    if path.is_empty() {
        return None;
    }
    let first_segment = path.split('.').next().unwrap_or_default();

    if GLOBAL_STATE_KEYS.contains(&first_segment) {
        return Some(StateVariableTarget {
            domain: domains::GLOBAL_STATE.to_owned(),
            sheet_id: sheet_ids::SYS_GLOBAL_STATE.to_owned(),
            entity_id: String::from("GLOBAL"),
            path: format!("{ROOT_PREFIX}{path}"),
        });
    }

    if path.starts_with(CHARACTER_PREFIX) {
        return Some(StateVariableTarget {
            domain: domains::CHARACTER_RESOURCES.to_owned(),
            sheet_id: sheet_ids::CHARACTER_RESOURCES.to_owned(),
            entity_id: fields::PLAYER.to_owned(),
            path: format!("{ROOT_PREFIX}{path}"),
        });
    }

    if path == BAG_SEGMENT || path.starts_with(&format!("{BAG_SEGMENT}.")) {
        return Some(StateVariableTarget {
            domain: domains::INVENTORY.to_owned(),
            sheet_id: sheet_ids::ITEM_INVENTORY.to_owned(),
            entity_id: fields::INVENTORY_ENTITY.to_owned(),
            path: format!("{ROOT_PREFIX}{path}"),
        });
    }

    None
}

/// Resolve a row field through an alias list into an entity id, with a
/// fixed sentinel fallback.
fn to_entity_id(row: &TableRow, aliases: &[&str], fallback: &str) -> String {
    aliases
        .iter()
        .find_map(|alias| row.get(*alias).and_then(value_to_row_id))
        .unwrap_or_else(|| fallback.to_owned())
}

/// Map a sheet row to a pilot-domain write target.
///
/// Only the pilot allow-list participates; other sheets return `None` and
/// stay projection-only.
pub fn map_sheet_row(sheet_id: &str, row: &TableRow) -> Option<StateVariableTarget> {
    if !is_pilot_sheet(sheet_id) {
        return None;
    }

    if sheet_id == sheet_ids::SYS_GLOBAL_STATE {
        let global_id = to_entity_id(row, &[fields::GLOBAL_ID, "id"], fields::GLOBAL_ROW_ID);
        return Some(StateVariableTarget {
            domain: domains::GLOBAL_STATE.to_owned(),
            sheet_id: sheet_id.to_owned(),
            entity_id: global_id.clone(),
            path: format!("sheet.{sheet_id}.{global_id}"),
        });
    }

    if sheet_id == sheet_ids::CHARACTER_RESOURCES {
        let char_id = to_entity_id(row, &[fields::CHAR_ID, "char_id", "id"], fields::PLAYER);
        return Some(StateVariableTarget {
            domain: domains::CHARACTER_RESOURCES.to_owned(),
            sheet_id: sheet_id.to_owned(),
            entity_id: char_id.clone(),
            path: format!("sheet.{sheet_id}.{char_id}"),
        });
    }

    let item_id = to_entity_id(
        row,
        &[fields::ITEM_ID, "item_id", "id", fields::ITEM_NAME],
        fields::INVENTORY_ENTITY,
    );
    Some(StateVariableTarget {
        domain: domains::INVENTORY.to_owned(),
        sheet_id: sheet_id.to_owned(),
        entity_id: item_id.clone(),
        path: format!("sheet.{sheet_id}.{item_id}"),
    })
}
