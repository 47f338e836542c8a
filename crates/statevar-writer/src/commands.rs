//! Per-domain command synthesis: turning accepted events into sheet
//! commands.
//!
//! Three domains have bespoke rules (global state, character resources,
//! inventory); the remaining pilot domains go through the config-driven
//! [`DomainRegistry`]. An event that no rule can translate produces zero
//! commands -- a normal, non-error outcome the writer counts as
//! `no_command`.

use serde_json::Value;

use statevar_types::canon::{as_finite_number, number_value};
use statevar_types::sheets::{domains, fields, sheet_ids, value_to_row_id};
use statevar_types::snapshot::bag_item_id;
use statevar_types::{
    DomainRegistry, DomainSpec, EventOp, StateSnapshot, StateVariableEvent, TableRow,
    WriterCommand,
};

use crate::mapping::normalize_game_state_path;
use crate::quality::normalize_quality_label;

// ---------------------------------------------------------------------------
// Path -> field resolution
// ---------------------------------------------------------------------------

/// Resolve the sheet column a legacy path addresses.
///
/// `角色.<field>` and `背包.<index>.<field>` peel their prefixes; the
/// nested coordinate spellings and the legacy scene/weather aliases map to
/// their canonical columns.
pub fn resolve_field_from_path(path: &str) -> String {
    let normalized = normalize_game_state_path(path);
    let parts: Vec<&str> = normalized.split('.').filter(|part| !part.is_empty()).collect();
    let Some(first) = parts.first().copied() else {
        return String::new();
    };

    if first == "角色" && parts.len() >= 2 {
        return parts.get(1).copied().unwrap_or_default().to_owned();
    }
    if first == "背包" && parts.len() >= 3 {
        return parts.get(2).copied().unwrap_or_default().to_owned();
    }
    if first == fields::WORLD_COORD && parts.len() >= 2 {
        match parts.get(1).copied() {
            Some("x") => return fields::WORLD_COORD_X.to_owned(),
            Some("y") => return fields::WORLD_COORD_Y.to_owned(),
            _ => {}
        }
    }

    let tail = parts.last().copied().unwrap_or_default();
    match tail {
        fields::CURRENT_LOCATION => fields::CURRENT_SCENE.to_owned(),
        fields::WEATHER => fields::WEATHER_STATE.to_owned(),
        other => other.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Global state helpers
// ---------------------------------------------------------------------------

/// Read one coordinate component from a payload object, accepting the
/// lower, upper, and canonical column spellings.
fn coord_component(coord: &TableRow, axis: &str) -> Option<f64> {
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

/// Canonicalize a global-state upsert payload: legacy scene/weather
/// aliases fold into their canonical columns, and a nested coordinate
/// object flattens to the rounded X/Y columns.
fn normalize_global_payload(payload: &TableRow) -> TableRow {
    let mut next = payload.clone();

    if next.contains_key(fields::CURRENT_LOCATION) && !next.contains_key(fields::CURRENT_SCENE) {
        if let Some(value) = next.get(fields::CURRENT_LOCATION).cloned() {
            next.insert(fields::CURRENT_SCENE.to_owned(), value);
        }
    }
    if next.contains_key(fields::WEATHER) && !next.contains_key(fields::WEATHER_STATE) {
        if let Some(value) = next.get(fields::WEATHER).cloned() {
            next.insert(fields::WEATHER_STATE.to_owned(), value);
        }
    }

    if let Some(Value::Object(coord)) = next.get(fields::WORLD_COORD).cloned() {
        if let Some(x) = coord_component(&coord, "x") {
            if !next.contains_key(fields::WORLD_COORD_X) {
                next.insert(fields::WORLD_COORD_X.to_owned(), number_value(x.round()));
            }
        }
        if let Some(y) = coord_component(&coord, "y") {
            if !next.contains_key(fields::WORLD_COORD_Y) {
                next.insert(fields::WORLD_COORD_Y.to_owned(), number_value(y.round()));
            }
        }
    }

    next.remove(fields::CURRENT_LOCATION);
    next.remove(fields::WEATHER);
    next.remove(fields::WORLD_COORD);
    next
}

/// The event payload as an object, when it is one.
fn payload_object(event: &StateVariableEvent) -> Option<&TableRow> {
    event.value.as_ref().and_then(Value::as_object)
}

// ---------------------------------------------------------------------------
// Inventory helpers
// ---------------------------------------------------------------------------

/// Item id aliases accepted on inventory payloads.
const ITEM_ID_ALIASES: &[&str] = &[fields::ITEM_ID, "id", "item_id"];

/// Read an item id from a payload object through the alias list.
fn object_item_id(map: &TableRow) -> Option<String> {
    ITEM_ID_ALIASES
        .iter()
        .find_map(|alias| map.get(*alias).and_then(value_to_row_id))
}

/// Read the first non-empty string among alias fields.
fn first_string(map: &TableRow, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|alias| {
        map.get(*alias)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_owned)
    })
}

/// Normalize one raw payload item into an inventory row.
///
/// Items with neither an id nor a name are unusable and dropped. Quality
/// labels canonicalize into both the quality and rarity columns; the
/// category mirrors into the type column. Generated item ids derive from
/// the event timestamp so replays stay deterministic.
fn to_inventory_row(item: &TableRow, index: usize, stamp: i64) -> Option<TableRow> {
    let item_id = object_item_id(item);
    let item_name = first_string(item, &[fields::ITEM_NAME, "名称", "name"]);
    if item_id.is_none() && item_name.is_none() {
        return None;
    }

    let quality = first_string(
        item,
        &[fields::QUALITY, fields::RARITY, "quality", "rarity", "rank", "tier"],
    )
    .map(|raw| normalize_quality_label(&raw));
    let category = first_string(item, &[fields::CATEGORY, fields::ITEM_TYPE, "type"])
        .unwrap_or_default();
    let quantity = item
        .get(fields::QUANTITY)
        .or_else(|| item.get("count"))
        .and_then(as_finite_number)
        .map_or_else(|| Value::from(1), number_value);
    let description = first_string(item, &[fields::DESCRIPTION, "description"]).unwrap_or_default();

    let resolved_id = item_id
        .clone()
        .unwrap_or_else(|| format!("item_{stamp}_{}", index.saturating_add(1)));
    let resolved_name = item_name.or(item_id).unwrap_or_else(|| resolved_id.clone());

    let mut row = item.clone();
    row.insert(fields::ITEM_ID.to_owned(), Value::String(resolved_id));
    row.insert(fields::ITEM_NAME.to_owned(), Value::String(resolved_name));
    row.insert(fields::QUANTITY.to_owned(), quantity);
    row.insert(fields::CATEGORY.to_owned(), Value::String(category.clone()));
    if category.is_empty() {
        row.remove(fields::ITEM_TYPE);
    } else {
        row.insert(fields::ITEM_TYPE.to_owned(), Value::String(category));
    }
    row.insert(fields::DESCRIPTION.to_owned(), Value::String(description));
    match quality {
        Some(label) => {
            row.insert(fields::QUALITY.to_owned(), Value::String(label.to_owned()));
            row.insert(fields::RARITY.to_owned(), Value::String(label.to_owned()));
        }
        None => {
            row.remove(fields::QUALITY);
            row.remove(fields::RARITY);
        }
    }
    Some(row)
}

/// Resolve the bag rows a delete event addresses: an explicit id in the
/// payload, or an index lookup into the pre-event bag.
fn resolve_inventory_delete_row_ids(
    event: &StateVariableEvent,
    snapshot: &StateSnapshot,
) -> Vec<String> {
    let direct = event.value.as_ref().and_then(|value| match value {
        Value::Object(map) => object_item_id(map),
        other => value_to_row_id(other),
    });
    if let Some(row_id) = direct {
        return vec![row_id];
    }

    let Some(index) = bag_index_from_path(&event.path) else {
        return Vec::new();
    };
    snapshot
        .bag_item_at(index)
        .and_then(bag_item_id)
        .map_or_else(Vec::new, |row_id| vec![row_id])
}

/// Extract the bag index addressed by a path like `背包[2]` or `背包.2`.
fn bag_index_from_path(path: &str) -> Option<usize> {
    let normalized = normalize_game_state_path(path);
    let mut parts = normalized.split('.');
    while let Some(part) = parts.next() {
        if part == "背包" {
            return parts.next().and_then(|segment| segment.parse::<usize>().ok());
        }
    }
    None
}

/// Resolve the row an inventory event targets for version tracking.
fn resolve_inventory_row_id(event: &StateVariableEvent, snapshot: &StateSnapshot) -> Option<String> {
    if event.op == EventOp::Delete {
        return resolve_inventory_delete_row_ids(event, snapshot).into_iter().next();
    }
    payload_object(event).and_then(object_item_id)
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

/// Resolve the `(sheet, row)` pair an event's optimistic version
/// expectation applies to.
pub fn resolve_version_target(
    event: &StateVariableEvent,
    snapshot: &StateSnapshot,
    registry: &DomainRegistry,
) -> Option<(String, String)> {
    match event.domain.as_str() {
        domains::GLOBAL_STATE => Some((
            sheet_ids::SYS_GLOBAL_STATE.to_owned(),
            fields::GLOBAL_ROW_ID.to_owned(),
        )),
        domains::CHARACTER_RESOURCES => {
            let entity = if event.entity_id.is_empty() {
                fields::PLAYER.to_owned()
            } else {
                event.entity_id.clone()
            };
            Some((sheet_ids::CHARACTER_RESOURCES.to_owned(), entity))
        }
        domains::INVENTORY => resolve_inventory_row_id(event, snapshot)
            .map(|row_id| (sheet_ids::ITEM_INVENTORY.to_owned(), row_id)),
        other => {
            let spec = registry.get(other)?;
            let row_id = generic_row_id(event, spec);
            Some((spec.sheet_id.to_owned(), row_id))
        }
    }
}

/// Whether an event's optimistic version expectation is behind the row it
/// targets.
pub fn is_stale_event(
    event: &StateVariableEvent,
    snapshot: &StateSnapshot,
    registry: &DomainRegistry,
) -> bool {
    let Some(expected) = event.expected_version else {
        return false;
    };
    let Some((sheet_id, row_id)) = resolve_version_target(event, snapshot, registry) else {
        return false;
    };
    snapshot.meta.row_version(&sheet_id, &row_id) > expected
}

// ---------------------------------------------------------------------------
// Generic domains
// ---------------------------------------------------------------------------

/// Resolve the row identity a generic-domain event addresses: payload
/// aliases first, then the event entity, then the domain sentinel.
fn generic_row_id(event: &StateVariableEvent, spec: &DomainSpec) -> String {
    let from_value = event.value.as_ref().and_then(|value| match value {
        Value::Object(map) => spec.resolve_row_id(map),
        other => value_to_row_id(other),
    });
    from_value.unwrap_or_else(|| {
        if event.entity_id.is_empty() || event.entity_id == "entity" {
            spec.default_entity_id.to_owned()
        } else {
            event.entity_id.clone()
        }
    })
}

/// The registry-driven rule for generic pilot domains.
fn build_generic_commands(event: &StateVariableEvent, spec: &DomainSpec) -> Vec<WriterCommand> {
    match event.op {
        EventOp::Delete => {
            let row_id = event.value.as_ref().and_then(|value| match value {
                Value::Object(map) => spec.resolve_row_id(map),
                other => value_to_row_id(other),
            });
            row_id.map_or_else(Vec::new, |row_id| {
                vec![WriterCommand::delete(spec.sheet_id, spec.key_field, vec![row_id])]
            })
        }
        EventOp::Add => Vec::new(),
        EventOp::Set | EventOp::Push | EventOp::Upsert => {
            let items: Vec<&TableRow> = match event.value.as_ref() {
                Some(Value::Array(list)) => list.iter().filter_map(Value::as_object).collect(),
                Some(Value::Object(map)) => vec![map],
                _ => Vec::new(),
            };
            let rows: Vec<TableRow> = items
                .into_iter()
                .map(|item| {
                    let mut row = item.clone();
                    if !row.contains_key(spec.key_field) {
                        row.insert(
                            spec.key_field.to_owned(),
                            Value::String(generic_row_id(event, spec)),
                        );
                    }
                    row
                })
                .collect();
            if rows.is_empty() {
                Vec::new()
            } else {
                vec![WriterCommand::upsert(spec.sheet_id, spec.key_field, rows)]
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bespoke domains
// ---------------------------------------------------------------------------

/// The global-state rule.
fn build_global_state_commands(
    event: &StateVariableEvent,
    snapshot: &StateSnapshot,
) -> Vec<WriterCommand> {
    if event.op == EventOp::Upsert {
        let Some(payload) = payload_object(event) else {
            return Vec::new();
        };
        let normalized = normalize_global_payload(payload);
        if normalized.is_empty() {
            return Vec::new();
        }
        let mut row = TableRow::new();
        row.insert(
            fields::GLOBAL_ID.to_owned(),
            Value::String(fields::GLOBAL_ROW_ID.to_owned()),
        );
        for (key, value) in normalized {
            row.insert(key, value);
        }
        return vec![WriterCommand::upsert(
            sheet_ids::SYS_GLOBAL_STATE,
            fields::GLOBAL_ID,
            vec![row],
        )];
    }

    let field = resolve_field_from_path(&event.path);
    if field.is_empty() {
        return Vec::new();
    }
    let mut row = TableRow::new();
    row.insert(
        fields::GLOBAL_ID.to_owned(),
        Value::String(fields::GLOBAL_ROW_ID.to_owned()),
    );

    if field == fields::WORLD_COORD {
        if event.op == EventOp::Delete {
            row.insert(fields::WORLD_COORD_X.to_owned(), Value::Null);
            row.insert(fields::WORLD_COORD_Y.to_owned(), Value::Null);
        } else {
            let empty = TableRow::new();
            let coord = payload_object(event).unwrap_or(&empty);
            let x = coord_component(coord, "x");
            let y = coord_component(coord, "y");
            if x.is_none() && y.is_none() {
                return Vec::new();
            }
            if let Some(x) = x {
                row.insert(fields::WORLD_COORD_X.to_owned(), number_value(x.round()));
            }
            if let Some(y) = y {
                row.insert(fields::WORLD_COORD_Y.to_owned(), number_value(y.round()));
            }
        }
    } else if event.op == EventOp::Delete {
        row.insert(field, Value::Null);
    } else if event.op == EventOp::Add {
        let Some(delta) = event.value.as_ref().and_then(as_finite_number) else {
            return Vec::new();
        };
        let current = snapshot.global_number(&field).unwrap_or(0.0);
        row.insert(field, number_value(current + delta));
    } else {
        row.insert(field, event.value.clone().unwrap_or(Value::Null));
    }

    vec![WriterCommand::upsert(
        sheet_ids::SYS_GLOBAL_STATE,
        fields::GLOBAL_ID,
        vec![row],
    )]
}

/// The character-resources rule.
fn build_character_commands(
    event: &StateVariableEvent,
    snapshot: &StateSnapshot,
) -> Vec<WriterCommand> {
    let entity = if event.entity_id.is_empty() {
        fields::PLAYER.to_owned()
    } else {
        event.entity_id.clone()
    };

    if event.op == EventOp::Upsert {
        let Some(payload) = payload_object(event) else {
            return Vec::new();
        };
        let mut row = TableRow::new();
        row.insert(fields::CHAR_ID.to_owned(), Value::String(entity));
        for (key, value) in payload {
            row.insert(key.clone(), value.clone());
        }
        return vec![WriterCommand::upsert(
            sheet_ids::CHARACTER_RESOURCES,
            fields::CHAR_ID,
            vec![row],
        )];
    }

    let field = resolve_field_from_path(&event.path);
    if field.is_empty() {
        return Vec::new();
    }
    let mut row = TableRow::new();
    row.insert(fields::CHAR_ID.to_owned(), Value::String(entity.clone()));

    if event.op == EventOp::Delete {
        row.insert(field, Value::Null);
    } else if event.op == EventOp::Add {
        let Some(delta) = event.value.as_ref().and_then(as_finite_number) else {
            return Vec::new();
        };
        let current = snapshot.character_number(&entity, &field).unwrap_or(0.0);
        row.insert(field, number_value(current + delta));
    } else {
        row.insert(field, event.value.clone().unwrap_or(Value::Null));
    }

    vec![WriterCommand::upsert(
        sheet_ids::CHARACTER_RESOURCES,
        fields::CHAR_ID,
        vec![row],
    )]
}

/// The inventory rule.
fn build_inventory_commands(
    event: &StateVariableEvent,
    snapshot: &StateSnapshot,
) -> Vec<WriterCommand> {
    if event.op == EventOp::Delete {
        let row_ids = resolve_inventory_delete_row_ids(event, snapshot);
        if row_ids.is_empty() {
            return Vec::new();
        }
        return vec![WriterCommand::delete(
            sheet_ids::ITEM_INVENTORY,
            fields::ITEM_ID,
            row_ids,
        )];
    }

    if event.op == EventOp::Add {
        let Some(payload) = payload_object(event) else {
            return Vec::new();
        };
        let Some(item_id) = object_item_id(payload) else {
            return Vec::new();
        };
        let delta = [
            "delta",
            "数量变更",
            "quantityDelta",
        ]
        .iter()
        .find_map(|alias| payload.get(*alias).and_then(as_finite_number));
        let Some(delta) = delta else {
            return Vec::new();
        };

        let current_item = snapshot.bag_item(&item_id);
        let current = current_item
            .and_then(|item| {
                item.get(fields::QUANTITY)
                    .or_else(|| item.get("count"))
                    .and_then(as_finite_number)
            })
            .unwrap_or(0.0);
        let name = current_item
            .and_then(|item| first_string(item, &[fields::ITEM_NAME, "名称"]))
            .unwrap_or_else(|| item_id.clone());

        let mut row = TableRow::new();
        row.insert(fields::ITEM_ID.to_owned(), Value::String(item_id));
        row.insert(fields::ITEM_NAME.to_owned(), Value::String(name));
        row.insert(fields::QUANTITY.to_owned(), number_value(current + delta));
        return vec![WriterCommand::upsert(
            sheet_ids::ITEM_INVENTORY,
            fields::ITEM_ID,
            vec![row],
        )];
    }

    // push / upsert / set: append-or-merge one or more item rows.
    let items: Vec<&TableRow> = match event.value.as_ref() {
        Some(Value::Array(list)) => list.iter().filter_map(Value::as_object).collect(),
        Some(Value::Object(map)) => vec![map],
        _ => Vec::new(),
    };
    let rows: Vec<TableRow> = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| to_inventory_row(item, index, event.created_at))
        .collect();
    if rows.is_empty() {
        return Vec::new();
    }
    vec![WriterCommand::upsert(sheet_ids::ITEM_INVENTORY, fields::ITEM_ID, rows)]
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Translate one event into sheet commands using the domain rules.
///
/// The event's optimistic version expectation, when present, is stamped
/// onto every produced command.
pub fn build_commands_for_event(
    event: &StateVariableEvent,
    snapshot: &StateSnapshot,
    registry: &DomainRegistry,
) -> Vec<WriterCommand> {
    let commands = match event.domain.as_str() {
        domains::GLOBAL_STATE => build_global_state_commands(event, snapshot),
        domains::CHARACTER_RESOURCES => build_character_commands(event, snapshot),
        domains::INVENTORY => build_inventory_commands(event, snapshot),
        other => registry
            .get(other)
            .map_or_else(Vec::new, |spec| build_generic_commands(event, spec)),
    };

    commands
        .into_iter()
        .map(|command| command.with_expected_row_version(event.expected_version))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use statevar_types::SheetCommand;

    use super::*;

    fn row(pairs: &[(&str, serde_json::Value)]) -> TableRow {
        let mut map = TableRow::new();
        for (key, value) in pairs {
            map.insert((*key).to_owned(), value.clone());
        }
        map
    }

    fn event(domain: &str, entity: &str, path: &str, op: EventOp, value: Option<Value>) -> StateVariableEvent {
        StateVariableEvent::create(statevar_types::EventDraft {
            turn_id: Some(String::from("1")),
            source: Some(String::from("ms:state")),
            domain: Some(domain.to_owned()),
            entity_id: Some(entity.to_owned()),
            path: Some(path.to_owned()),
            op: Some(op),
            value,
            created_at: Some(1_000),
            ..statevar_types::EventDraft::default()
        })
    }

    fn snapshot() -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        snapshot.globals.insert("当前回合".to_owned(), json!(3));
        let mut player = TableRow::new();
        player.insert("法利".to_owned(), json!(100));
        snapshot.characters.insert(String::from("PLAYER"), player);
        snapshot.bag.push(row(&[
            ("id", json!("itm_001")),
            ("物品ID", json!("itm_001")),
            ("物品名称", json!("苹果")),
            ("数量", json!(2)),
        ]));
        snapshot
    }

    fn upsert_rows(command: &WriterCommand) -> &[TableRow] {
        match &command.command {
            SheetCommand::UpsertSheetRows(payload) => &payload.rows,
            SheetCommand::DeleteSheetRows(_) => &[],
        }
    }

    #[test]
    fn set_writes_single_global_row() {
        let commands = build_commands_for_event(
            &event("global_state", "GLOBAL", "gameState.当前场景", EventOp::Set, Some(json!("公会本部"))),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        assert_eq!(commands.len(), 1);
        let command = commands.first().unwrap();
        assert_eq!(command.sheet_id(), "SYS_GlobalState");
        let target = upsert_rows(command).first().unwrap();
        assert_eq!(target.get("_global_id"), Some(&json!("GLOBAL_STATE")));
        assert_eq!(target.get("当前场景"), Some(&json!("公会本部")));
    }

    #[test]
    fn add_reads_current_value_from_snapshot() {
        let commands = build_commands_for_event(
            &event("character_resources", "PLAYER", "gameState.角色.法利", EventOp::Add, Some(json!(30))),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let target = upsert_rows(commands.first().unwrap()).first().unwrap();
        assert_eq!(target.get("法利"), Some(&json!(130)));
        assert_eq!(target.get("CHAR_ID"), Some(&json!("PLAYER")));
    }

    #[test]
    fn global_add_on_missing_field_starts_from_zero() {
        let commands = build_commands_for_event(
            &event("global_state", "GLOBAL", "gameState.系统通知", EventOp::Add, Some(json!("x"))),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        // Non-numeric delta -> no command.
        assert!(commands.is_empty());

        let commands = build_commands_for_event(
            &event("global_state", "GLOBAL", "gameState.流逝时长", EventOp::Add, Some(json!(5))),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let target = upsert_rows(commands.first().unwrap()).first().unwrap();
        assert_eq!(target.get("流逝时长"), Some(&json!(5)));
    }

    #[test]
    fn push_appends_inventory_rows() {
        let commands = build_commands_for_event(
            &event(
                "inventory",
                "INVENTORY",
                "gameState.背包",
                EventOp::Push,
                Some(json!({ "物品ID": "itm_002", "物品名称": "短剑", "数量": 1 })),
            ),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let command = commands.first().unwrap();
        assert_eq!(command.sheet_id(), "ITEM_Inventory");
        let target = upsert_rows(command).first().unwrap();
        assert_eq!(target.get("物品ID"), Some(&json!("itm_002")));
        assert_eq!(target.get("数量"), Some(&json!(1)));
    }

    #[test]
    fn quality_aliases_normalize_into_both_columns() {
        let commands = build_commands_for_event(
            &event(
                "inventory",
                "INVENTORY",
                "gameState.背包",
                EventOp::Push,
                Some(json!({ "物品ID": "itm_alias", "物品名称": "高阶灵药", "数量": 1, "品质": "UR" })),
            ),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let target = upsert_rows(commands.first().unwrap()).first().unwrap();
        assert_eq!(target.get("品质"), Some(&json!("神话")));
        assert_eq!(target.get("稀有度"), Some(&json!("神话")));
    }

    #[test]
    fn inventory_add_applies_quantity_delta() {
        let commands = build_commands_for_event(
            &event(
                "inventory",
                "INVENTORY",
                "gameState.背包",
                EventOp::Add,
                Some(json!({ "物品ID": "itm_001", "delta": 3 })),
            ),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let target = upsert_rows(commands.first().unwrap()).first().unwrap();
        assert_eq!(target.get("数量"), Some(&json!(5)));
        assert_eq!(target.get("物品名称"), Some(&json!("苹果")));
    }

    #[test]
    fn inventory_delete_by_explicit_id_and_by_index() {
        let by_id = build_commands_for_event(
            &event(
                "inventory",
                "INVENTORY",
                "gameState.背包[0]",
                EventOp::Delete,
                Some(json!({ "物品ID": "itm_001" })),
            ),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let SheetCommand::DeleteSheetRows(payload) = &by_id.first().unwrap().command else {
            panic!("expected delete command");
        };
        assert_eq!(payload.row_ids, vec![String::from("itm_001")]);

        let by_index = build_commands_for_event(
            &event("inventory", "INVENTORY", "gameState.背包[0]", EventOp::Delete, None),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let SheetCommand::DeleteSheetRows(payload) = &by_index.first().unwrap().command else {
            panic!("expected delete command");
        };
        assert_eq!(payload.row_ids, vec![String::from("itm_001")]);

        let miss = build_commands_for_event(
            &event("inventory", "INVENTORY", "gameState.背包[9]", EventOp::Delete, None),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        assert!(miss.is_empty());
    }

    #[test]
    fn global_upsert_merges_coordinate_aliases() {
        let commands = build_commands_for_event(
            &event(
                "global_state",
                "GLOBAL_STATE",
                "sheet.SYS_GlobalState.GLOBAL_STATE",
                EventOp::Upsert,
                Some(json!({ "当前地点": "旧城区", "世界坐标": { "x": 11.4, "y": 22.6 } })),
            ),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let target = upsert_rows(commands.first().unwrap()).first().unwrap();
        assert_eq!(target.get("当前场景"), Some(&json!("旧城区")));
        assert_eq!(target.get("世界坐标X"), Some(&json!(11)));
        assert_eq!(target.get("世界坐标Y"), Some(&json!(23)));
        assert!(!target.contains_key("当前地点"));
        assert!(!target.contains_key("世界坐标"));
    }

    #[test]
    fn coordinate_set_via_legacy_path() {
        let commands = build_commands_for_event(
            &event(
                "global_state",
                "GLOBAL",
                "gameState.世界坐标.x",
                EventOp::Set,
                Some(json!(7)),
            ),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let target = upsert_rows(commands.first().unwrap()).first().unwrap();
        assert_eq!(target.get("世界坐标X"), Some(&json!(7)));
    }

    #[test]
    fn location_alias_resolves_to_scene_column() {
        let commands = build_commands_for_event(
            &event("global_state", "GLOBAL", "gameState.当前地点", EventOp::Set, Some(json!("公会大厅"))),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        let target = upsert_rows(commands.first().unwrap()).first().unwrap();
        assert_eq!(target.get("当前场景"), Some(&json!("公会大厅")));
    }

    #[test]
    fn generic_domain_routes_through_registry() {
        let registry = DomainRegistry::standard();
        let commands = build_commands_for_event(
            &event(
                "quest",
                "QUEST",
                "sheet.QUEST_Active.Q1",
                EventOp::Upsert,
                Some(json!({ "quest_id": "Q1", "状态": "进行中" })),
            ),
            &snapshot(),
            &registry,
        );
        let command = commands.first().unwrap();
        assert_eq!(command.sheet_id(), "QUEST_Active");
        let target = upsert_rows(command).first().unwrap();
        assert_eq!(target.get("任务ID"), Some(&json!("Q1")));

        let delete = build_commands_for_event(
            &event("quest", "QUEST", "sheet.QUEST_Active.Q1", EventOp::Delete, Some(json!("Q1"))),
            &snapshot(),
            &registry,
        );
        let SheetCommand::DeleteSheetRows(payload) = &delete.first().unwrap().command else {
            panic!("expected delete command");
        };
        assert_eq!(payload.row_ids, vec![String::from("Q1")]);
    }

    #[test]
    fn unknown_domain_produces_no_commands() {
        let commands = build_commands_for_event(
            &event("social", "NPC_1", "社交.好感度", EventOp::Set, Some(json!(5))),
            &snapshot(),
            &DomainRegistry::standard(),
        );
        assert!(commands.is_empty());
    }

    #[test]
    fn expected_version_is_stamped_onto_commands() {
        let mut raw = event("global_state", "GLOBAL", "gameState.当前场景", EventOp::Set, Some(json!("x")));
        raw.expected_version = Some(4);
        let commands = build_commands_for_event(&raw, &snapshot(), &DomainRegistry::standard());
        assert_eq!(commands.first().unwrap().expected_row_version, Some(4));
    }

    #[test]
    fn staleness_resolves_targets_per_domain() {
        let registry = DomainRegistry::standard();
        let mut snapshot = snapshot();
        snapshot.meta.row_versions.insert(
            statevar_types::meta::row_version_key("CHARACTER_Resources", "PLAYER"),
            3,
        );

        let mut stale = event(
            "character_resources",
            "PLAYER",
            "gameState.角色.法利",
            EventOp::Set,
            Some(json!(1)),
        );
        stale.expected_version = Some(1);
        assert!(is_stale_event(&stale, &snapshot, &registry));

        let mut fresh = stale.clone();
        fresh.expected_version = Some(3);
        assert!(!is_stale_event(&fresh, &snapshot, &registry));

        let mut no_expectation = stale.clone();
        no_expectation.expected_version = None;
        assert!(!is_stale_event(&no_expectation, &snapshot, &registry));
    }

    #[test]
    fn field_resolution_handles_prefixes_and_aliases() {
        assert_eq!(resolve_field_from_path("gameState.角色.法利"), "法利");
        assert_eq!(resolve_field_from_path("gameState.背包[0].数量"), "数量");
        assert_eq!(resolve_field_from_path("gameState.世界坐标.y"), "世界坐标Y");
        assert_eq!(resolve_field_from_path("gameState.当前地点"), "当前场景");
        assert_eq!(resolve_field_from_path("gameState.天气"), "天气状况");
        assert_eq!(resolve_field_from_path(""), "");
    }
}
