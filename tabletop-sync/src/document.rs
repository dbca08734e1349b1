//! Character sheet documents and the mutations applied to them.
//!
//! A sheet's content is a JSON object keyed by section name. Every
//! accepted [`Mutation`] produces a new content value and bumps the sheet's
//! version by exactly one, however many keys it touches.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::SystemTime;
use thiserror::Error;

use crate::path::{ensure_object, DocPath, ItemSlot, PathError, ITEMS, LAYOUTS};
use crate::permission::Visibility;
use crate::{RoomId, SheetId, UserId};

/// Grid position of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub col_index: u32,
    pub row_index: u32,
}

impl Position {
    pub fn new(col_index: u32, row_index: u32) -> Self {
        Self {
            col_index,
            row_index,
        }
    }

    pub fn to_value(self) -> Value {
        json!({ "colIndex": self.col_index, "rowIndex": self.row_index })
    }
}

/// A stored character sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRecord {
    pub id: SheetId,
    pub owner_id: UserId,
    pub room_id: RoomId,
    pub visibility: Visibility,
    pub content: Value,
    /// Incremented by one per accepted mutation, 0 on creation.
    pub version: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl SheetRecord {
    pub fn new(
        id: SheetId,
        owner_id: UserId,
        room_id: RoomId,
        visibility: Visibility,
        content: Value,
    ) -> Self {
        let now = unix_now();
        Self {
            id,
            owner_id,
            room_id,
            visibility,
            content,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// `character-info.character-name`, empty when unset.
    pub fn character_name(&self) -> &str {
        self.content
            .get("character-info")
            .and_then(|info| info.get("character-name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Content of a freshly created sheet.
pub fn default_content() -> Value {
    json!({
        "character-info": { "character-name": "New Character" },
        "characteristics": {},
        "skills-left": {},
        "skills-right": {},
        "custom-skills": {},
        "notes": {},
        "infamy-points": {},
        "fatigue": {},
        "initiative": "d10+0",
        "size": 0,
        "movement": {},
        "armour": {},
        "ranged-attack": {},
        "melee-attack": {},
        "traits": {},
        "talents": {},
        "carry-weight-and-encumbrance": {},
        "gear": {},
        "cybernetics": {},
        "experience": { "experience-log": {} },
        "mutations": {},
        "mental-disorders": {},
        "diseases": {},
        "psykana": { "tabs": {} },
        "techno-arcana": { "tabs": {} }
    })
}

/// Sections an imported sheet must carry.
const REQUIRED_SECTIONS: &[&str] = &[
    "characteristics",
    "skills-left",
    "skills-right",
    "infamy-points",
    "fatigue",
    "movement",
    "armour",
    "carry-weight-and-encumbrance",
    "experience",
    "psykana",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("sheet content must be a JSON object")]
    NotAnObject,
    #[error("character-info.character-name is required")]
    MissingName,
    #[error("missing section '{0}'")]
    MissingSection(String),
}

/// Check imported content has the shape of a character sheet.
pub fn validate_content(content: &Value) -> Result<(), ContentError> {
    let root = content.as_object().ok_or(ContentError::NotAnObject)?;
    let name = root
        .get("character-info")
        .and_then(|info| info.get("character-name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() {
        return Err(ContentError::MissingName);
    }
    match REQUIRED_SECTIONS.iter().find(|s| !root.contains_key(**s)) {
        Some(missing) => Err(ContentError::MissingSection((*missing).to_owned())),
        None => Ok(()),
    }
}

// ─── Mutations ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("item not found: {0}")]
    ItemNotFound(String),
}

/// One atomic change to a sheet's content.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Place a new item (content `init`, or `{}`) and its layout entry.
    CreateItem {
        slot: ItemSlot,
        init: Option<Value>,
        position: Position,
    },
    /// Set one value, creating parent objects as needed. May edit inside an
    /// existing item or layout entry but not add or remove one.
    ChangeField { path: DocPath, value: Value },
    /// Shallow-merge several keys into the object at `base`.
    ApplyBatch {
        base: DocPath,
        changes: Map<String, Value>,
    },
    /// Replace a grid's layouts. Ids without an item are discarded; items
    /// without a new position keep their old one.
    ReplacePositions {
        grid: DocPath,
        positions: BTreeMap<String, Position>,
    },
    /// Move an item (content and layout) from one grid to another.
    MoveItem {
        from: ItemSlot,
        to: ItemSlot,
        position: Position,
    },
    /// Remove an item and its layout entry.
    DeleteItem { slot: ItemSlot },
}

impl Mutation {
    /// Wire name of the operation, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::CreateItem { .. } => "createItem",
            Mutation::ChangeField { .. } => "change",
            Mutation::ApplyBatch { .. } => "batch",
            Mutation::ReplacePositions { .. } => "positionsChanged",
            Mutation::MoveItem { .. } => "moveItemBetweenGrids",
            Mutation::DeleteItem { .. } => "deleteItem",
        }
    }

    /// Compute the content after this mutation. `content` itself is never
    /// modified, so a failure leaves nothing half-applied.
    pub fn apply(&self, content: &Value) -> Result<Value, MutationError> {
        let mut next = content.clone();
        match self {
            Mutation::CreateItem {
                slot,
                init,
                position,
            } => {
                let init = match init {
                    Some(value) if !value.is_null() => value.clone(),
                    _ => Value::Object(Map::new()),
                };
                slot.place(&mut next, init, *position)?;
            }
            Mutation::ChangeField { path, value } => {
                path.check_set(&next)?;
                path.set(&mut next, value.clone())?
            }
            Mutation::ApplyBatch { base, changes } => {
                base.check_merge(&next, changes)?;
                base.merge(&mut next, changes.clone())?
            }
            Mutation::ReplacePositions { grid, positions } => {
                replace_positions(&mut next, grid, positions)?
            }
            Mutation::MoveItem { from, to, position } => {
                let item = from
                    .get(&next)
                    .cloned()
                    .ok_or_else(|| MutationError::ItemNotFound(from.item_path().dotted()))?;
                from.remove(&mut next);
                to.place(&mut next, item, *position)?;
            }
            Mutation::DeleteItem { slot } => {
                slot.remove(&mut next);
            }
        }
        Ok(next)
    }
}

fn replace_positions(
    content: &mut Value,
    grid: &DocPath,
    positions: &BTreeMap<String, Position>,
) -> Result<(), PathError> {
    let grid = ensure_object(content, grid.grid_root().segments())?;
    let previous = match grid.remove(LAYOUTS) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let mut layouts = Map::new();
    if let Some(items) = grid.get(ITEMS).and_then(Value::as_object) {
        for id in items.keys() {
            if let Some(position) = positions.get(id) {
                layouts.insert(id.clone(), position.to_value());
            } else if let Some(old) = previous.get(id) {
                layouts.insert(id.clone(), old.clone());
            }
        }
    }
    grid.insert(LAYOUTS.to_owned(), Value::Object(layouts));
    Ok(())
}
