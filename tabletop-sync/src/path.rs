//! Dotted document paths and the JSON walker that applies them.
//!
//! A [`DocPath`] addresses a node inside a sheet's content object, for example
//! `characteristics.WS.value`. Grids keep their items and layouts side by side:
//!
//! ```text
//! gear ─┬─ items   ─┬─ sword1: { ... }
//!       │           └─ rope:   { ... }
//!       └─ layouts ─┬─ sword1: { colIndex, rowIndex }
//!                   └─ rope:   { colIndex, rowIndex }
//! ```
//!
//! Items are created, moved and removed only through [`ItemSlot`], which
//! writes the item and its layout entry as one unit. Plain field writes are
//! checked with [`DocPath::check_set`] and [`DocPath::check_merge`] so they
//! can edit inside an existing entry but never add, replace or drop one.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::document::Position;

/// Segment holding a grid's item contents.
pub const ITEMS: &str = "items";
/// Segment holding a grid's item positions.
pub const LAYOUTS: &str = "layouts";

/// Path parsing and walking errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("empty segment in path '{0}'")]
    EmptySegment(String),
    #[error("'{0}' is not an object")]
    NotAnObject(String),
    #[error("invalid item id '{0}'")]
    InvalidItemId(String),
    #[error("'{0}' holds paired items or layouts; use the item operations")]
    PairedEntry(String),
    #[error("no grid entry at '{0}'")]
    MissingEntry(String),
}

/// A non-empty sequence of object keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    /// Parse a dot-separated path such as `gear.items.sword1`.
    pub fn parse(dotted: &str) -> Result<Self, PathError> {
        Self::from_segments(dotted.trim().split('.'))
    }

    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || (segments.len() == 1 && segments[0].is_empty()) {
            return Err(PathError::Empty);
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PathError::EmptySegment(segments.join(".")));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false; a path has at least one segment.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// This path extended by one segment.
    pub fn child(&self, segment: &str) -> DocPath {
        let mut segments = self.segments.clone();
        segments.push(segment.to_owned());
        DocPath { segments }
    }

    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }

    /// The grid this path names, with a trailing `items` or `layouts`
    /// segment stripped. `gear`, `gear.items` and `gear.layouts` all
    /// denote the grid `gear`.
    pub fn grid_root(&self) -> DocPath {
        match self.segments.split_last() {
            Some((last, parent)) if !parent.is_empty() && (last == ITEMS || last == LAYOUTS) => {
                DocPath {
                    segments: parent.to_vec(),
                }
            }
            _ => self.clone(),
        }
    }

    // ─── Walker ───────────────────────────────────────────────────────

    /// Read the node at this path.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |node, segment| node.get(segment.as_str()))
    }

    /// Write `value` at this path, creating missing intermediate objects.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), PathError> {
        let (last, parent) = self.split_last();
        ensure_object(root, parent)?.insert(last.to_owned(), value);
        Ok(())
    }

    /// Remove the node at this path. Missing paths are not an error.
    pub fn remove(&self, root: &mut Value) -> Option<Value> {
        let (last, parent) = self.split_last();
        node_mut(root, parent)?.as_object_mut()?.remove(last)
    }

    /// Shallow-merge `changes` into the object at this path. The target is
    /// created as `{}` when missing; keys not named in `changes` survive.
    pub fn merge(&self, root: &mut Value, changes: Map<String, Value>) -> Result<(), PathError> {
        let target = ensure_object(root, &self.segments)?;
        for (key, value) in changes {
            target.insert(key, value);
        }
        Ok(())
    }

    /// Check that `set` at this path leaves every grid's items and layouts
    /// paired: the write must land strictly inside an existing
    /// `<grid>.items.<id>` or `<grid>.layouts.<id>` entry, never on the entry
    /// or on the `items`/`layouts` map itself.
    pub fn check_set(&self, root: &Value) -> Result<(), PathError> {
        self.check_paired(root, 2)
    }

    /// The `merge` counterpart of [`check_set`](Self::check_set). The target
    /// may itself be an existing entry; each merged key is checked as a set.
    pub fn check_merge(&self, root: &Value, changes: &Map<String, Value>) -> Result<(), PathError> {
        self.check_paired(root, 1)?;
        changes
            .keys()
            .try_for_each(|key| self.child(key).check_set(root))
    }

    /// `min_depth` is how many segments the write must reach past a
    /// reserved `items`/`layouts` segment.
    fn check_paired(&self, root: &Value, min_depth: usize) -> Result<(), PathError> {
        let last = self.segments.len() - 1;
        // A top-level `items` is an ordinary section, not a grid.
        for (i, segment) in self.segments.iter().enumerate().skip(1) {
            if segment != ITEMS && segment != LAYOUTS {
                continue;
            }
            if last < i + min_depth {
                return Err(PathError::PairedEntry(self.dotted()));
            }
            let entry = &self.segments[..i + 2];
            let exists = entry
                .iter()
                .try_fold(root, |node, segment| node.get(segment.as_str()))
                .is_some_and(Value::is_object);
            if !exists {
                return Err(PathError::MissingEntry(entry.join(".")));
            }
        }
        Ok(())
    }

    fn split_last(&self) -> (&str, &[String]) {
        match self.segments.split_last() {
            Some((last, parent)) => (last.as_str(), parent),
            None => ("", &[]),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted())
    }
}

/// Walk `segments` from `root`, turning missing or null nodes into empty
/// objects, and return the object at the end.
pub fn ensure_object<'a>(
    root: &'a mut Value,
    segments: &[String],
) -> Result<&'a mut Map<String, Value>, PathError> {
    let mut node = root;
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    for (depth, segment) in segments.iter().enumerate() {
        let map = match node {
            Value::Object(map) => map,
            _ => return Err(PathError::NotAnObject(prefix(segments, depth))),
        };
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
    }
    match node {
        Value::Object(map) => Ok(map),
        _ => Err(PathError::NotAnObject(prefix(segments, segments.len()))),
    }
}

fn node_mut<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.get_mut(segment.as_str()))
}

fn prefix(segments: &[String], depth: usize) -> String {
    if depth == 0 {
        "$".to_owned()
    } else {
        segments[..depth].join(".")
    }
}

// ─── Item slots ───────────────────────────────────────────────────────

/// One item inside a grid: the `items.<id>` entry and its mirrored
/// `layouts.<id>` entry, addressed and written as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSlot {
    grid: DocPath,
    item_id: String,
}

impl ItemSlot {
    /// Ids are used verbatim as object keys, so surrounding whitespace is
    /// refused rather than trimmed.
    pub fn new(grid: &DocPath, item_id: &str) -> Result<Self, PathError> {
        if item_id.is_empty() || item_id.contains('.') || item_id.trim() != item_id {
            return Err(PathError::InvalidItemId(item_id.to_owned()));
        }
        Ok(Self {
            grid: grid.grid_root(),
            item_id: item_id.to_owned(),
        })
    }

    pub fn grid(&self) -> &DocPath {
        &self.grid
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn item_path(&self) -> DocPath {
        self.grid.child(ITEMS).child(&self.item_id)
    }

    pub fn layout_path(&self) -> DocPath {
        self.grid.child(LAYOUTS).child(&self.item_id)
    }

    /// The item's content, if present.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.item_path().get(root)
    }

    /// Write the item content and its position. Either both entries are
    /// written or, on error, neither.
    pub fn place(&self, root: &mut Value, content: Value, position: Position) -> Result<(), PathError> {
        let grid = ensure_object(root, self.grid.segments())?;
        for key in [ITEMS, LAYOUTS] {
            if !matches!(grid.get(key), None | Some(Value::Null) | Some(Value::Object(_))) {
                return Err(PathError::NotAnObject(self.grid.child(key).dotted()));
            }
        }

        let mut items = take_map(grid, ITEMS);
        let mut layouts = take_map(grid, LAYOUTS);
        items.insert(self.item_id.clone(), content);
        layouts.insert(self.item_id.clone(), position.to_value());
        grid.insert(ITEMS.to_owned(), Value::Object(items));
        grid.insert(LAYOUTS.to_owned(), Value::Object(layouts));
        Ok(())
    }

    /// Remove both entries, returning the item content if it existed.
    pub fn remove(&self, root: &mut Value) -> Option<Value> {
        let grid = node_mut(root, self.grid.segments())?.as_object_mut()?;
        if let Some(layouts) = grid.get_mut(LAYOUTS).and_then(Value::as_object_mut) {
            layouts.remove(&self.item_id);
        }
        grid.get_mut(ITEMS)
            .and_then(Value::as_object_mut)
            .and_then(|items| items.remove(&self.item_id))
    }
}

fn take_map(grid: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match grid.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl fmt::Display for ItemSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.item_path())
    }
}
