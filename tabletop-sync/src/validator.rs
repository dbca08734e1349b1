//! Type hints for well-known sheet fields.
//!
//! Most of a sheet is free-form: a path with no hint accepts any JSON value.
//! A few fields feed calculations on the client and must keep their kind.
//! Patterns are dotted paths where `*` matches exactly one segment; the first
//! matching pattern wins.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::path::DocPath;

/// Expected kind of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Boolean,
    Any,
}

impl ValueKind {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ValueKind::Number => value.is_number(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Any => true,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
            ValueKind::Any => "any",
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One field that failed its hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    pub path: String,
    pub expected: ValueKind,
    pub found: &'static str,
}

impl fmt::Display for FieldFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (expected {}, got {})",
            self.path,
            self.expected.name(),
            self.found
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("bad type:{}", render(.0))]
    BadType(Vec<FieldFailure>),
    #[error("changes must be a JSON object")]
    NotAnObject,
}

fn render(failures: &[FieldFailure]) -> String {
    failures.iter().map(|f| format!(" {f};")).collect()
}

const DEFAULT_HINTS: &[(&str, ValueKind)] = &[
    ("experience.experience-total", ValueKind::Number),
    ("experience.experience-spent", ValueKind::Number),
    ("experience.experience-remaining", ValueKind::Number),
    ("experience.*.experience-cost", ValueKind::Number),
    ("experience.experience-log.items.*.experience-cost", ValueKind::Number),
    ("gear.*.weight", ValueKind::Number),
    ("gear.items.*.weight", ValueKind::Number),
    ("movement.move_half", ValueKind::Number),
    ("movement.move_full", ValueKind::Number),
    ("armour.wounds_max", ValueKind::Number),
    ("armour.wounds_cur", ValueKind::Number),
    ("initiative", ValueKind::Number),
    ("size", ValueKind::Number),
    ("*.*.difficulty", ValueKind::Number),
    ("custom-skills.items.*.difficulty", ValueKind::Number),
    ("*.*.+0", ValueKind::Boolean),
    ("*.*.+10", ValueKind::Boolean),
    ("*.*.+20", ValueKind::Boolean),
    ("*.*.+30", ValueKind::Boolean),
];

/// Ordered table of path patterns and the value kind they require.
#[derive(Debug, Clone)]
pub struct PathValidator {
    hints: Vec<(Vec<String>, ValueKind)>,
}

impl Default for PathValidator {
    fn default() -> Self {
        DEFAULT_HINTS
            .iter()
            .fold(Self::empty(), |v, (pattern, kind)| v.with_hint(pattern, *kind))
    }
}

impl PathValidator {
    /// A validator with no hints; every value passes.
    pub fn empty() -> Self {
        Self { hints: Vec::new() }
    }

    /// Append a hint. Earlier hints take precedence.
    pub fn with_hint(mut self, pattern: &str, kind: ValueKind) -> Self {
        self.hints
            .push((pattern.split('.').map(str::to_owned).collect(), kind));
        self
    }

    /// The kind required at `path`, `Any` when no pattern matches.
    pub fn kind_for(&self, path: &DocPath) -> ValueKind {
        self.hints
            .iter()
            .find(|(pattern, _)| matches(pattern, path.segments()))
            .map_or(ValueKind::Any, |(_, kind)| *kind)
    }

    pub fn validate_field(&self, path: &DocPath, value: &Value) -> Result<(), ValidationError> {
        match self.check(path, value) {
            Some(failure) => Err(ValidationError::BadType(vec![failure])),
            None => Ok(()),
        }
    }

    /// Validate every top-level key of `changes` as `base.key` and report all
    /// failures together, sorted by path.
    pub fn validate_batch(
        &self,
        base: &DocPath,
        changes: &Value,
    ) -> Result<Map<String, Value>, ValidationError> {
        let changes = changes.as_object().ok_or(ValidationError::NotAnObject)?;
        let mut failures: Vec<FieldFailure> = changes
            .iter()
            .filter_map(|(key, value)| self.check(&base.child(key), value))
            .collect();
        if failures.is_empty() {
            return Ok(changes.clone());
        }
        failures.sort_by(|a, b| a.path.cmp(&b.path));
        Err(ValidationError::BadType(failures))
    }

    fn check(&self, path: &DocPath, value: &Value) -> Option<FieldFailure> {
        let expected = self.kind_for(path);
        if expected.accepts(value) {
            return None;
        }
        Some(FieldFailure {
            path: path.dotted(),
            expected,
            found: kind_of(value),
        })
    }
}

fn matches(pattern: &[String], segments: &[String]) -> bool {
    pattern.len() == segments.len()
        && pattern
            .iter()
            .zip(segments)
            .all(|(p, s)| p == "*" || p == s)
}
