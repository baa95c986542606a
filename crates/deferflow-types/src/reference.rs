//! Symbolic references to job outputs.
//!
//! An `OutputReference` is a placeholder for the future output of a specific
//! `(uuid, index)`, optionally narrowed by a selector path into the stored
//! value. References are immutable: `attr` and `item` return extended copies
//! and never touch the store. Resolution lives in deferflow-core; this module
//! only knows how to apply a selector path to an already-fetched value.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::codec::{self, ClassCoded};
use crate::error::{CodecError, ReferenceError};

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

/// Subscript key for an `Item` selector: a sequence index (negative counts
/// from the end) or a mapping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemKey {
    Index(i64),
    Key(String),
}

impl From<i64> for ItemKey {
    fn from(index: i64) -> Self {
        ItemKey::Index(index)
    }
}

impl From<&str> for ItemKey {
    fn from(key: &str) -> Self {
        ItemKey::Key(key.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(key: String) -> Self {
        ItemKey::Key(key)
    }
}

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selector {
    /// Attribute access: mapping key lookup on the stored document.
    Attr { name: String },
    /// Subscript access: sequence index or mapping key.
    Item { key: ItemKey },
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Attr { name } => write!(f, ".{name}"),
            Selector::Item { key: ItemKey::Index(i) } => write!(f, "[{i}]"),
            Selector::Item { key: ItemKey::Key(k) } => write!(f, "[{k:?}]"),
        }
    }
}

// ---------------------------------------------------------------------------
// OnMissing
// ---------------------------------------------------------------------------

/// Policy when a referenced output is absent from the store at resolve time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    /// Raise `ReferenceError::Unresolvable`.
    #[default]
    Fail,
    /// Leave the reference sentinel in place (dry traversal).
    PassThrough,
    /// Substitute a null sentinel.
    Null,
}

// ---------------------------------------------------------------------------
// OutputReference
// ---------------------------------------------------------------------------

/// A symbolic, resolvable handle to the output of `(uuid, index)`.
///
/// Two references are equal iff uuid, index, and path are all equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputReference {
    uuid: Uuid,
    index: u32,
    path: Vec<Selector>,
}

impl OutputReference {
    /// Reference the whole output of `(uuid, index)`.
    pub fn new(uuid: Uuid, index: u32) -> Self {
        Self {
            uuid,
            index,
            path: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &[Selector] {
        &self.path
    }

    /// Extend the path with an attribute selector. Pure: no store lookup.
    pub fn attr(&self, name: impl Into<String>) -> Self {
        let mut extended = self.clone();
        extended.path.push(Selector::Attr { name: name.into() });
        extended
    }

    /// Extend the path with a subscript selector. Pure: no store lookup.
    pub fn item(&self, key: impl Into<ItemKey>) -> Self {
        let mut extended = self.clone();
        extended.path.push(Selector::Item { key: key.into() });
        extended
    }

    /// Copy with the uuid replaced (used while grafting flows into a running
    /// schedule).
    pub fn with_uuid(&self, uuid: Uuid) -> Self {
        let mut renamed = self.clone();
        renamed.uuid = uuid;
        renamed
    }

    /// Copy with the index replaced.
    pub fn with_index(&self, index: u32) -> Self {
        let mut renumbered = self.clone();
        renumbered.index = index;
        renumbered
    }

    /// The tagged canonical encoding of this reference.
    pub fn to_value(&self) -> Value {
        codec::encode(self)
    }

    /// Apply the selector path to a fetched output value, left to right.
    pub fn apply_path(&self, output: &Value) -> Result<Value, ReferenceError> {
        let mut current = output;
        for selector in &self.path {
            current = apply_selector(current, selector).map_err(|reason| {
                ReferenceError::SelectorFailed {
                    uuid: self.uuid,
                    selector: selector.to_string(),
                    reason,
                }
            })?;
        }
        Ok(current.clone())
    }
}

fn apply_selector<'a>(value: &'a Value, selector: &Selector) -> Result<&'a Value, String> {
    match selector {
        Selector::Attr { name } => value
            .as_object()
            .ok_or_else(|| format!("expected an object, found {}", kind_of(value)))?
            .get(name)
            .ok_or_else(|| format!("no key '{name}'")),
        Selector::Item { key: ItemKey::Key(key) } => value
            .as_object()
            .ok_or_else(|| format!("expected an object, found {}", kind_of(value)))?
            .get(key)
            .ok_or_else(|| format!("no key '{key}'")),
        Selector::Item { key: ItemKey::Index(index) } => {
            let items = value
                .as_array()
                .ok_or_else(|| format!("expected an array, found {}", kind_of(value)))?;
            let effective = if *index < 0 {
                index
                    .checked_add(items.len() as i64)
                    .filter(|i| *i >= 0)
                    .ok_or_else(|| format!("index {index} out of range (len {})", items.len()))?
            } else {
                *index
            };
            items
                .get(effective as usize)
                .ok_or_else(|| format!("index {index} out of range (len {})", items.len()))
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Canonical encoding
// ---------------------------------------------------------------------------

impl ClassCoded for OutputReference {
    const CLASS: &'static str = "OutputReference";

    fn to_document(&self) -> Value {
        json!({
            "uuid": self.uuid,
            "index": self.index,
            "attributes": self.path,
        })
    }

    fn from_document(doc: &Value) -> Result<Self, CodecError> {
        let uuid = doc
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| CodecError::InvalidField {
                field: "uuid".to_string(),
                reason: "expected a uuid string".to_string(),
            })?;
        let index = doc
            .get("index")
            .and_then(Value::as_u64)
            .ok_or_else(|| CodecError::InvalidField {
                field: "index".to_string(),
                reason: "expected a positive integer".to_string(),
            })? as u32;
        let path: Vec<Selector> = match doc.get("attributes") {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                CodecError::InvalidField {
                    field: "attributes".to_string(),
                    reason: e.to_string(),
                }
            })?,
        };
        Ok(Self { uuid, index, path })
    }
}

/// Collect every reference sentinel embedded in a value tree.
pub fn find_references(value: &Value) -> Vec<OutputReference> {
    let mut found = Vec::new();
    collect_references(value, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<OutputReference>) {
    if codec::is_class::<OutputReference>(value) {
        if let Ok(reference) = codec::decode::<OutputReference>(value) {
            found.push(reference);
            return;
        }
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_references(item, found);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, found);
            }
        }
        _ => {}
    }
}

/// Rewrite every embedded reference with uuid `from` to `(to, to_index)`.
///
/// Selector paths are preserved; only the identity changes.
pub fn rename_references(value: &mut Value, from: Uuid, to: Uuid, to_index: u32) {
    if codec::is_class::<OutputReference>(value) {
        if let Ok(reference) = codec::decode::<OutputReference>(value) {
            if reference.uuid() == from {
                *value = reference.with_uuid(to).with_index(to_index).to_value();
            }
            return;
        }
    }
    match value {
        Value::Array(items) => {
            for item in items {
                rename_references(item, from, to, to_index);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                rename_references(item, from, to, to_index);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;

    #[test]
    fn test_selectors_extend_path_without_resolving() {
        let base = OutputReference::new(Uuid::now_v7(), 1);
        let narrowed = base.attr("a").item(0);
        assert!(base.path().is_empty());
        assert_eq!(narrowed.path().len(), 2);
        assert_eq!(
            narrowed.path()[0],
            Selector::Attr { name: "a".to_string() }
        );
        assert_eq!(
            narrowed.path()[1],
            Selector::Item { key: ItemKey::Index(0) }
        );
    }

    #[test]
    fn test_equality_covers_all_three_fields() {
        let uuid = Uuid::now_v7();
        let a = OutputReference::new(uuid, 1);
        assert_eq!(a, OutputReference::new(uuid, 1));
        assert_ne!(a, OutputReference::new(uuid, 2));
        assert_ne!(a, a.attr("x"));
        assert_ne!(a, OutputReference::new(Uuid::now_v7(), 1));
    }

    #[test]
    fn test_encoded_form_roundtrip() {
        let reference = OutputReference::new(Uuid::now_v7(), 3)
            .attr("results")
            .item(-1)
            .item("score");
        let encoded = reference.to_value();
        assert_eq!(codec::class_of(&encoded), Some("OutputReference"));
        let decoded: OutputReference = decode(&encoded).unwrap();
        assert_eq!(decoded, reference);
    }

    #[test]
    fn test_apply_path_chains_left_to_right() {
        let reference = OutputReference::new(Uuid::now_v7(), 1).attr("a").item(0);
        let output = serde_json::json!({ "a": [10, 20], "b": 5 });
        assert_eq!(reference.apply_path(&output).unwrap(), serde_json::json!(10));
    }

    #[test]
    fn test_apply_path_negative_index() {
        let reference = OutputReference::new(Uuid::now_v7(), 1).item(-1);
        let output = serde_json::json!([1, 2, 3]);
        assert_eq!(reference.apply_path(&output).unwrap(), serde_json::json!(3));
    }

    #[test]
    fn test_apply_path_failure_names_selector() {
        let reference = OutputReference::new(Uuid::now_v7(), 1).attr("missing");
        let err = reference.apply_path(&serde_json::json!({ "x": 1 })).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_find_references_walks_nesting() {
        let a = OutputReference::new(Uuid::now_v7(), 1);
        let b = OutputReference::new(Uuid::now_v7(), 1).attr("x");
        let tree = serde_json::json!({
            "first": a.to_value(),
            "nested": [ { "deep": b.to_value() }, 42 ],
        });
        let found = find_references(&tree);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&a));
        assert!(found.contains(&b));
    }

    #[test]
    fn test_rename_references_preserves_path() {
        let old = Uuid::now_v7();
        let new = Uuid::now_v7();
        let mut tree = serde_json::json!({
            "in": OutputReference::new(old, 1).attr("x").to_value(),
            "out": OutputReference::new(Uuid::now_v7(), 1).to_value(),
        });
        rename_references(&mut tree, old, new, 2);
        let found = find_references(&tree);
        let renamed = found.iter().find(|r| r.uuid() == new).unwrap();
        assert_eq!(renamed.index(), 2);
        assert_eq!(renamed.path().len(), 1);
        assert_eq!(found.iter().filter(|r| r.uuid() == old).count(), 0);
    }
}
