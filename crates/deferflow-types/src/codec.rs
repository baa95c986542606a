//! Canonical JSON-like encoding for job arguments and outputs.
//!
//! Every value written to the store is a `serde_json::Value` tree. Values
//! that plain JSON cannot carry -- date/time instants, output references,
//! blob stubs, user-defined self-describing objects -- are encoded as objects
//! tagged with a `@class` identifier. Decoding inverts the mapping; the
//! round-trip law is `T::from_document(&encode(&t)) == t` for every supported
//! `t`.
//!
//! Registration discipline: classes are registered at startup into a
//! `CodecRegistry`, which can then validate documents containing tagged
//! objects without knowing their concrete Rust types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::error::CodecError;

/// Field carrying the class identifier in encoded objects.
pub const CLASS_FIELD: &str = "@class";

// ---------------------------------------------------------------------------
// ClassCoded
// ---------------------------------------------------------------------------

/// A self-describing object in the canonical encoding.
///
/// `to_document` produces the object's fields *without* the `@class` tag;
/// [`encode`] injects it. `from_document` accepts the tagged form and must
/// ignore the tag.
pub trait ClassCoded: Sized {
    /// Class identifier written into the `@class` field.
    const CLASS: &'static str;

    /// Encode the object's fields as a JSON object (tag excluded).
    fn to_document(&self) -> Value;

    /// Decode from a tagged document.
    fn from_document(doc: &Value) -> Result<Self, CodecError>;
}

/// Encode a value into its tagged canonical form.
pub fn encode<T: ClassCoded>(value: &T) -> Value {
    let mut doc = value.to_document();
    if let Value::Object(map) = &mut doc {
        map.insert(
            CLASS_FIELD.to_string(),
            Value::String(T::CLASS.to_string()),
        );
    }
    doc
}

/// Decode a tagged value, verifying the class identifier first.
pub fn decode<T: ClassCoded>(value: &Value) -> Result<T, CodecError> {
    let found = class_of(value).ok_or(CodecError::MissingClass)?;
    if found != T::CLASS {
        return Err(CodecError::ClassMismatch {
            expected: T::CLASS.to_string(),
            found: found.to_string(),
        });
    }
    T::from_document(value)
}

/// The class identifier of an encoded value, if it carries one.
pub fn class_of(value: &Value) -> Option<&str> {
    value.get(CLASS_FIELD).and_then(Value::as_str)
}

/// Whether a value is the tagged form of class `T`.
pub fn is_class<T: ClassCoded>(value: &Value) -> bool {
    class_of(value) == Some(T::CLASS)
}

// ---------------------------------------------------------------------------
// Built-in encodings
// ---------------------------------------------------------------------------

impl ClassCoded for DateTime<Utc> {
    const CLASS: &'static str = "DateTime";

    fn to_document(&self) -> Value {
        json!({ "value": self.to_rfc3339() })
    }

    fn from_document(doc: &Value) -> Result<Self, CodecError> {
        let raw = doc
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::InvalidField {
                field: "value".to_string(),
                reason: "expected an ISO-8601 string".to_string(),
            })?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CodecError::InvalidField {
                field: "value".to_string(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// CodecRegistry
// ---------------------------------------------------------------------------

type DecodeCheck = fn(&Value) -> Result<(), CodecError>;

fn check<T: ClassCoded>(value: &Value) -> Result<(), CodecError> {
    T::from_document(value).map(|_| ())
}

/// Startup-time registry mapping class identifiers to decode checks.
///
/// The registry does not produce typed values (callers use [`decode`] for
/// that); it exists so documents read back from the store can be validated
/// without knowing the concrete types of every tagged object they contain.
pub struct CodecRegistry {
    checks: HashMap<&'static str, DecodeCheck>,
}

impl CodecRegistry {
    /// Create a registry with the built-in classes pre-registered.
    pub fn new() -> Self {
        let mut registry = Self {
            checks: HashMap::new(),
        };
        registry.register::<DateTime<Utc>>();
        registry.register::<crate::reference::OutputReference>();
        registry.register::<crate::document::BlobStub>();
        registry
    }

    /// Register a class; later registrations replace earlier ones.
    pub fn register<T: ClassCoded>(&mut self) {
        self.checks.insert(T::CLASS, check::<T>);
    }

    /// Whether a class identifier is known to this registry.
    pub fn knows(&self, class: &str) -> bool {
        self.checks.contains_key(class)
    }

    /// Walk a value tree and verify every tagged object decodes under its
    /// registered class. Unknown classes are an error.
    pub fn validate(&self, value: &Value) -> Result<(), CodecError> {
        if let Some(class) = class_of(value) {
            let check = self
                .checks
                .get(class)
                .ok_or_else(|| CodecError::UnknownClass(class.to_string()))?;
            return check(value);
        }
        match value {
            Value::Array(items) => {
                for item in items {
                    self.validate(item)?;
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    self.validate(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Deep merge
// ---------------------------------------------------------------------------

/// Merge `update` into `base` key by key, recursing where both sides are
/// objects; non-object collisions take the updated value.
pub fn deep_merge(base: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, incoming) in update {
        match (base.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), incoming.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
