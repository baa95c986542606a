//! Store documents.
//!
//! `OutputDocument` is the record the engine writes after every job run; its
//! primary key is `(uuid, index)`, and "the output of uuid U" means the
//! document with the largest index for U. `BlobStub` is the sentinel left in
//! a document where a configured field was routed to an auxiliary store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::codec::ClassCoded;
use crate::error::CodecError;

// ---------------------------------------------------------------------------
// OutputDocument
// ---------------------------------------------------------------------------

/// The persisted result of one job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDocument {
    pub uuid: Uuid,
    /// Positive, increments when the job is replaced at runtime.
    pub index: u32,
    /// Encoded output value; may contain reference sentinels or blob stubs.
    pub output: Value,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub hosts: Vec<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_data: Option<Map<String, Value>>,
}

impl OutputDocument {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// ---------------------------------------------------------------------------
// BlobStub
// ---------------------------------------------------------------------------

/// Sentinel marking a subtree that was split out to an auxiliary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStub {
    /// Key of the payload in the auxiliary store.
    pub blob_uuid: Uuid,
    /// Name of the auxiliary store holding the payload.
    pub store: String,
}

impl ClassCoded for BlobStub {
    const CLASS: &'static str = "BlobStub";

    fn to_document(&self) -> Value {
        json!({
            "blob_uuid": self.blob_uuid,
            "store": self.store,
        })
    }

    fn from_document(doc: &Value) -> Result<Self, CodecError> {
        let blob_uuid = doc
            .get("blob_uuid")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| CodecError::InvalidField {
                field: "blob_uuid".to_string(),
                reason: "expected a uuid string".to_string(),
            })?;
        let store = doc
            .get("store")
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::InvalidField {
                field: "store".to_string(),
                reason: "expected a store name".to_string(),
            })?
            .to_string();
        Ok(Self { blob_uuid, store })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
