//! In-memory document store.
//!
//! Collections are plain vectors behind an `RwLock`; queries are linear
//! scans. Intended for tests and ephemeral runs where durability does not
//! matter. `ensure_index` is accepted and ignored -- scans are the index.

use std::collections::HashMap;
use std::sync::RwLock;

use deferflow_core::store::{DocStore, SortOrder, compare_values, matches_filter};
use deferflow_types::StoreError;
use serde_json::Value;

/// In-memory implementation of [`DocStore`].
#[derive(Default)]
pub struct MemoryDocStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|collections| {
                collections
                    .get(collection)
                    .map(Vec::len)
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl DocStore for MemoryDocStore {
    async fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put(&self, doc: Value, collection: &str) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|e| StoreError::Write(format!("lock poisoned: {e}")))?;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    async fn get_one(&self, filter: &Value, collection: &str) -> Result<Option<Value>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|e| StoreError::Query(format!("lock poisoned: {e}")))?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| matches_filter(doc, filter)).cloned()))
    }

    async fn query(
        &self,
        filter: &Value,
        sort: Option<(&str, SortOrder)>,
        limit: Option<usize>,
        collection: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|e| StoreError::Query(format!("lock poisoned: {e}")))?;
        let mut matched: Vec<Value> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some((field, order)) = sort {
            matched.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                );
                match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn ensure_index(&self, field: &str, collection: &str) -> Result<(), StoreError> {
        tracing::debug!(field, collection, "index hint accepted (linear scans)");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_and_get_one() {
        let store = MemoryDocStore::new();
        store
            .put(json!({ "uuid": "a", "index": 1 }), "outputs")
            .await
            .unwrap();

        let found = store
            .get_one(&json!({ "uuid": "a" }), "outputs")
            .await
            .unwrap();
        assert_eq!(found, Some(json!({ "uuid": "a", "index": 1 })));

        let missing = store
            .get_one(&json!({ "uuid": "b" }), "outputs")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_query_sort_and_limit() {
        let store = MemoryDocStore::new();
        for index in [2, 1, 3] {
            store
                .put(json!({ "uuid": "a", "index": index }), "outputs")
                .await
                .unwrap();
        }

        let newest = store
            .query(
                &json!({ "uuid": "a" }),
                Some(("index", SortOrder::Descending)),
                Some(1),
                "outputs",
            )
            .await
            .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0]["index"], json!(3));

        let all = store
            .query(
                &json!({ "uuid": "a" }),
                Some(("index", SortOrder::Ascending)),
                None,
                "outputs",
            )
            .await
            .unwrap();
        let indices: Vec<u64> = all.iter().filter_map(|d| d["index"].as_u64()).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_collections_are_disjoint() {
        let store = MemoryDocStore::new();
        store.put(json!({ "k": 1 }), "outputs").await.unwrap();
        store.put(json!({ "k": 2 }), "blobs").await.unwrap();

        assert_eq!(store.count("outputs"), 1);
        assert_eq!(store.count("blobs"), 1);
        let found = store.get_one(&json!({ "k": 2 }), "outputs").await.unwrap();
        assert!(found.is_none());
    }
}
