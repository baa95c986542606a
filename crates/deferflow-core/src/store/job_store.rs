//! Composite job store with field-routed blob splitting.
//!
//! `JobStore` wraps one docs store plus any number of auxiliary stores, each
//! routing a configured output field. On write, matched subtrees are replaced
//! by `BlobStub` sentinels and the payloads land in the routed store; on
//! read, stubs are re-hydrated by querying the named store and splicing the
//! payload back (skippable per query).
//!
//! `get_output` resolves "the latest output of uuid U" -- the document with
//! the greatest index -- and recurses into references embedded in the fetched
//! value (finite, because references form a DAG).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use deferflow_types::codec;
use deferflow_types::{BlobStub, OnMissing, OutputDocument, OutputReference, ReferenceError, StoreError};
use serde_json::{Value, json};
use uuid::Uuid;

use super::{DynDocStore, SortOrder};
use crate::resolve;

/// Collection holding output documents.
pub const OUTPUTS_COLLECTION: &str = "outputs";

/// Collection holding split-out payloads in auxiliary stores.
pub const BLOBS_COLLECTION: &str = "blobs";

// ---------------------------------------------------------------------------
// OutputIndex
// ---------------------------------------------------------------------------

/// Which index of a uuid's output history to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputIndex {
    /// The document with the greatest index.
    Latest,
    /// A specific index.
    Exact(u32),
}

// ---------------------------------------------------------------------------
// ResolveCache
// ---------------------------------------------------------------------------

/// Run-scoped memo of resolved outputs, keyed by `(uuid, index)`.
///
/// `latest` tracks which index answered a latest-output lookup; the manager
/// invalidates it whenever a new document lands for a uuid, since documents
/// are immutable per `(uuid, index)` but "latest" moves.
#[derive(Debug, Default)]
pub struct ResolveCache {
    values: HashMap<(Uuid, u32), Value>,
    latest: HashMap<Uuid, u32>,
}

impl ResolveCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, uuid: Uuid, which: OutputIndex) -> Option<&Value> {
        let index = match which {
            OutputIndex::Exact(index) => index,
            OutputIndex::Latest => *self.latest.get(&uuid)?,
        };
        self.values.get(&(uuid, index))
    }

    fn remember(&mut self, uuid: Uuid, index: u32, value: Value, is_latest: bool) {
        if is_latest {
            self.latest.insert(uuid, index);
        }
        self.values.insert((uuid, index), value);
    }

    /// Forget which index is the latest for `uuid`. Exact entries stay valid.
    pub fn invalidate_latest(&mut self, uuid: Uuid) {
        self.latest.remove(&uuid);
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// One auxiliary store and the output field it captures.
struct AdditionalStore {
    name: String,
    field: String,
    store: DynDocStore,
}

/// The composite document store the engine persists outputs to.
pub struct JobStore {
    docs: DynDocStore,
    additional: Vec<AdditionalStore>,
}

impl JobStore {
    pub fn new(docs: DynDocStore) -> Self {
        Self {
            docs,
            additional: Vec::new(),
        }
    }

    /// Route every output field named `field` into `store`, registered under
    /// `name` (the name recorded in blob stubs).
    pub fn with_additional(
        mut self,
        name: impl Into<String>,
        field: impl Into<String>,
        store: DynDocStore,
    ) -> Self {
        self.additional.push(AdditionalStore {
            name: name.into(),
            field: field.into(),
            store,
        });
        self
    }

    /// Open every backend and declare the indexed fields.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.docs.connect_boxed().await?;
        self.docs
            .ensure_index_boxed("uuid", OUTPUTS_COLLECTION)
            .await?;
        self.docs
            .ensure_index_boxed("index", OUTPUTS_COLLECTION)
            .await?;
        for aux in &self.additional {
            aux.store.connect_boxed().await?;
            aux.store
                .ensure_index_boxed("blob_uuid", BLOBS_COLLECTION)
                .await?;
        }
        Ok(())
    }

    /// Close every backend.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.docs.close_boxed().await?;
        for aux in &self.additional {
            aux.store.close_boxed().await?;
        }
        Ok(())
    }

    /// Persist an output document, splitting routed fields out first so a
    /// reader never sees a stub without its payload.
    pub async fn put_document(&self, doc: &OutputDocument) -> Result<(), StoreError> {
        let mut value = doc.to_value();
        for aux in &self.additional {
            let mut extracted = Vec::new();
            if let Some(output) = value.get_mut("output") {
                split_field(output, &aux.field, &aux.name, &mut extracted);
            }
            for (blob_uuid, payload) in extracted {
                tracing::debug!(
                    uuid = %doc.uuid,
                    store = aux.name.as_str(),
                    field = aux.field.as_str(),
                    %blob_uuid,
                    "splitting output field to auxiliary store"
                );
                let blob = json!({ "blob_uuid": blob_uuid, "data": payload });
                aux.store.put_boxed(blob, BLOBS_COLLECTION).await?;
            }
        }
        self.docs.put_boxed(value, OUTPUTS_COLLECTION).await
    }

    /// First document matching `filter`; with `load`, blob stubs in the
    /// output are re-hydrated.
    pub async fn get_one_document(
        &self,
        filter: &Value,
        load: bool,
    ) -> Result<Option<OutputDocument>, StoreError> {
        let Some(mut raw) = self.docs.get_one_boxed(filter, OUTPUTS_COLLECTION).await? else {
            return Ok(None);
        };
        if load {
            if let Some(output) = raw.get_mut("output") {
                self.hydrate_value(output).await?;
            }
        }
        OutputDocument::from_value(raw)
            .map(Some)
            .map_err(|e| StoreError::Query(format!("malformed output document: {e}")))
    }

    /// Documents matching `filter`, optionally sorted and truncated; blob
    /// stubs are re-hydrated when `load` is set.
    pub async fn query_documents(
        &self,
        filter: &Value,
        sort: Option<(&str, SortOrder)>,
        limit: Option<usize>,
        load: bool,
    ) -> Result<Vec<OutputDocument>, StoreError> {
        let raw = self
            .docs
            .query_boxed(filter, sort, limit, OUTPUTS_COLLECTION)
            .await?;
        let mut documents = Vec::with_capacity(raw.len());
        for mut value in raw {
            if load {
                if let Some(output) = value.get_mut("output") {
                    self.hydrate_value(output).await?;
                }
            }
            let doc = OutputDocument::from_value(value)
                .map_err(|e| StoreError::Query(format!("malformed output document: {e}")))?;
            documents.push(doc);
        }
        Ok(documents)
    }

    /// Resolve the output of `uuid`, or `None` when no document exists.
    ///
    /// Fetches the requested document (largest index for `Latest`),
    /// re-hydrates blob stubs, then resolves references embedded in the
    /// value; `on_missing` governs those *embedded* references. Absence of
    /// the document itself is signalled by `Ok(None)` so callers apply their
    /// own policy. Memoised in `cache` by `(uuid, index)`.
    pub async fn try_get_output(
        &self,
        uuid: Uuid,
        which: OutputIndex,
        on_missing: OnMissing,
        cache: &mut ResolveCache,
    ) -> Result<Option<Value>, ReferenceError> {
        if let Some(hit) = cache.lookup(uuid, which) {
            return Ok(Some(hit.clone()));
        }

        let filter = match which {
            OutputIndex::Latest => json!({ "uuid": uuid }),
            OutputIndex::Exact(index) => json!({ "uuid": uuid, "index": index }),
        };
        let mut docs = self
            .docs
            .query_boxed(
                &filter,
                Some(("index", SortOrder::Descending)),
                Some(1),
                OUTPUTS_COLLECTION,
            )
            .await
            .map_err(ReferenceError::Store)?;

        let Some(doc) = docs.pop() else {
            return Ok(None);
        };

        let index = doc.get("index").and_then(Value::as_u64).unwrap_or(1) as u32;
        let mut output = doc.get("output").cloned().unwrap_or(Value::Null);
        self.hydrate_value(&mut output)
            .await
            .map_err(ReferenceError::Store)?;

        // outputs may reference further outputs (aggregation jobs)
        let expansions = HashMap::new();
        let resolved =
            resolve::resolve_value(self, &output, on_missing, &expansions, cache).await?;

        cache.remember(
            uuid,
            index,
            resolved.clone(),
            matches!(which, OutputIndex::Latest),
        );
        Ok(Some(resolved))
    }

    /// [`try_get_output`](Self::try_get_output) with the missing-document
    /// policy applied: fail, substitute the bare reference sentinel, or
    /// substitute null.
    pub async fn get_output(
        &self,
        uuid: Uuid,
        which: OutputIndex,
        on_missing: OnMissing,
        cache: &mut ResolveCache,
    ) -> Result<Value, ReferenceError> {
        match self.try_get_output(uuid, which, on_missing, cache).await? {
            Some(output) => Ok(output),
            None => match on_missing {
                OnMissing::Fail => Err(ReferenceError::Unresolvable { uuid }),
                OnMissing::PassThrough => {
                    let index = match which {
                        OutputIndex::Exact(index) => index,
                        OutputIndex::Latest => 1,
                    };
                    Ok(OutputReference::new(uuid, index).to_value())
                }
                OnMissing::Null => Ok(Value::Null),
            },
        }
    }

    /// Splice auxiliary-store payloads back over every blob stub in `value`.
    pub fn hydrate_value<'a>(
        &'a self,
        value: &'a mut Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            if codec::is_class::<BlobStub>(value) {
                if let Ok(stub) = codec::decode::<BlobStub>(value) {
                    let payload = self.load_blob(&stub).await?;
                    *value = payload;
                    return Ok(());
                }
            }
            match value {
                Value::Array(items) => {
                    for item in items {
                        self.hydrate_value(item).await?;
                    }
                }
                Value::Object(map) => {
                    for item in map.values_mut() {
                        self.hydrate_value(item).await?;
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }

    async fn load_blob(&self, stub: &BlobStub) -> Result<Value, StoreError> {
        let aux = self
            .additional
            .iter()
            .find(|aux| aux.name == stub.store)
            .ok_or_else(|| StoreError::UnknownAuxiliaryStore(stub.store.clone()))?;
        let filter = json!({ "blob_uuid": stub.blob_uuid });
        let blob = aux
            .store
            .get_one_boxed(&filter, BLOBS_COLLECTION)
            .await?
            .ok_or_else(|| {
                StoreError::Query(format!(
                    "blob {} missing from auxiliary store '{}'",
                    stub.blob_uuid, stub.store
                ))
            })?;
        Ok(blob.get("data").cloned().unwrap_or(Value::Null))
    }
}

/// Replace every subtree under a key named `field` with a blob stub,
/// collecting the extracted payloads.
fn split_field(
    value: &mut Value,
    field: &str,
    store_name: &str,
    extracted: &mut Vec<(Uuid, Value)>,
) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if key.as_str() == field {
                    let blob_uuid = Uuid::now_v7();
                    let payload = std::mem::replace(
                        item,
                        codec::encode(&BlobStub {
                            blob_uuid,
                            store: store_name.to_string(),
                        }),
                    );
                    extracted.push((blob_uuid, payload));
                } else {
                    split_field(item, field, store_name, extracted);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                split_field(item, field, store_name, extracted);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
