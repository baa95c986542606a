//! Document store contract.
//!
//! Two traits are provided:
//! - `DocStore`: Uses RPITIT (`impl Future`) for zero-cost async in concrete
//!   backends.
//! - `BoxDocStore`: Object-safe version using `Pin<Box<dyn Future>>` for
//!   dynamic dispatch in [`job_store::JobStore`], which mixes backends of
//!   different concrete types (docs store plus auxiliary stores).
//!
//! Filters are JSON objects of field-equality terms; `put` is assumed atomic
//! per document, and any further concurrency safety is the backend's.

pub mod job_store;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use deferflow_types::StoreError;
use serde_json::Value;

/// Direction for a single-field sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Trait for document store backends (memory, file, database, object store).
///
/// This trait uses RPITIT for zero-cost async. For dynamic dispatch
/// (trait objects), see [`BoxDocStore`].
pub trait DocStore: Send + Sync {
    /// Open the backend; idempotent.
    fn connect(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Release backend resources; idempotent.
    fn close(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Write one document to a collection. Atomic per document.
    fn put(
        &self,
        doc: Value,
        collection: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// First document matching every field of `filter`, or `None`.
    fn get_one(
        &self,
        filter: &Value,
        collection: &str,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// All documents matching `filter`, optionally sorted on one field and
    /// truncated to `limit`.
    fn query(
        &self,
        filter: &Value,
        sort: Option<(&str, SortOrder)>,
        limit: Option<usize>,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<Value>, StoreError>> + Send;

    /// Declare that `field` will be queried on; backends may build an index
    /// or ignore the hint.
    fn ensure_index(
        &self,
        field: &str,
        collection: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Object-safe version of [`DocStore`] for dynamic dispatch.
///
/// A blanket implementation is provided for all types implementing
/// `DocStore`, so backends only ever implement the RPITIT trait.
pub trait BoxDocStore: Send + Sync {
    fn connect_boxed<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn close_boxed<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn put_boxed<'a>(
        &'a self,
        doc: Value,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn get_one_boxed<'a>(
        &'a self,
        filter: &'a Value,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, StoreError>> + Send + 'a>>;

    fn query_boxed<'a>(
        &'a self,
        filter: &'a Value,
        sort: Option<(&'a str, SortOrder)>,
        limit: Option<usize>,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>, StoreError>> + Send + 'a>>;

    fn ensure_index_boxed<'a>(
        &'a self,
        field: &'a str,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

impl<T: DocStore> BoxDocStore for T {
    fn connect_boxed<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.connect())
    }

    fn close_boxed<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.close())
    }

    fn put_boxed<'a>(
        &'a self,
        doc: Value,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.put(doc, collection))
    }

    fn get_one_boxed<'a>(
        &'a self,
        filter: &'a Value,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, StoreError>> + Send + 'a>> {
        Box::pin(self.get_one(filter, collection))
    }

    fn query_boxed<'a>(
        &'a self,
        filter: &'a Value,
        sort: Option<(&'a str, SortOrder)>,
        limit: Option<usize>,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>, StoreError>> + Send + 'a>> {
        Box::pin(self.query(filter, sort, limit, collection))
    }

    fn ensure_index_boxed<'a>(
        &'a self,
        field: &'a str,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.ensure_index(field, collection))
    }
}

/// Type alias for a dynamically-dispatched document store.
pub type DynDocStore = Arc<dyn BoxDocStore>;

/// Whether every field of `filter` equals the corresponding field of `doc`.
///
/// Shared by backends implementing the equality-filter query contract.
pub fn matches_filter(doc: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(terms) => terms.iter().all(|(field, expected)| doc.get(field) == Some(expected)),
        None => true,
    }
}

/// Total order over JSON values for single-field sorts.
///
/// Numbers compare numerically, strings lexicographically; across kinds the
/// order is null < bool < number < string < array < object. Backends use
/// this to implement the `sort` parameter of [`DocStore::query`].
pub fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
