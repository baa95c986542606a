//! JSON-lines file store.
//!
//! One append-only `.jsonl` file per collection under a base directory.
//! Writes append a single line (atomic per document at the contract's
//! granularity); queries re-read the file, so this backend trades speed for
//! zero infrastructure. Suitable for durable local runs and debugging --
//! the file is greppable.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use deferflow_core::store::{DocStore, SortOrder, compare_values, matches_filter};
use deferflow_types::StoreError;
use serde_json::Value;

/// File-backed implementation of [`DocStore`].
pub struct FileDocStore {
    base_dir: PathBuf,
    /// Serialises appends so concurrent writers cannot interleave lines.
    write_lock: Mutex<()>,
}

impl FileDocStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_dir.join(format!("{collection}.jsonl"))
    }

    fn read_collection(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_jsonl(&path)
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<Value>, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::Query(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut docs = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| StoreError::Query(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let doc = serde_json::from_str(&line)
            .map_err(|e| StoreError::Query(format!("corrupt line in {}: {e}", path.display())))?;
        docs.push(doc);
    }
    Ok(docs)
}

impl DocStore for FileDocStore {
    async fn connect(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.base_dir).map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put(&self, doc: Value, collection: &str) -> Result<(), StoreError> {
        let line = serde_json::to_string(&doc).map_err(|e| StoreError::Write(e.to_string()))?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Write(format!("lock poisoned: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.collection_path(collection))
            .map_err(|e| StoreError::Write(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    async fn get_one(&self, filter: &Value, collection: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .read_collection(collection)?
            .into_iter()
            .find(|doc| matches_filter(doc, filter)))
    }

    async fn query(
        &self,
        filter: &Value,
        sort: Option<(&str, SortOrder)>,
        limit: Option<usize>,
        collection: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let mut matched: Vec<Value> = self
            .read_collection(collection)?
            .into_iter()
            .filter(|doc| matches_filter(doc, filter))
            .collect();
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
        tracing::debug!(field, collection, "index hint accepted (full scans)");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
