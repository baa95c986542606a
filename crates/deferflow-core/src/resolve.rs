//! Reference resolution over arbitrary nested input structures.
//!
//! Before a job runs, its args and kwargs are walked and every reference
//! sentinel is substituted with the referenced output, per the job's
//! missing-reference policy. Flow uuids resolve through their output
//! expressions (`expansions`) rather than the store, since flows never write
//! documents of their own.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use deferflow_types::codec;
use deferflow_types::{OnMissing, OutputReference, ReferenceError};
use serde_json::Value;
use uuid::Uuid;

use crate::store::job_store::{JobStore, OutputIndex, ResolveCache};

/// Substitute every reference sentinel in `value` with its resolved output.
///
/// `expansions` maps flow uuids to their output expressions; a reference to a
/// flow resolves by walking the expression, then applying the reference's
/// selector path to the result.
pub async fn resolve_value(
    store: &JobStore,
    value: &Value,
    on_missing: OnMissing,
    expansions: &HashMap<Uuid, Value>,
    cache: &mut ResolveCache,
) -> Result<Value, ReferenceError> {
    resolve_inner(store, value, on_missing, expansions, cache).await
}

/// Resolve a single reference against the store, selector path applied.
pub async fn resolve_one(
    store: &JobStore,
    reference: &OutputReference,
    on_missing: OnMissing,
    cache: &mut ResolveCache,
) -> Result<Value, ReferenceError> {
    let sentinel = reference.to_value();
    let expansions = HashMap::new();
    resolve_value(store, &sentinel, on_missing, &expansions, cache).await
}

fn resolve_inner<'a>(
    store: &'a JobStore,
    value: &'a Value,
    on_missing: OnMissing,
    expansions: &'a HashMap<Uuid, Value>,
    cache: &'a mut ResolveCache,
) -> Pin<Box<dyn Future<Output = Result<Value, ReferenceError>> + Send + 'a>> {
    Box::pin(async move {
        if codec::is_class::<OutputReference>(value) {
            if let Ok(reference) = codec::decode::<OutputReference>(value) {
                return resolve_reference(store, value, &reference, on_missing, expansions, cache)
                    .await;
            }
        }
        match value {
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(resolve_inner(store, item, on_missing, expansions, cache).await?);
                }
                Ok(Value::Array(resolved))
            }
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(
                        key.clone(),
                        resolve_inner(store, item, on_missing, expansions, cache).await?,
                    );
                }
                Ok(Value::Object(resolved))
            }
            scalar => Ok(scalar.clone()),
        }
    })
}

async fn resolve_reference(
    store: &JobStore,
    original: &Value,
    reference: &OutputReference,
    on_missing: OnMissing,
    expansions: &HashMap<Uuid, Value>,
    cache: &mut ResolveCache,
) -> Result<Value, ReferenceError> {
    // flow outputs are expressions, not stored artifacts
    if let Some(expression) = expansions.get(&reference.uuid()) {
        let expanded = resolve_inner(store, expression, on_missing, expansions, cache).await?;
        return reference.apply_path(&expanded);
    }

    let fetched = store
        .try_get_output(reference.uuid(), OutputIndex::Latest, on_missing, cache)
        .await?;

    match fetched {
        Some(output) => reference.apply_path(&output),
        None => match on_missing {
            OnMissing::Fail => Err(ReferenceError::Unresolvable {
                uuid: reference.uuid(),
            }),
            // keep the original sentinel, selector path included
            OnMissing::PassThrough => Ok(original.clone()),
            OnMissing::Null => Ok(Value::Null),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
//
// Resolution against a live store is exercised by the manager tests and the
// end-to-end suite in deferflow-store; here we only pin the pure parts.
