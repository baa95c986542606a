//! Function registry: re-locating job functions from their tokens.
//!
//! Jobs carry a `FunctionToken` instead of a callable, so the engine needs a
//! registry mapping tokens back to executable functions. Registration is a
//! startup-time discipline; an unknown token only surfaces when the manager
//! reaches the job.
//!
//! Job functions are trait objects returning boxed futures, so a single
//! registry mixes sync closures, async functions, and stateful handlers. A
//! blanket implementation adapts plain `Fn` closures.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use deferflow_types::{FunctionToken, Response};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::store::job_store::JobStore;

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// Failure raised by a job function.
///
/// The manager records it against the job's `(uuid, index)` and treats the
/// job's dependents as stopped; it never recovers on the user's behalf.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// FunctionInput
// ---------------------------------------------------------------------------

/// What a job function receives: resolved positional and keyword arguments,
/// plus the job store when the job's config exposes it.
pub struct FunctionInput<'a> {
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
    pub store: Option<&'a JobStore>,
}

impl<'a> FunctionInput<'a> {
    /// Positional argument by index, or null when absent.
    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&Value::Null)
    }

    /// Keyword argument by name, or null when absent.
    pub fn kwarg(&self, name: &str) -> &Value {
        self.kwargs.get(name).unwrap_or(&Value::Null)
    }
}

// ---------------------------------------------------------------------------
// JobFunction
// ---------------------------------------------------------------------------

/// An executable job function.
///
/// Object-safe; returns a boxed future so implementations may be async.
/// Plain sync closures adapt automatically through the blanket impl.
pub trait JobFunction: Send + Sync {
    fn call<'a>(
        &'a self,
        input: FunctionInput<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response, JobError>> + Send + 'a>>;
}

impl<F> JobFunction for F
where
    F: for<'a> Fn(FunctionInput<'a>) -> Result<Response, JobError> + Send + Sync,
{
    fn call<'a>(
        &'a self,
        input: FunctionInput<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Response, JobError>> + Send + 'a>> {
        let result = (self)(input);
        Box::pin(async move { result })
    }
}

// ---------------------------------------------------------------------------
// FunctionRegistry
// ---------------------------------------------------------------------------

/// Maps function tokens to executable functions.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<FunctionToken, Arc<dyn JobFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under its token; later registrations replace
    /// earlier ones.
    pub fn register(&mut self, token: FunctionToken, function: impl JobFunction + 'static) {
        self.functions.insert(token, Arc::new(function));
    }

    /// Register a plain sync closure. The explicit `Fn` bound lets closure
    /// signatures infer without annotations.
    pub fn register_fn<F>(&mut self, token: FunctionToken, function: F)
    where
        F: for<'a> Fn(FunctionInput<'a>) -> Result<Response, JobError> + Send + Sync + 'static,
    {
        self.register(token, function);
    }

    pub fn get(&self, token: &FunctionToken) -> Option<Arc<dyn JobFunction>> {
        self.functions.get(token).cloned()
    }

    pub fn contains(&self, token: &FunctionToken) -> bool {
        self.functions.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
