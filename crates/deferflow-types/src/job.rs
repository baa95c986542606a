//! Deferred function calls.
//!
//! A `Job` wraps a function call without executing it: the function is named
//! by a re-locatable `FunctionToken`, the captured arguments may embed
//! reference sentinels to any depth, and the job's identity is the
//! `(uuid, index)` pair. Execution lives in deferflow-core; this module is
//! data only.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::deep_merge;
use crate::reference::{OnMissing, OutputReference};

// ---------------------------------------------------------------------------
// FunctionToken
// ---------------------------------------------------------------------------

/// Serializable identity of a job's function: `(module path, qualified name)`.
///
/// Anonymous closures cannot be jobs; every function must be re-locatable
/// from its token after a round-trip through the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionToken {
    pub module: String,
    pub name: String,
}

impl FunctionToken {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for FunctionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

// ---------------------------------------------------------------------------
// JobConfig
// ---------------------------------------------------------------------------

/// Optional directives the manager honours when executing a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Resolve reference sentinels in the inputs before invocation.
    #[serde(default = "default_true")]
    pub resolve_references: bool,

    /// Policy when a referenced output is absent at resolve time.
    #[serde(default)]
    pub on_missing_references: OnMissing,

    /// Opaque settings forwarded to external executors.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub manager_config: Map<String, Value>,

    /// Hand the job store to the function at call time.
    #[serde(default)]
    pub expose_store_in_function: bool,
}

fn default_true() -> bool {
    true
}

impl JobConfig {
    pub fn new() -> Self {
        Self {
            resolve_references: true,
            on_missing_references: OnMissing::Fail,
            manager_config: Map::new(),
            expose_store_in_function: false,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// UpdateMode
// ---------------------------------------------------------------------------

/// How `update_kwargs` treats keys that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Replace the existing value wholesale.
    Replace,
    /// Merge objects key by key, recursing into nested objects.
    Merge,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A deferred call to a function, with captured arguments and an identity.
///
/// `index` starts at 1 and increments each time the job is replaced at
/// runtime; the uuid never changes, so downstream references stay valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub index: u32,
    pub name: String,
    pub function: FunctionToken,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Declarative description of the return type, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub config: JobConfig,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Uuids of enclosing flows, outermost last.
    #[serde(default)]
    pub hosts: Vec<Uuid>,
}

impl Job {
    /// Wrap a function call as a job. The uuid is assigned here and never
    /// changes afterwards, whatever happens to the function or arguments.
    pub fn new(function: FunctionToken, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        let name = function.name.clone();
        Self {
            uuid: Uuid::now_v7(),
            index: 1,
            name,
            function,
            args,
            kwargs,
            output_schema: None,
            config: JobConfig::new(),
            metadata: Map::new(),
            hosts: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// The canonical reference to this job's top-level result. Deeper
    /// references are built with `output().attr(..)` / `output().item(..)`.
    pub fn output(&self) -> OutputReference {
        OutputReference::new(self.uuid, self.index)
    }

    /// Deep-update the call's kwargs.
    ///
    /// `name_filter` selects by substring of the job name, `function_filter`
    /// by exact token; a job matching all supplied filters is updated. With
    /// `UpdateMode::Merge`, object values merge key by key; with
    /// `UpdateMode::Replace`, each updated key is replaced wholesale.
    pub fn update_kwargs(
        &mut self,
        update: &Map<String, Value>,
        name_filter: Option<&str>,
        function_filter: Option<&FunctionToken>,
        mode: UpdateMode,
    ) {
        if let Some(fragment) = name_filter {
            if !self.name.contains(fragment) {
                return;
            }
        }
        if let Some(token) = function_filter {
            if &self.function != token {
                return;
            }
        }
        match mode {
            UpdateMode::Merge => deep_merge(&mut self.kwargs, update),
            UpdateMode::Replace => {
                for (key, value) in update {
                    self.kwargs.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
