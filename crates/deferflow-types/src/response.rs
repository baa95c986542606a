//! The directive a running job hands back to the manager.
//!
//! A `Response` carries the job's output plus optional modifications to the
//! remaining schedule. Schedule changes are a tagged union, so a single
//! response can carry at most one of replace / detour / addition; combining
//! them is unrepresentable rather than rejected at runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::flow::FlowNode;

// ---------------------------------------------------------------------------
// ScheduleChange
// ---------------------------------------------------------------------------

/// New work a response grafts into the running schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ScheduleChange {
    /// Replace the current job's unborn successors: the grafted node's leaf
    /// output takes over the current uuid at `index + 1`, so downstream
    /// references keep pointing at the same identity.
    Replace(FlowNode),
    /// Insert work before every job that depended on the current one; the
    /// dependents wait for the detour's leaf output.
    Detour(FlowNode),
    /// Append work to the enclosing flow without any rewiring.
    Addition(FlowNode),
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// What a job returned, and what the manager should do about it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// The value placed in the store document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Auxiliary map persisted alongside the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_data: Option<Map<String, Value>>,

    /// At most one replace / detour / addition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleChange>,

    /// Skip every not-yet-started job that transitively depends on this one.
    #[serde(default)]
    pub stop_children: bool,

    /// Terminate the entire run after this job.
    #[serde(default)]
    pub stop_flow: bool,
}

impl Response {
    /// Normalise a bare return value into a response.
    pub fn from_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    pub fn with_stored_data(mut self, stored_data: Map<String, Value>) -> Self {
        self.stored_data = Some(stored_data);
        self
    }

    pub fn replace(node: impl Into<FlowNode>) -> Self {
        Self {
            schedule: Some(ScheduleChange::Replace(node.into())),
            ..Self::default()
        }
    }

    pub fn detour(node: impl Into<FlowNode>) -> Self {
        Self {
            schedule: Some(ScheduleChange::Detour(node.into())),
            ..Self::default()
        }
    }

    pub fn addition(node: impl Into<FlowNode>) -> Self {
        Self {
            schedule: Some(ScheduleChange::Addition(node.into())),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_replacement(mut self, node: impl Into<FlowNode>) -> Self {
        self.schedule = Some(ScheduleChange::Replace(node.into()));
        self
    }

    pub fn with_detour(mut self, node: impl Into<FlowNode>) -> Self {
        self.schedule = Some(ScheduleChange::Detour(node.into()));
        self
    }

    pub fn with_addition(mut self, node: impl Into<FlowNode>) -> Self {
        self.schedule = Some(ScheduleChange::Addition(node.into()));
        self
    }

    pub fn stop_children(mut self) -> Self {
        self.stop_children = true;
        self
    }

    pub fn stop_flow(mut self) -> Self {
        self.stop_flow = true;
        self
    }
}

impl From<Value> for Response {
    fn from(output: Value) -> Self {
        Self::from_output(output)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
