//! Composable collections of jobs.
//!
//! A `Flow` is a recursively nested sequence of jobs and sub-flows with its
//! own identity, an optional output expression composed of member references,
//! and an ordering mode. Flows are constructed eagerly but never executed at
//! construction time; scheduling lives in deferflow-core.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::FlowError;
use crate::job::{FunctionToken, Job, UpdateMode};
use crate::reference::find_references;

// ---------------------------------------------------------------------------
// FlowOrder
// ---------------------------------------------------------------------------

/// How the members of a flow are ordered at execution time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOrder {
    /// Dependency (topological) order, ties broken by declaration order.
    #[default]
    Auto,
    /// Declaration order, even for independent jobs.
    Linear,
}

// ---------------------------------------------------------------------------
// FlowNode
// ---------------------------------------------------------------------------

/// One member of a flow: a job or a nested sub-flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum FlowNode {
    Job(Job),
    Flow(Flow),
}

impl FlowNode {
    /// The uuid of the member itself (job uuid or flow uuid).
    pub fn uuid(&self) -> Uuid {
        match self {
            FlowNode::Job(job) => job.uuid,
            FlowNode::Flow(flow) => flow.uuid,
        }
    }
}

impl From<Job> for FlowNode {
    fn from(job: Job) -> Self {
        FlowNode::Job(job)
    }
}

impl From<Flow> for FlowNode {
    fn from(flow: Flow) -> Self {
        FlowNode::Flow(flow)
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// A recursively nested collection of jobs and sub-flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub uuid: Uuid,
    pub name: String,
    jobs: Vec<FlowNode>,
    /// Output expression over member references, or `None`. Never stored as
    /// its own artifact: substituted into downstream inputs at read time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub order: FlowOrder,
    /// Uuids of enclosing flows, outermost last.
    #[serde(default)]
    pub hosts: Vec<Uuid>,
}

impl Flow {
    /// Compose jobs and sub-flows into a flow, preserving the given order.
    ///
    /// Stamps this flow's uuid onto the `hosts` list of every transitive
    /// member and rejects duplicate uuids anywhere in the closure.
    pub fn new(
        name: impl Into<String>,
        jobs: Vec<FlowNode>,
        output: Option<Value>,
        order: FlowOrder,
    ) -> Result<Self, FlowError> {
        let uuid = Uuid::now_v7();
        let mut flow = Self {
            uuid,
            name: name.into(),
            jobs,
            output,
            order,
            hosts: Vec::new(),
        };
        for node in &mut flow.jobs {
            stamp_host(node, uuid);
        }

        let mut seen = HashSet::new();
        seen.insert(uuid);
        for node in &flow.jobs {
            check_duplicates(node, &mut seen)?;
        }
        Ok(flow)
    }

    /// Members in declaration order.
    pub fn jobs(&self) -> &[FlowNode] {
        &self.jobs
    }

    /// Jobs in the transitive closure, in declaration order.
    pub fn iter_jobs(&self) -> impl Iterator<Item = &Job> {
        let mut collected = Vec::new();
        collect_jobs(&self.jobs, &mut collected);
        collected.into_iter()
    }

    /// Every uuid in the transitive closure: member jobs, sub-flows, and the
    /// flow itself.
    pub fn closure_uuids(&self) -> HashSet<Uuid> {
        let mut uuids = HashSet::new();
        uuids.insert(self.uuid);
        collect_uuids(&self.jobs, &mut uuids);
        uuids
    }

    /// Map from each flow uuid in the closure (this flow included) to the
    /// uuids of the jobs it transitively contains. Used to expand references
    /// that point at a sub-flow rather than a job.
    pub fn flow_memberships(&self) -> HashMap<Uuid, HashSet<Uuid>> {
        let mut memberships = HashMap::new();
        let mine = collect_membership(&self.jobs, &mut memberships);
        memberships.insert(self.uuid, mine);
        memberships
    }

    /// Output expressions of every flow in the closure that declares one,
    /// keyed by flow uuid.
    pub fn output_expressions(&self) -> HashMap<Uuid, Value> {
        let mut expressions = HashMap::new();
        if let Some(output) = &self.output {
            expressions.insert(self.uuid, output.clone());
        }
        collect_outputs(&self.jobs, &mut expressions);
        expressions
    }

    /// Adjacency list of the closure: an edge `A -> B` exists iff any
    /// reference inside B's arguments has uuid `A`.
    pub fn adjacency(&self) -> HashMap<Uuid, HashSet<Uuid>> {
        let mut edges: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for job in self.iter_jobs() {
            for reference in job_references(job) {
                edges.entry(reference).or_default().insert(job.uuid);
            }
        }
        edges
    }

    /// Deep-update the kwargs of every job in the closure; see
    /// [`Job::update_kwargs`] for filter and mode semantics.
    pub fn update_kwargs(
        &mut self,
        update: &Map<String, Value>,
        name_filter: Option<&str>,
        function_filter: Option<&FunctionToken>,
        mode: UpdateMode,
    ) {
        for node in &mut self.jobs {
            match node {
                FlowNode::Job(job) => {
                    job.update_kwargs(update, name_filter, function_filter, mode)
                }
                FlowNode::Flow(flow) => {
                    flow.update_kwargs(update, name_filter, function_filter, mode)
                }
            }
        }
    }
}

/// Uuids of every reference embedded in a job's args and kwargs.
pub fn job_references(job: &Job) -> HashSet<Uuid> {
    let mut uuids = HashSet::new();
    for arg in &job.args {
        for reference in find_references(arg) {
            uuids.insert(reference.uuid());
        }
    }
    for value in job.kwargs.values() {
        for reference in find_references(value) {
            uuids.insert(reference.uuid());
        }
    }
    uuids
}

fn stamp_host(node: &mut FlowNode, host: Uuid) {
    match node {
        FlowNode::Job(job) => job.hosts.push(host),
        FlowNode::Flow(flow) => {
            flow.hosts.push(host);
            for inner in &mut flow.jobs {
                stamp_host(inner, host);
            }
        }
    }
}

fn check_duplicates(node: &FlowNode, seen: &mut HashSet<Uuid>) -> Result<(), FlowError> {
    if !seen.insert(node.uuid()) {
        return Err(FlowError::DuplicateUuid(node.uuid()));
    }
    if let FlowNode::Flow(flow) = node {
        for inner in &flow.jobs {
            check_duplicates(inner, seen)?;
        }
    }
    Ok(())
}

fn collect_jobs<'a>(nodes: &'a [FlowNode], out: &mut Vec<&'a Job>) {
    for node in nodes {
        match node {
            FlowNode::Job(job) => out.push(job),
            FlowNode::Flow(flow) => collect_jobs(&flow.jobs, out),
        }
    }
}

fn collect_uuids(nodes: &[FlowNode], out: &mut HashSet<Uuid>) {
    for node in nodes {
        out.insert(node.uuid());
        if let FlowNode::Flow(flow) = node {
            collect_uuids(&flow.jobs, out);
        }
    }
}

fn collect_membership(
    nodes: &[FlowNode],
    memberships: &mut HashMap<Uuid, HashSet<Uuid>>,
) -> HashSet<Uuid> {
    let mut jobs = HashSet::new();
    for node in nodes {
        match node {
            FlowNode::Job(job) => {
                jobs.insert(job.uuid);
            }
            FlowNode::Flow(flow) => {
                let inner = collect_membership(&flow.jobs, memberships);
                jobs.extend(inner.iter().copied());
                memberships.insert(flow.uuid, inner);
            }
        }
    }
    jobs
}

fn collect_outputs(nodes: &[FlowNode], expressions: &mut HashMap<Uuid, Value>) {
    for node in nodes {
        if let FlowNode::Flow(flow) = node {
            if let Some(output) = &flow.output {
                expressions.insert(flow.uuid, output.clone());
            }
            collect_outputs(&flow.jobs, expressions);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
