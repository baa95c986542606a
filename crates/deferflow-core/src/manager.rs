//! The execution engine: linearizes a flow, resolves inputs, invokes jobs,
//! and applies each response's directive to the remaining schedule.
//!
//! # Execution flow
//!
//! 1. Linearize the flow into a schedule (jobs, dependencies, declaration
//!    order) and validate it (acyclic, linear-order consistent, external
//!    references resolvable).
//! 2. Pick the next ready job honouring the flow's order.
//! 3. Resolve its inputs through the job store (flow-uuid references
//!    substitute the flow's output expression first).
//! 4. Invoke the function -- at most once per `(uuid, index)` -- and write
//!    the output document.
//! 5. Interpret the response: graft replace/detour/addition work, mark
//!    stop-children, or terminate on stop-flow.
//! 6. Repeat until no job is ready.
//!
//! Execution is single-threaded and cooperative: exactly one job runs at a
//! time per manager, and a failed job only stops its transitive dependents.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use deferflow_types::reference::rename_references;
use deferflow_types::{
    Flow, FlowError, FlowNode, FlowOrder, FunctionToken, Job, OutputDocument, ReferenceError,
    Response, ScheduleChange, StoreError,
};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::graph;
use crate::registry::{FunctionInput, FunctionRegistry};
use crate::resolve;
use crate::store::job_store::{JobStore, ResolveCache};

// ---------------------------------------------------------------------------
// ManagerConfig
// ---------------------------------------------------------------------------

/// Engine-level settings, threaded through construction rather than ambient
/// state.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Abort the run on the first job failure instead of continuing with
    /// work that does not depend on the failed job.
    pub stop_on_failure: bool,
}

// ---------------------------------------------------------------------------
// ManagerError
// ---------------------------------------------------------------------------

/// Errors surfaced by a workflow run.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// A job's inputs could not be resolved against the store.
    #[error("input resolution for job '{name}' ({uuid}) failed: {source}")]
    InputResolution {
        uuid: Uuid,
        name: String,
        #[source]
        source: ReferenceError,
    },

    /// The job's function raised.
    #[error("job '{name}' ({uuid}, index {index}) failed: {message}")]
    JobFailed {
        uuid: Uuid,
        index: u32,
        name: String,
        message: String,
    },

    /// A response's directive is structurally invalid. Fatal to the run.
    #[error("invalid response from job {uuid}: {reason}")]
    InvalidResponse { uuid: Uuid, reason: String },

    /// No function is registered under the job's token.
    #[error("function '{0}' is not registered")]
    UnknownFunction(FunctionToken),

    /// Flow construction or validation failure.
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Backend failure, propagated unchanged. Fatal.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Outcome of a workflow run, with partial success surfaced.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Every response, keyed by job uuid then index.
    pub responses: HashMap<Uuid, BTreeMap<u32, Response>>,
    /// Jobs bypassed by stop-children or by a failed dependency.
    pub skipped: HashSet<Uuid>,
    /// Failed jobs with their error messages.
    pub failed: HashMap<Uuid, String>,
    /// The first error encountered, preserved for the caller.
    pub error: Option<ManagerError>,
}

impl RunReport {
    /// The recorded output of a job's latest executed index, if any.
    pub fn output_of(&self, uuid: Uuid) -> Option<&Value> {
        self.responses
            .get(&uuid)?
            .values()
            .next_back()?
            .output
            .as_ref()
    }
}

// ---------------------------------------------------------------------------
// Schedule (internal state)
// ---------------------------------------------------------------------------

/// Mutable scheduling state for one run.
struct Schedule {
    /// Jobs not yet executed, keyed by uuid (latest index per uuid).
    jobs: HashMap<Uuid, Job>,
    /// Declaration order, grafts included.
    sequence: Vec<Uuid>,
    /// Job-level dependency uuids per job.
    deps: HashMap<Uuid, HashSet<Uuid>>,
    /// Reverse edges of `deps`.
    dependents: HashMap<Uuid, HashSet<Uuid>>,
    /// Uuids whose latest scheduled index has completed.
    completed: HashSet<Uuid>,
    /// Executed `(uuid, index)` pairs; the at-most-once guard.
    done: HashSet<(Uuid, u32)>,
    /// Uuids bypassed by stop-children or failed dependencies.
    skipped: HashSet<Uuid>,
    /// Every uuid ever scheduled (collision detection for grafts).
    known: HashSet<Uuid>,
    /// Flow uuid -> transitively contained job uuids.
    memberships: HashMap<Uuid, HashSet<Uuid>>,
    /// Flow uuid -> output expression.
    expressions: HashMap<Uuid, Value>,
    order: FlowOrder,
}

impl Schedule {
    fn is_ready(&self, uuid: Uuid) -> bool {
        self.deps
            .get(&uuid)
            .map(|deps| deps.iter().all(|dep| self.completed.contains(dep)))
            .unwrap_or(true)
    }

    /// Next job to run: the first schedulable uuid in declaration order.
    ///
    /// `Linear` is strict: a blocked head ends the run (which validation
    /// rules out for well-formed schedules). `Auto` scans past blocked jobs.
    fn pick_next(&self) -> Option<Uuid> {
        for uuid in &self.sequence {
            if !self.jobs.contains_key(uuid) || self.skipped.contains(uuid) {
                continue;
            }
            match self.order {
                FlowOrder::Linear => return self.is_ready(*uuid).then_some(*uuid),
                FlowOrder::Auto => {
                    if self.is_ready(*uuid) {
                        return Some(*uuid);
                    }
                }
            }
        }
        None
    }

    fn add_job(&mut self, job: Job, deps: HashSet<Uuid>) {
        for dep in &deps {
            self.dependents.entry(*dep).or_default().insert(job.uuid);
        }
        self.known.insert(job.uuid);
        self.deps.insert(job.uuid, deps);
        self.jobs.insert(job.uuid, job);
    }

    /// Mark every not-yet-started transitive dependent of `uuid` skipped.
    fn skip_dependents(&mut self, uuid: Uuid) -> usize {
        let mut count = 0;
        for dependent in graph::transitive_dependents(uuid, &self.dependents) {
            if self.jobs.contains_key(&dependent) && self.skipped.insert(dependent) {
                count += 1;
            }
        }
        count
    }

    /// Declaration sequence restricted to not-yet-executed jobs.
    fn remaining_sequence(&self) -> Vec<Uuid> {
        self.sequence
            .iter()
            .filter(|uuid| self.jobs.contains_key(uuid))
            .copied()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Executes one flow at a time against a job store and function registry.
///
/// Not re-entrant: a job's function must not invoke the manager against the
/// same store connection.
pub struct Manager {
    store: JobStore,
    registry: FunctionRegistry,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(store: JobStore, registry: FunctionRegistry) -> Self {
        Self {
            store,
            registry,
            config: ManagerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// The composite store this manager writes to.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Execute a flow to completion.
    ///
    /// Returns `Err` only for fatal conditions (store failures, structurally
    /// invalid responses, invalid flows); job failures are recorded in the
    /// report and execution continues with non-dependent work.
    pub async fn run(&mut self, flow: Flow) -> Result<RunReport, ManagerError> {
        self.store.connect().await?;

        let flow_name = flow.name.clone();
        let mut schedule = self.build_schedule(flow).await?;
        let mut cache = ResolveCache::new();
        let mut report = RunReport::default();

        tracing::info!(
            flow = flow_name.as_str(),
            jobs = schedule.jobs.len(),
            order = ?schedule.order,
            "starting flow execution"
        );

        while let Some(uuid) = schedule.pick_next() {
            let job = match schedule.jobs.remove(&uuid) {
                Some(job) => job,
                None => continue,
            };
            if !schedule.done.insert((job.uuid, job.index)) {
                // already executed at this index
                continue;
            }

            tracing::debug!(
                job = job.name.as_str(),
                uuid = %job.uuid,
                index = job.index,
                "running job"
            );

            // resolve inputs
            let resolved = if job.config.resolve_references {
                self.resolve_inputs(&job, &schedule.expressions, &mut cache)
                    .await
            } else {
                Ok((job.args.clone(), job.kwargs.clone()))
            };
            let (args, kwargs) = match resolved {
                Ok(pair) => pair,
                Err(source) => {
                    let error = ManagerError::InputResolution {
                        uuid: job.uuid,
                        name: job.name.clone(),
                        source,
                    };
                    self.record_failure(&mut schedule, &mut report, &job, error);
                    if self.config.stop_on_failure {
                        break;
                    }
                    continue;
                }
            };

            // locate the function
            let Some(function) = self.registry.get(&job.function) else {
                let error = ManagerError::UnknownFunction(job.function.clone());
                self.record_failure(&mut schedule, &mut report, &job, error);
                if self.config.stop_on_failure {
                    break;
                }
                continue;
            };

            // invoke
            let input = FunctionInput {
                args: &args,
                kwargs: &kwargs,
                store: job.config.expose_store_in_function.then_some(&self.store),
            };
            let response = match function.call(input).await {
                Ok(response) => response,
                Err(job_error) => {
                    let error = ManagerError::JobFailed {
                        uuid: job.uuid,
                        index: job.index,
                        name: job.name.clone(),
                        message: job_error.to_string(),
                    };
                    self.record_failure(&mut schedule, &mut report, &job, error);
                    if self.config.stop_on_failure {
                        break;
                    }
                    continue;
                }
            };

            // persist before anything downstream can resolve against it
            let document = OutputDocument {
                uuid: job.uuid,
                index: job.index,
                output: response.output.clone().unwrap_or(Value::Null),
                completed_at: Utc::now(),
                metadata: job.metadata.clone(),
                hosts: job.hosts.clone(),
                name: job.name.clone(),
                stored_data: response.stored_data.clone(),
            };
            self.store.put_document(&document).await?;
            cache.invalidate_latest(job.uuid);
            schedule.completed.insert(job.uuid);

            report
                .responses
                .entry(job.uuid)
                .or_default()
                .insert(job.index, response.clone());

            // interpret the directive
            if let Some(change) = response.schedule {
                self.apply_change(&mut schedule, &job, change)?;
            }
            if response.stop_children {
                let stopped = schedule.skip_dependents(job.uuid);
                tracing::debug!(
                    uuid = %job.uuid,
                    stopped,
                    "stop_children: skipping dependents"
                );
            }
            if response.stop_flow {
                tracing::info!(uuid = %job.uuid, "stop_flow: terminating run");
                break;
            }
        }

        report.skipped = schedule.skipped;
        tracing::info!(
            flow = flow_name.as_str(),
            executed = schedule.done.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "flow execution finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Schedule construction
    // -----------------------------------------------------------------------

    async fn build_schedule(&self, flow: Flow) -> Result<Schedule, ManagerError> {
        let memberships = flow.flow_memberships();
        let expressions = flow.output_expressions();
        let order = flow.order;

        let jobs: Vec<Job> = flow.iter_jobs().cloned().collect();
        let known: HashSet<Uuid> = jobs.iter().map(|job| job.uuid).collect();
        let sequence: Vec<Uuid> = jobs.iter().map(|job| job.uuid).collect();

        // external references must already be resolvable
        for job in &jobs {
            for referenced in deferflow_types::flow::job_references(job) {
                if known.contains(&referenced) || memberships.contains_key(&referenced) {
                    continue;
                }
                let present = self
                    .store
                    .get_one_document(&json!({ "uuid": referenced }), false)
                    .await?
                    .is_some();
                if !present {
                    return Err(ManagerError::Flow(FlowError::UnknownDependency {
                        job: job.uuid,
                        referenced,
                    }));
                }
            }
        }

        let mut deps = HashMap::new();
        for job in &jobs {
            deps.insert(job.uuid, graph::expand_dependencies(job, &memberships, &known));
        }
        graph::validate_schedule(&sequence, &deps, order)?;

        let mut schedule = Schedule {
            jobs: HashMap::new(),
            sequence,
            deps: HashMap::new(),
            dependents: HashMap::new(),
            completed: HashSet::new(),
            done: HashSet::new(),
            skipped: HashSet::new(),
            known: HashSet::new(),
            memberships,
            expressions,
            order,
        };
        for job in jobs {
            let job_deps = deps.remove(&job.uuid).unwrap_or_default();
            schedule.add_job(job, job_deps);
        }
        Ok(schedule)
    }

    // -----------------------------------------------------------------------
    // Input resolution
    // -----------------------------------------------------------------------

    async fn resolve_inputs(
        &self,
        job: &Job,
        expressions: &HashMap<Uuid, Value>,
        cache: &mut ResolveCache,
    ) -> Result<(Vec<Value>, Map<String, Value>), ReferenceError> {
        let on_missing = job.config.on_missing_references;
        let mut args = Vec::with_capacity(job.args.len());
        for arg in &job.args {
            args.push(
                resolve::resolve_value(&self.store, arg, on_missing, expressions, cache).await?,
            );
        }
        let mut kwargs = Map::with_capacity(job.kwargs.len());
        for (key, value) in &job.kwargs {
            kwargs.insert(
                key.clone(),
                resolve::resolve_value(&self.store, value, on_missing, expressions, cache).await?,
            );
        }
        Ok((args, kwargs))
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    fn record_failure(
        &self,
        schedule: &mut Schedule,
        report: &mut RunReport,
        job: &Job,
        error: ManagerError,
    ) {
        tracing::error!(
            job = job.name.as_str(),
            uuid = %job.uuid,
            error = %error,
            "job failed; skipping dependents"
        );
        schedule.skip_dependents(job.uuid);
        report.failed.insert(job.uuid, error.to_string());
        if report.error.is_none() {
            report.error = Some(error);
        }
    }

    // -----------------------------------------------------------------------
    // Schedule mutation (replace / detour / addition)
    // -----------------------------------------------------------------------

    fn apply_change(
        &self,
        schedule: &mut Schedule,
        current: &Job,
        change: ScheduleChange,
    ) -> Result<(), ManagerError> {
        match change {
            ScheduleChange::Replace(node) => {
                tracing::debug!(uuid = %current.uuid, "response: replace");
                self.graft(schedule, current, node, true)
            }
            ScheduleChange::Detour(node) => {
                tracing::debug!(uuid = %current.uuid, "response: detour");
                self.graft(schedule, current, node, true)
            }
            ScheduleChange::Addition(node) => {
                tracing::debug!(uuid = %current.uuid, "response: addition");
                self.graft(schedule, current, node, false)
            }
        }
    }

    /// Materialise a grafted node into the schedule.
    ///
    /// With `rename`, the grafted node's leaf output takes over the current
    /// job's uuid at `index + 1`: downstream references keep resolving to the
    /// same identity, and every job that depended on the current uuid blocks
    /// again until the leaf completes.
    fn graft(
        &self,
        schedule: &mut Schedule,
        current: &Job,
        node: FlowNode,
        rename: bool,
    ) -> Result<(), ManagerError> {
        // decompose the grafted node
        let (mut new_jobs, new_memberships, mut new_expressions, root_output) = match node {
            FlowNode::Job(job) => (vec![job], HashMap::new(), HashMap::new(), None),
            FlowNode::Flow(flow) => {
                let memberships = flow.flow_memberships();
                let expressions = flow.output_expressions();
                let jobs: Vec<Job> = flow.iter_jobs().cloned().collect();
                let root_output = flow.output.clone();
                (jobs, memberships, expressions, root_output)
            }
        };
        if new_jobs.is_empty() {
            return Err(ManagerError::InvalidResponse {
                uuid: current.uuid,
                reason: "grafted flow contains no jobs".to_string(),
            });
        }

        // the graft lives where the current job lived
        for job in &mut new_jobs {
            job.hosts.extend(current.hosts.iter().copied());
        }

        let mut renamed_memberships = new_memberships;
        if rename {
            let leaf = find_leaf(&new_jobs, &renamed_memberships, root_output.as_ref());
            let successor_index = current.index + 1;
            tracing::debug!(
                leaf = %leaf,
                takes_over = %current.uuid,
                index = successor_index,
                "renaming graft leaf"
            );
            for job in &mut new_jobs {
                if job.uuid == leaf {
                    job.uuid = current.uuid;
                    job.index = successor_index;
                }
                for arg in &mut job.args {
                    rename_references(arg, leaf, current.uuid, successor_index);
                }
                for value in job.kwargs.values_mut() {
                    rename_references(value, leaf, current.uuid, successor_index);
                }
            }
            for expression in new_expressions.values_mut() {
                rename_references(expression, leaf, current.uuid, successor_index);
            }
            for members in renamed_memberships.values_mut() {
                if members.remove(&leaf) {
                    members.insert(current.uuid);
                }
            }
        }

        // collision checks
        for job in &new_jobs {
            if schedule.jobs.contains_key(&job.uuid) {
                return Err(ManagerError::InvalidResponse {
                    uuid: current.uuid,
                    reason: format!("grafted job {} is already scheduled", job.uuid),
                });
            }
            if job.uuid != current.uuid && schedule.known.contains(&job.uuid) {
                return Err(ManagerError::InvalidResponse {
                    uuid: current.uuid,
                    reason: format!("grafted job {} reuses an existing uuid", job.uuid),
                });
            }
            if schedule.done.contains(&(job.uuid, job.index)) {
                return Err(ManagerError::InvalidResponse {
                    uuid: current.uuid,
                    reason: format!(
                        "grafted job ({}, {}) was already executed",
                        job.uuid, job.index
                    ),
                });
            }
        }

        schedule.memberships.extend(renamed_memberships);
        schedule.expressions.extend(new_expressions);

        // register jobs and dependencies
        let mut known = schedule.known.clone();
        known.extend(new_jobs.iter().map(|job| job.uuid));
        let new_uuids: Vec<Uuid> = new_jobs.iter().map(|job| job.uuid).collect();
        for job in new_jobs {
            let deps = graph::expand_dependencies(&job, &schedule.memberships, &known);
            schedule.add_job(job, deps);
        }

        // splice into the declaration sequence
        if rename {
            // dependents re-block on the reused uuid until the leaf completes
            schedule.completed.remove(&current.uuid);
            let insert_at = match schedule
                .sequence
                .iter()
                .position(|uuid| *uuid == current.uuid)
            {
                Some(at) => {
                    schedule.sequence.remove(at);
                    at
                }
                None => schedule.sequence.len(),
            };
            for (offset, uuid) in new_uuids.iter().enumerate() {
                schedule.sequence.insert(insert_at + offset, *uuid);
            }
        } else {
            schedule.sequence.extend(new_uuids.iter().copied());
        }

        // a graft must leave the remaining schedule acyclic and order-valid
        let remaining = schedule.remaining_sequence();
        graph::validate_schedule(&remaining, &schedule.deps, schedule.order).map_err(|e| {
            ManagerError::InvalidResponse {
                uuid: current.uuid,
                reason: e.to_string(),
            }
        })?;

        Ok(())
    }
}

/// The job whose output stands for the whole grafted node.
///
/// Preference order: the single reference in the grafted flow's own output
/// expression (when it names a member job), otherwise the last declared job
/// that no other grafted job depends on.
fn find_leaf(
    jobs: &[Job],
    memberships: &HashMap<Uuid, HashSet<Uuid>>,
    root_output: Option<&Value>,
) -> Uuid {
    let job_uuids: HashSet<Uuid> = jobs.iter().map(|job| job.uuid).collect();

    // a flow output naming exactly one member job is authoritative
    if let Some(expression) = root_output {
        let referenced = deferflow_types::reference::find_references(expression);
        if referenced.len() == 1 && job_uuids.contains(&referenced[0].uuid()) {
            return referenced[0].uuid();
        }
    }

    // otherwise: terminal jobs (no grafted dependents), last declared wins
    let mut depended_on = HashSet::new();
    for job in jobs {
        depended_on.extend(graph::expand_dependencies(job, memberships, &job_uuids));
    }
    jobs.iter()
        .rev()
        .find(|job| !depended_on.contains(&job.uuid))
        .map(|job| job.uuid)
        .unwrap_or_else(|| jobs[jobs.len() - 1].uuid)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FunctionInput, JobError};
    use crate::store::{DocStore, SortOrder, compare_values, matches_filter};
    use deferflow_types::{FunctionToken, JobConfig, OnMissing};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// In-memory mock store for engine tests.
    #[derive(Default)]
    struct MockStore {
        collections: Mutex<HashMap<String, Vec<Value>>>,
    }

    impl DocStore for MockStore {
        async fn connect(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn put(&self, doc: Value, collection: &str) -> Result<(), StoreError> {
            self.collections
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .push(doc);
            Ok(())
        }

        async fn get_one(
            &self,
            filter: &Value,
            collection: &str,
        ) -> Result<Option<Value>, StoreError> {
            let collections = self.collections.lock().unwrap();
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
            let collections = self.collections.lock().unwrap();
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

        async fn ensure_index(&self, _field: &str, _collection: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn test_registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register_fn(FunctionToken::new("math", "add"), |input: FunctionInput<'_>| {
            let a = input.arg(0).as_i64().unwrap_or(0);
            let b = input.arg(1).as_i64().unwrap_or(0);
            Ok(Response::from_output(json!(a + b)))
        });
        registry.register_fn(FunctionToken::new("math", "sq"), |input: FunctionInput<'_>| {
            let x = input.arg(0).as_i64().unwrap_or(0);
            Ok(Response::from_output(json!(x * x)))
        });
        registry.register_fn(
            FunctionToken::new("dicts", "make_dict"),
            |_input: FunctionInput<'_>| Ok(Response::from_output(json!({ "x": 4, "y": 5 }))),
        );
        registry.register_fn(
            FunctionToken::new("control", "halt_children"),
            |_input: FunctionInput<'_>| Ok(Response::from_output(json!("halted")).stop_children()),
        );
        registry.register_fn(
            FunctionToken::new("control", "halt_flow"),
            |_input: FunctionInput<'_>| Ok(Response::from_output(json!("halted")).stop_flow()),
        );
        registry.register_fn(
            FunctionToken::new("control", "explode"),
            |_input: FunctionInput<'_>| -> Result<Response, JobError> {
                Err(JobError::new("boom"))
            },
        );
        registry
    }

    fn test_manager() -> Manager {
        let store = JobStore::new(Arc::new(MockStore::default()));
        Manager::new(store, test_registry())
    }

    fn add_job(a: Value, b: Value) -> Job {
        Job::new(FunctionToken::new("math", "add"), vec![a, b], Map::new())
    }

    // -----------------------------------------------------------------------
    // Dependency-ordered execution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_two_step_addition() {
        let j1 = add_job(json!(1), json!(2));
        let j2 = add_job(j1.output().to_value(), json!(3));
        let (u1, u2) = (j1.uuid, j2.uuid);
        // declare out of order: auto ordering must fix it
        let flow = Flow::new("sum", vec![j2.into(), j1.into()], None, FlowOrder::Auto).unwrap();

        let mut manager = test_manager();
        let report = manager.run(flow).await.unwrap();

        assert!(report.error.is_none());
        assert_eq!(report.output_of(u1), Some(&json!(3)));
        assert_eq!(report.output_of(u2), Some(&json!(6)));

        let mut cache = ResolveCache::new();
        let stored = manager
            .store()
            .get_output(u2, crate::store::job_store::OutputIndex::Latest, OnMissing::Fail, &mut cache)
            .await
            .unwrap();
        assert_eq!(stored, json!(6));
    }

    #[tokio::test]
    async fn test_output_selector_narrows_input() {
        let j1 = Job::new(FunctionToken::new("dicts", "make_dict"), vec![], Map::new());
        let j2 = Job::new(
            FunctionToken::new("math", "sq"),
            vec![j1.output().attr("x").to_value()],
            Map::new(),
        );
        let u2 = j2.uuid;
        let flow = Flow::new("sel", vec![j1.into(), j2.into()], None, FlowOrder::Auto).unwrap();

        let mut manager = test_manager();
        let report = manager.run(flow).await.unwrap();
        assert_eq!(report.output_of(u2), Some(&json!(16)));
    }

    #[tokio::test]
    async fn test_at_most_once_per_index() {
        let j1 = add_job(json!(1), json!(1));
        let u1 = j1.uuid;
        let flow = Flow::new("once", vec![j1.into()], None, FlowOrder::Auto).unwrap();

        let mut manager = test_manager();
        let report = manager.run(flow).await.unwrap();
        assert_eq!(report.responses[&u1].len(), 1);

        let docs = manager
            .store()
            .query_documents(&json!({ "uuid": u1 }), None, None, false)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].index, 1);
    }

    // -----------------------------------------------------------------------
    // Stop directives
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_stop_children_skips_dependents() {
        let j1 = add_job(json!(1), json!(2));
        let j2 = Job::new(
            FunctionToken::new("control", "halt_children"),
            vec![j1.output().to_value()],
            Map::new(),
        );
        let j3 = add_job(j2.output().to_value(), json!(1));
        let u3 = j3.uuid;
        let flow = Flow::new(
            "halt",
            vec![j1.into(), j2.into(), j3.into()],
            None,
            FlowOrder::Auto,
        )
        .unwrap();

        let mut manager = test_manager();
        let report = manager.run(flow).await.unwrap();
        assert!(report.skipped.contains(&u3));
        assert!(!report.responses.contains_key(&u3));

        let docs = manager
            .store()
            .query_documents(&json!({ "uuid": u3 }), None, None, false)
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_stop_flow_terminates_run() {
        let j1 = Job::new(FunctionToken::new("control", "halt_flow"), vec![], Map::new());
        let j2 = add_job(json!(1), json!(1));
        let u2 = j2.uuid;
        let flow = Flow::new("stop", vec![j1.into(), j2.into()], None, FlowOrder::Linear).unwrap();

        let mut manager = test_manager();
        let report = manager.run(flow).await.unwrap();
        assert!(!report.responses.contains_key(&u2));
    }

    // -----------------------------------------------------------------------
    // Failure semantics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_failure_skips_dependents_and_continues() {
        let bad = Job::new(FunctionToken::new("control", "explode"), vec![], Map::new());
        let child = add_job(bad.output().to_value(), json!(1));
        let independent = add_job(json!(2), json!(2));
        let (ub, uc, ui) = (bad.uuid, child.uuid, independent.uuid);
        let flow = Flow::new(
            "fail",
            vec![bad.into(), child.into(), independent.into()],
            None,
            FlowOrder::Auto,
        )
        .unwrap();

        let mut manager = test_manager();
        let report = manager.run(flow).await.unwrap();

        assert!(report.failed.contains_key(&ub));
        assert!(report.skipped.contains(&uc));
        assert_eq!(report.output_of(ui), Some(&json!(4)));
        assert!(matches!(
            report.error,
            Some(ManagerError::JobFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_on_failure_aborts_run() {
        let bad = Job::new(FunctionToken::new("control", "explode"), vec![], Map::new());
        let independent = add_job(json!(2), json!(2));
        let ui = independent.uuid;
        let flow = Flow::new(
            "abort",
            vec![bad.into(), independent.into()],
            None,
            FlowOrder::Linear,
        )
        .unwrap();

        let mut manager = test_manager().with_config(ManagerConfig {
            stop_on_failure: true,
        });
        let report = manager.run(flow).await.unwrap();
        assert!(!report.responses.contains_key(&ui));
    }

    #[tokio::test]
    async fn test_unknown_function_is_recorded() {
        let ghost = Job::new(FunctionToken::new("nowhere", "ghost"), vec![], Map::new());
        let ug = ghost.uuid;
        let flow = Flow::new("ghost", vec![ghost.into()], None, FlowOrder::Auto).unwrap();

        let mut manager = test_manager();
        let report = manager.run(flow).await.unwrap();
        assert!(report.failed.contains_key(&ug));
        assert!(matches!(
            report.error,
            Some(ManagerError::UnknownFunction(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_external_reference_rejected() {
        // reference a uuid the store has never seen
        let job = add_job(
            deferflow_types::OutputReference::new(Uuid::now_v7(), 1).to_value(),
            json!(1),
        );
        let flow = Flow::new("ext", vec![job.into()], None, FlowOrder::Auto).unwrap();

        let mut manager = test_manager();
        let err = manager.run(flow).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Flow(FlowError::UnknownDependency { .. })
        ));
    }

    #[tokio::test]
    async fn test_external_reference_resolvable_from_store() {
        let store = JobStore::new(Arc::new(MockStore::default()));
        let prior = Uuid::now_v7();
        store
            .put_document(&OutputDocument {
                uuid: prior,
                index: 1,
                output: json!(40),
                completed_at: Utc::now(),
                metadata: Map::new(),
                hosts: vec![],
                name: "previous_run".to_string(),
                stored_data: None,
            })
            .await
            .unwrap();

        let job = add_job(
            deferflow_types::OutputReference::new(prior, 1).to_value(),
            json!(2),
        );
        let uj = job.uuid;
        let flow = Flow::new("ext-ok", vec![job.into()], None, FlowOrder::Auto).unwrap();

        let mut manager = Manager::new(store, test_registry());
        let report = manager.run(flow).await.unwrap();
        assert_eq!(report.output_of(uj), Some(&json!(42)));
    }

    // -----------------------------------------------------------------------
    // Missing-reference policies
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_on_missing_policies() {
        let store = JobStore::new(Arc::new(MockStore::default()));
        let mut cache = ResolveCache::new();
        let absent = Uuid::now_v7();
        let value = deferflow_types::OutputReference::new(absent, 1).to_value();

        let resolved = resolve::resolve_value(
            &store,
            &value,
            OnMissing::Null,
            &HashMap::new(),
            &mut cache,
        )
        .await
        .unwrap();
        assert_eq!(resolved, Value::Null);

        let passed = resolve::resolve_value(
            &store,
            &value,
            OnMissing::PassThrough,
            &HashMap::new(),
            &mut cache,
        )
        .await
        .unwrap();
        assert_eq!(passed, value);

        let failed = resolve::resolve_value(
            &store,
            &value,
            OnMissing::Fail,
            &HashMap::new(),
            &mut cache,
        )
        .await;
        assert!(matches!(
            failed,
            Err(ReferenceError::Unresolvable { uuid }) if uuid == absent
        ));
    }

    #[tokio::test]
    async fn test_resolution_disabled_passes_sentinels_through() {
        let j1 = add_job(json!(1), json!(2));
        let sentinel = j1.output().to_value();
        let mut j2 = Job::new(
            FunctionToken::new("inspect", "raw"),
            vec![sentinel.clone()],
            Map::new(),
        );
        j2.config = JobConfig {
            resolve_references: false,
            ..JobConfig::new()
        };
        let u2 = j2.uuid;

        let mut registry = test_registry();
        registry.register_fn(
            FunctionToken::new("inspect", "raw"),
            |input: FunctionInput<'_>| Ok(Response::from_output(input.arg(0).clone())),
        );
        let store = JobStore::new(Arc::new(MockStore::default()));
        let mut manager = Manager::new(store, registry);

        let flow = Flow::new("raw", vec![j1.into(), j2.into()], None, FlowOrder::Auto).unwrap();
        let report = manager.run(flow).await.unwrap();
        assert_eq!(report.output_of(u2), Some(&sentinel));
    }

    // -----------------------------------------------------------------------
    // Replace / detour / addition
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_replace_reroots_uuid_at_next_index() {
        let mut registry = test_registry();
        registry.register_fn(
            FunctionToken::new("control", "expand"),
            |_input: FunctionInput<'_>| -> Result<Response, JobError> {
                let a1 = Job::new(
                    FunctionToken::new("math", "add"),
                    vec![json!(2), json!(1)],
                    Map::new(),
                );
                let a2 = Job::new(
                    FunctionToken::new("math", "add"),
                    vec![json!(2), json!(1)],
                    Map::new(),
                );
                let a3 = Job::new(
                    FunctionToken::new("math", "add"),
                    vec![json!(2), json!(1)],
                    Map::new(),
                );
                let replacement = Flow::new(
                    "expansion",
                    vec![a1.into(), a2.into(), a3.into()],
                    None,
                    FlowOrder::Auto,
                )
                .map_err(|e| JobError::new(e.to_string()))?;
                Ok(Response::from_output(json!("expanding")).with_replacement(replacement))
            },
        );

        let k = Job::new(FunctionToken::new("control", "expand"), vec![], Map::new());
        let uk = k.uuid;
        let flow = Flow::new("replace", vec![k.into()], None, FlowOrder::Auto).unwrap();

        let store = JobStore::new(Arc::new(MockStore::default()));
        let mut manager = Manager::new(store, registry);
        let report = manager.run(flow).await.unwrap();

        // k ran at index 1, the leaf of the replacement at index 2
        assert_eq!(report.responses[&uk].len(), 2);
        assert_eq!(report.responses[&uk][&2].output, Some(json!(3)));

        let docs = manager
            .store()
            .query_documents(
                &json!({ "uuid": uk }),
                Some(("index", SortOrder::Ascending)),
                None,
                false,
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].index, 2);
        assert_eq!(docs[1].output, json!(3));
    }

    #[tokio::test]
    async fn test_detour_runs_before_dependents() {
        let mut registry = test_registry();
        registry.register_fn(
            FunctionToken::new("control", "detour_add"),
            |_input: FunctionInput<'_>| {
                let patch = Job::new(
                    FunctionToken::new("math", "add"),
                    vec![json!(3), json!(4)],
                    Map::new(),
                );
                Ok(Response::from_output(json!(3)).with_detour(patch))
            },
        );

        let j1 = add_job(json!(1), json!(2));
        let j2 = Job::new(
            FunctionToken::new("control", "detour_add"),
            vec![j1.output().to_value()],
            Map::new(),
        );
        let j3 = Job::new(
            FunctionToken::new("math", "sq"),
            vec![j2.output().to_value()],
            Map::new(),
        );
        let (u2, u3) = (j2.uuid, j3.uuid);
        let flow = Flow::new(
            "detour",
            vec![j1.into(), j2.into(), j3.into()],
            None,
            FlowOrder::Auto,
        )
        .unwrap();

        let store = JobStore::new(Arc::new(MockStore::default()));
        let mut manager = Manager::new(store, registry);
        let report = manager.run(flow).await.unwrap();

        // j3 observed the detour's output (7), not j2's own output (3)
        assert_eq!(report.output_of(u3), Some(&json!(49)));
        // the detour ran under j2's uuid at index 2
        assert_eq!(report.responses[&u2][&2].output, Some(json!(7)));
    }

    #[tokio::test]
    async fn test_addition_appends_without_rewiring() {
        let mut registry = test_registry();
        registry.register_fn(
            FunctionToken::new("control", "append_work"),
            |_input: FunctionInput<'_>| {
                let extra = Job::new(
                    FunctionToken::new("math", "add"),
                    vec![json!(10), json!(5)],
                    Map::new(),
                );
                Ok(Response::from_output(json!("spawned")).with_addition(extra))
            },
        );

        let j1 = Job::new(FunctionToken::new("control", "append_work"), vec![], Map::new());
        let u1 = j1.uuid;
        let flow = Flow::new("append", vec![j1.into()], None, FlowOrder::Auto).unwrap();

        let store = JobStore::new(Arc::new(MockStore::default()));
        let mut manager = Manager::new(store, registry);
        let report = manager.run(flow).await.unwrap();

        // the appended job ran under its own uuid; j1 stays at index 1
        assert_eq!(report.responses[&u1].len(), 1);
        let appended: Vec<_> = report
            .responses
            .iter()
            .filter(|(uuid, _)| **uuid != u1)
            .collect();
        assert_eq!(appended.len(), 1);
        assert_eq!(
            appended[0].1.values().next().unwrap().output,
            Some(json!(15))
        );
    }

    // -----------------------------------------------------------------------
    // Flow outputs as inputs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_flow_output_expression_substitutes() {
        let a = add_job(json!(1), json!(2));
        let b = add_job(json!(3), json!(4));
        let output = json!([a.output().to_value(), b.output().to_value()]);
        let inner = Flow::new(
            "pair",
            vec![a.into(), b.into()],
            Some(output),
            FlowOrder::Auto,
        )
        .unwrap();
        let inner_ref = deferflow_types::OutputReference::new(inner.uuid, 1);

        let mut registry = test_registry();
        registry.register_fn(
            FunctionToken::new("lists", "sum_list"),
            |input: FunctionInput<'_>| {
                let total: i64 = input
                    .arg(0)
                    .as_array()
                    .map(|items| items.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(Response::from_output(json!(total)))
            },
        );

        let consumer = Job::new(
            FunctionToken::new("lists", "sum_list"),
            vec![inner_ref.to_value()],
            Map::new(),
        );
        let uc = consumer.uuid;
        let outer = Flow::new(
            "outer",
            vec![inner.into(), consumer.into()],
            None,
            FlowOrder::Auto,
        )
        .unwrap();

        let store = JobStore::new(Arc::new(MockStore::default()));
        let mut manager = Manager::new(store, registry);
        let report = manager.run(outer).await.unwrap();
        assert_eq!(report.output_of(uc), Some(&json!(10)));
    }

    // -----------------------------------------------------------------------
    // Linear ordering
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_rejects_misordered_declaration() {
        let j1 = add_job(json!(1), json!(2));
        let j2 = add_job(j1.output().to_value(), json!(3));
        // j2 declared before its dependency
        let flow = Flow::new("bad", vec![j2.into(), j1.into()], None, FlowOrder::Linear).unwrap();

        let mut manager = test_manager();
        let err = manager.run(flow).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Flow(FlowError::LinearOrderViolation { .. })
        ));
    }
}
