//! Dependency graph construction, cycle detection, and order validation.
//!
//! Uses `petgraph` to model job dependencies as a directed graph. Edges come
//! from reference sentinels embedded in job inputs: a reference to a job
//! depends on that job; a reference to a sub-flow depends on every job the
//! sub-flow transitively contains (its output expression can only mention
//! members, so this is the conservative closure).

use std::collections::{HashMap, HashSet};

use deferflow_types::flow::job_references;
use deferflow_types::{FlowError, FlowOrder, Job};
use petgraph::algo::{connected_components, toposort};
use petgraph::graph::DiGraph;
use uuid::Uuid;

/// Expand a job's raw reference uuids into job-level dependencies.
///
/// References to flow uuids expand through `memberships`; references to
/// uuids outside `known_jobs` (outputs that already exist in the store) add
/// no edges -- the flow validator checks they are actually resolvable.
pub fn expand_dependencies(
    job: &Job,
    memberships: &HashMap<Uuid, HashSet<Uuid>>,
    known_jobs: &HashSet<Uuid>,
) -> HashSet<Uuid> {
    let mut deps = HashSet::new();
    for referenced in job_references(job) {
        if known_jobs.contains(&referenced) {
            deps.insert(referenced);
        } else if let Some(members) = memberships.get(&referenced) {
            deps.extend(members.iter().filter(|m| known_jobs.contains(m)));
        }
    }
    deps
}

/// Validate a schedule: acyclic, and (for linear flows) declared in an order
/// that respects every dependency.
///
/// `jobs` must be in declaration order; `deps` maps each job to its expanded
/// job-level dependencies. Disconnected components under `Auto` are legal
/// but their relative order is underspecified, so they are logged.
pub fn validate_schedule(
    jobs: &[Uuid],
    deps: &HashMap<Uuid, HashSet<Uuid>>,
    order: FlowOrder,
) -> Result<(), FlowError> {
    let mut graph = DiGraph::<Uuid, ()>::new();
    let mut indices = HashMap::new();
    for &uuid in jobs {
        indices.insert(uuid, graph.add_node(uuid));
    }
    for (&uuid, job_deps) in deps {
        let Some(&to) = indices.get(&uuid) else { continue };
        for dep in job_deps {
            if let Some(&from) = indices.get(dep) {
                graph.add_edge(from, to, ());
            }
        }
    }

    toposort(&graph, None)
        .map_err(|cycle| FlowError::CycleDetected(graph[cycle.node_id()]))?;

    match order {
        FlowOrder::Linear => {
            let position: HashMap<Uuid, usize> =
                jobs.iter().enumerate().map(|(i, &u)| (u, i)).collect();
            for (&uuid, job_deps) in deps {
                let Some(&at) = position.get(&uuid) else { continue };
                for dep in job_deps {
                    if let Some(&dep_at) = position.get(dep) {
                        if dep_at >= at {
                            return Err(FlowError::LinearOrderViolation {
                                job: uuid,
                                dependency: *dep,
                            });
                        }
                    }
                }
            }
        }
        FlowOrder::Auto => {
            if jobs.len() > 1 && connected_components(&graph) > 1 {
                tracing::warn!(
                    jobs = jobs.len(),
                    components = connected_components(&graph),
                    "flow has disconnected components; their relative order follows declaration order"
                );
            }
        }
    }

    Ok(())
}

/// Every job that transitively depends on `start`, per the reverse edge map.
pub fn transitive_dependents(
    start: Uuid,
    dependents: &HashMap<Uuid, HashSet<Uuid>>,
) -> HashSet<Uuid> {
    let mut reached = HashSet::new();
    let mut stack = vec![start];
    while let Some(current) = stack.pop() {
        if let Some(children) = dependents.get(&current) {
            for &child in children {
                if reached.insert(child) {
                    stack.push(child);
                }
            }
        }
    }
    reached
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
