pub mod diff;
pub mod drift;
pub mod plan;

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dag::resolver;
use crate::dag::resource_graph::ResourceGraph;
use crate::error::EngineError;
use crate::provider::schema::SchemaRegistry;
use crate::state::models::{RecordStatus, StateRecord};

use diff::{diff_resource, PropertyDiff};
use plan::{ChangeKind, ChangeOperation, OperationKind, Plan};

/// Diff the desired graph against last-applied state.
///
/// Decisions are made in dependency order so that a replace propagates to
/// everything referencing the replaced resource.
pub fn plan(
    stack: &str,
    graph: &ResourceGraph,
    prior: &BTreeMap<String, StateRecord>,
    schemas: &SchemaRegistry,
) -> Result<Plan, EngineError> {
    let order = graph.topological_order();
    let mut replaced: BTreeSet<String> = BTreeSet::new();
    let mut unchanged = Vec::new();
    let mut ops: Vec<ChangeOperation> = Vec::new();

    for id in &order {
        let Some(resource) = graph.get(id) else {
            continue;
        };
        let record = prior.get(*id).filter(|r| r.status != RecordStatus::Deleted);

        let (change, diff) = match record {
            None => (ChangeKind::Create, PropertyDiff::additions(&resource.properties)),
            Some(r) if r.provider_id.is_none() => {
                // Recreated under a new provider ID; dependents must follow
                replaced.insert(id.to_string());
                let schema = schemas.get(&resource.resource_type);
                (ChangeKind::Create, diff_resource(resource, r, &schema, &replaced))
            }
            Some(r) => {
                let schema = schemas.get(&resource.resource_type);
                let diff = diff_resource(resource, r, &schema, &replaced);
                if diff.requires_replace() {
                    (ChangeKind::Replace, diff)
                } else if !diff.is_empty() {
                    (ChangeKind::Update, diff)
                } else if matches!(r.status, RecordStatus::Failed | RecordStatus::Pending) {
                    // Last attempt did not finish; apply again
                    (ChangeKind::Update, diff)
                } else {
                    debug!(id = %id, "No changes");
                    unchanged.push(id.to_string());
                    continue;
                }
            }
        };
        debug!(id = %id, change = ?change, changed = ?diff.changed_names(), "Planned change");

        let mk = |kind: OperationKind| ChangeOperation {
            resource_id: resource.id.clone(),
            resource_type: match kind {
                OperationKind::DeleteOld => record
                    .map(|r| r.resource_type.clone())
                    .unwrap_or_else(|| resource.resource_type.clone()),
                _ => resource.resource_type.clone(),
            },
            kind,
            change,
            diff: diff.clone(),
            desired: (!kind.is_delete()).then(|| resource.clone()),
            prior: record.cloned(),
            depends_on: Vec::new(),
        };
        match change {
            ChangeKind::Create => ops.push(mk(OperationKind::Create)),
            ChangeKind::Update => ops.push(mk(OperationKind::Update)),
            ChangeKind::Replace => {
                replaced.insert(id.to_string());
                ops.push(mk(OperationKind::DeleteOld));
                ops.push(mk(OperationKind::CreateNew));
            }
            ChangeKind::Delete => {}
        }
    }

    for (id, record) in prior {
        if graph.contains(id) || record.status == RecordStatus::Deleted {
            continue;
        }
        debug!(id = %id, "Planned delete of removed resource");
        ops.push(delete_op(record, OperationKind::Delete));
    }

    let topo_position: BTreeMap<&str, usize> =
        order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let operations = order_operations(ops, prior, |op| {
        let position = topo_position.get(op.resource_id.as_str()).copied();
        (position, op.kind)
    })?;

    Ok(Plan {
        stack: stack.to_string(),
        operations,
        unchanged,
        prior: prior.clone(),
        is_destroy: false,
    })
}

/// An all-delete plan for every live record, dependents first.
pub fn plan_destroy(
    stack: &str,
    prior: &BTreeMap<String, StateRecord>,
) -> Result<Plan, EngineError> {
    let ops: Vec<ChangeOperation> = prior
        .values()
        .filter(|r| r.status != RecordStatus::Deleted)
        .map(|r| delete_op(r, OperationKind::Delete))
        .collect();
    let operations = order_operations(ops, prior, |_| (None, OperationKind::Delete))?;

    Ok(Plan {
        stack: stack.to_string(),
        operations,
        unchanged: Vec::new(),
        prior: prior.clone(),
        is_destroy: true,
    })
}

fn delete_op(record: &StateRecord, kind: OperationKind) -> ChangeOperation {
    ChangeOperation {
        resource_id: record.id.clone(),
        resource_type: record.resource_type.clone(),
        kind,
        change: ChangeKind::Delete,
        diff: PropertyDiff::removals(&record.properties),
        desired: None,
        prior: Some(record.clone()),
        depends_on: Vec::new(),
    }
}

/// Ordering key for listing. Removed-resource deletes come first (in
/// dependents-first order) unless an edge holds them back, then everything
/// else by desired position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ListKey {
    class: u8,
    ordinal: usize,
    step: u8,
}

/// Wire up operation dependencies and sort operations into a valid
/// execution order.
///
/// - create/update/create-new wait for the final operation of each
///   current dependency;
/// - create-new waits for its own delete-old;
/// - a delete (or delete-old) of R waits for the delete of every resource
///   whose recorded dependencies include R;
/// - a delete (or delete-old) of R also waits for the final operation of a
///   recorded dependent that no longer references R.
///
/// A delete-old is listed right before its create-new whenever the create
/// step is ready at that point.
fn order_operations<F>(
    mut ops: Vec<ChangeOperation>,
    prior: &BTreeMap<String, StateRecord>,
    desired_key: F,
) -> Result<Vec<ChangeOperation>, EngineError>
where
    F: Fn(&ChangeOperation) -> (Option<usize>, OperationKind),
{
    let mut final_idx: BTreeMap<String, usize> = BTreeMap::new();
    let mut delete_idx: BTreeMap<String, usize> = BTreeMap::new();
    for (idx, op) in ops.iter().enumerate() {
        if op.kind.is_final() {
            final_idx.insert(op.resource_id.clone(), idx);
        } else {
            delete_idx.insert(op.resource_id.clone(), idx);
        }
    }

    // Reverse dependencies as recorded in state
    let mut recorded_dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for record in prior.values().filter(|r| r.status != RecordStatus::Deleted) {
        for dep in &record.dependencies {
            recorded_dependents
                .entry(dep.as_str())
                .or_default()
                .push(record.id.as_str());
        }
    }

    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut releases: BTreeSet<(usize, usize)> = BTreeSet::new();
    for (idx, op) in ops.iter().enumerate() {
        match op.kind {
            OperationKind::Create | OperationKind::Update | OperationKind::CreateNew => {
                if let Some(resource) = &op.desired {
                    for dep in resource.dependencies() {
                        if let Some(&dep_idx) = final_idx.get(&dep) {
                            edges.insert((dep_idx, idx));
                        }
                    }
                }
                if op.kind == OperationKind::CreateNew {
                    if let Some(&old) = delete_idx.get(&op.resource_id) {
                        edges.insert((old, idx));
                    }
                }
            }
            OperationKind::Delete | OperationKind::DeleteOld => {
                for dependent in recorded_dependents
                    .get(op.resource_id.as_str())
                    .into_iter()
                    .flatten()
                {
                    if let Some(&dep_idx) = delete_idx.get(*dependent) {
                        if dep_idx != idx {
                            edges.insert((dep_idx, idx));
                        }
                    }
                    // A surviving dependent that drops the reference must
                    // let go before the object disappears
                    if let Some(&final_op) = final_idx.get(*dependent) {
                        let still_references = ops[final_op]
                            .desired
                            .as_ref()
                            .is_some_and(|r| r.dependencies().contains(&op.resource_id));
                        if !still_references {
                            releases.insert((final_op, idx));
                        }
                    }
                }
            }
        }
    }

    // Releases that would close a loop (e.g. the dependent now needs a
    // replacement of something the deleted resource used) are left out
    for (from, to) in releases {
        if reaches(&edges, to, from) {
            debug!(
                from = %ops[from].idempotency_key(),
                to = %ops[to].idempotency_key(),
                "Dropping release edge that would form a cycle"
            );
        } else {
            edges.insert((from, to));
        }
    }

    // Dependents-first rank of removed resources, ties by ascending ID
    let removed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| desired_key(op).0.is_none())
        .map(|(i, _)| i)
        .collect();
    let removed_rank = {
        let local: BTreeMap<usize, usize> =
            removed.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        let local_edges: Vec<(usize, usize)> = edges
            .iter()
            .filter_map(|(a, b)| Some((*local.get(a)?, *local.get(b)?)))
            .collect();
        let (order, _) = resolver::kahn_order(removed.len(), &local_edges, |l| {
            ops[removed[l]].resource_id.clone()
        });
        let rank: BTreeMap<usize, usize> = order
            .into_iter()
            .enumerate()
            .map(|(r, l)| (removed[l], r))
            .collect();
        rank
    };

    let keys: Vec<ListKey> = ops
        .iter()
        .enumerate()
        .map(|(idx, op)| match desired_key(op) {
            (None, _) => ListKey {
                class: 0,
                ordinal: removed_rank.get(&idx).copied().unwrap_or(usize::MAX),
                step: 0,
            },
            (Some(position), kind) => ListKey {
                class: 1,
                ordinal: position,
                step: u8::from(kind != OperationKind::DeleteOld),
            },
        })
        .collect();

    let count = ops.len();
    let mut in_degree = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for &(from, to) in &edges {
        in_degree[to] += 1;
        dependents[from].push(to);
    }
    let partner: BTreeMap<usize, usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.kind == OperationKind::DeleteOld)
        .filter_map(|(idx, op)| Some((idx, *final_idx.get(&op.resource_id)?)))
        .collect();

    let mut ready: BTreeSet<(ListKey, usize)> = (0..count)
        .filter(|&i| in_degree[i] == 0)
        .map(|i| (keys[i].clone(), i))
        .collect();
    let mut sequence: Vec<usize> = Vec::with_capacity(count);

    let emit = |idx: usize,
                    ready: &mut BTreeSet<(ListKey, usize)>,
                    in_degree: &mut Vec<usize>,
                    sequence: &mut Vec<usize>| {
        ready.remove(&(keys[idx].clone(), idx));
        sequence.push(idx);
        for &next in &dependents[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert((keys[next].clone(), next));
            }
        }
    };

    while !ready.is_empty() {
        // Prefer a delete-old whose create step can follow immediately
        let pick = ready
            .iter()
            .find(|(_, idx)| match partner.get(idx) {
                Some(&create) => in_degree[create] <= 1,
                None => true,
            })
            .or_else(|| ready.iter().next())
            .map(|(_, idx)| *idx);
        let Some(idx) = pick else {
            break;
        };
        emit(idx, &mut ready, &mut in_degree, &mut sequence);

        if let Some(&create) = partner.get(&idx) {
            if in_degree[create] == 0 {
                emit(create, &mut ready, &mut in_degree, &mut sequence);
            }
        }
    }

    if sequence.len() < count {
        let placed: BTreeSet<usize> = sequence.iter().copied().collect();
        let members: BTreeSet<String> = (0..count)
            .filter(|i| !placed.contains(i))
            .map(|i| ops[i].resource_id.clone())
            .collect();
        return Err(EngineError::Cycle {
            members: members.into_iter().collect(),
        });
    }

    // Renumber dependencies to listing positions
    let mut position = vec![0usize; count];
    for (pos, &idx) in sequence.iter().enumerate() {
        position[idx] = pos;
    }
    let mut deps_of: Vec<Vec<usize>> = vec![Vec::new(); count];
    for &(from, to) in &edges {
        deps_of[to].push(position[from]);
    }

    let mut slots: Vec<Option<ChangeOperation>> = ops.drain(..).map(Some).collect();
    let mut ordered = Vec::with_capacity(count);
    for &idx in &sequence {
        if let Some(mut op) = slots[idx].take() {
            let mut deps = std::mem::take(&mut deps_of[idx]);
            deps.sort_unstable();
            op.depends_on = deps;
            ordered.push(op);
        }
    }
    Ok(ordered)
}

/// True if `to` is reachable from `from` along `edges`.
fn reaches(edges: &BTreeSet<(usize, usize)>, from: usize, to: usize) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if seen.insert(node) {
            stack.extend(
                edges
                    .range((node, 0)..=(node, usize::MAX))
                    .map(|&(_, next)| next),
            );
        }
    }
    false
}

