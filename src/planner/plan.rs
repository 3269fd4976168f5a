use std::collections::BTreeMap;
use std::fmt;

use super::diff::PropertyDiff;
use crate::config::types::Resource;
use crate::state::models::StateRecord;

/// What happens to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Create,
    Update,
    Replace,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "+"),
            ChangeKind::Update => write!(f, "~"),
            ChangeKind::Replace => write!(f, "-/+"),
            ChangeKind::Delete => write!(f, "-"),
        }
    }
}

/// One provider call. A replace is two operations: `DeleteOld` then `CreateNew`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    DeleteOld,
    CreateNew,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::DeleteOld => "delete-old",
            OperationKind::CreateNew => "create-new",
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, OperationKind::Delete | OperationKind::DeleteOld)
    }

    /// The operation that leaves the resource in its desired shape.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OperationKind::Create | OperationKind::Update | OperationKind::CreateNew
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic action against one resource.
#[derive(Debug, Clone)]
pub struct ChangeOperation {
    pub resource_id: String,
    pub resource_type: String,
    pub kind: OperationKind,
    pub change: ChangeKind,
    pub diff: PropertyDiff,
    /// Desired resource; absent for deletes.
    pub desired: Option<Resource>,
    /// Last-applied record, if any.
    pub prior: Option<StateRecord>,
    /// Indices into [`Plan::operations`] that must succeed first.
    pub depends_on: Vec<usize>,
}

impl ChangeOperation {
    /// Key sent with every provider call for this operation.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.resource_id, self.kind.as_str())
    }
}

/// An ordered change set for one stack, consumed once by the executor.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub stack: String,
    /// Operations in execution order; every dependency precedes its dependents.
    pub operations: Vec<ChangeOperation>,
    /// Desired resources that need no change.
    pub unchanged: Vec<String>,
    /// State the plan was computed against.
    pub prior: BTreeMap<String, StateRecord>,
    pub is_destroy: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Per-resource counts; a replace counts once.
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op.kind {
                OperationKind::Create => summary.creates += 1,
                OperationKind::Update => summary.updates += 1,
                OperationKind::Delete => summary.deletes += 1,
                OperationKind::CreateNew => summary.replaces += 1,
                OperationKind::DeleteOld => {}
            }
        }
        summary
    }

    /// `<id>:<kind>` for every operation, in order.
    pub fn operation_keys(&self) -> Vec<String> {
        self.operations
            .iter()
            .map(ChangeOperation::idempotency_key)
            .collect()
    }
}

/// Counts shown under a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub replaces: usize,
    pub deletes: usize,
}

impl PlanSummary {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.creates > 0 {
            parts.push(format!("{} to add", self.creates));
        }
        if self.replaces > 0 {
            parts.push(format!("{} to replace", self.replaces));
        }
        if self.updates > 0 {
            parts.push(format!("{} to change", self.updates));
        }
        if self.deletes > 0 {
            parts.push(format!("{} to destroy", self.deletes));
        }
        if parts.is_empty() {
            write!(f, "No changes.")
        } else {
            write!(f, "Plan: {}.", parts.join(", "))
        }
    }
}
