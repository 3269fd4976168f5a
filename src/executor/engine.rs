use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::resolve::AttributeTable;
use super::retry::RetryPolicy;
use crate::config::types::{DeletionPolicy, Settings};
use crate::dag::walker::{format_duration, DagWalker, TaskExecutor, TaskStatus, Verb, WalkTask};
use crate::planner::plan::{ChangeOperation, OperationKind, Plan};
use crate::provider::{ProviderCapability, ProviderError, ProviderOutput, ResolvedResource};
use crate::state::lock::StackLease;
use crate::state::models::{
    run_status, timestamp, OperationRecord, RecordStatus, StateRecord, RECORD_FORMAT_VERSION,
};

/// Knobs for one apply run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub parallelism: usize,
    pub retry: RetryPolicy,
    /// Lease TTL; the lease is renewed in the background at a third of it.
    pub lease_ttl: Duration,
    /// Print per-operation progress lines.
    pub progress: bool,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ApplyOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            parallelism: settings.parallelism,
            retry: RetryPolicy::new(
                settings.max_attempts,
                settings.base_delay,
                settings.operation_timeout,
            ),
            lease_ttl: settings.lock_ttl,
            progress: false,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Succeeded,
    Failed(String),
    Skipped(String),
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Succeeded => "succeeded",
            OperationOutcome::Failed(_) => "failed",
            OperationOutcome::Skipped(_) => "skipped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            OperationOutcome::Succeeded => None,
            OperationOutcome::Failed(r) | OperationOutcome::Skipped(r) => Some(r),
        }
    }
}

/// Outcome of one operation, in plan order.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub resource_id: String,
    pub kind: OperationKind,
    pub outcome: OperationOutcome,
    pub provider_id: Option<String>,
    /// Provider calls made, retries included.
    pub attempts: u32,
    /// A delete that left the object in place under a retain policy.
    pub retained: bool,
    pub elapsed: Duration,
}

/// Summary of an apply or destroy run.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub stack: String,
    pub results: Vec<OperationResult>,
    pub added: usize,
    pub changed: usize,
    pub destroyed: usize,
    pub retained: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed: Duration,
    pub is_destroy: bool,
    pub cancelled: bool,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// 0 when everything succeeded, 1 on partial failure.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Operations that did not succeed.
    pub fn problems(&self) -> impl Iterator<Item = &OperationResult> {
        self.results
            .iter()
            .filter(|r| r.outcome != OperationOutcome::Succeeded)
    }

    pub fn outcome_of(&self, resource_id: &str, kind: OperationKind) -> Option<&OperationOutcome> {
        self.results
            .iter()
            .find(|r| r.resource_id == resource_id && r.kind == kind)
            .map(|r| &r.outcome)
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = format_duration(self.elapsed.as_secs());
        if self.is_destroy {
            write!(f, "Destroy complete! Resources: {} destroyed", self.destroyed)?;
        } else {
            write!(
                f,
                "Apply complete! Resources: {} added, {} changed, {} destroyed",
                self.added, self.changed, self.destroyed,
            )?;
        }
        if self.retained > 0 {
            write!(f, ", {} retained", self.retained)?;
        }
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        write!(f, ". Total time: {}.", time)
    }
}

/// Shared between concurrently running operations.
struct RunContext {
    operations: Vec<ChangeOperation>,
    provider: Arc<dyn ProviderCapability>,
    lease: StackLease,
    retry: RetryPolicy,
    attributes: AttributeTable,
    provider_ids: DashMap<usize, String>,
    attempts: DashMap<usize, u32>,
    retained: DashMap<usize, ()>,
}

/// Apply a plan against a provider, saving state after every operation.
///
/// Operations run on the DAG walker in dependency order. A failed
/// operation marks its resource failed in state and skips everything that
/// depends on it; unrelated operations carry on.
pub async fn apply(
    plan: Plan,
    provider: Arc<dyn ProviderCapability>,
    lease: &StackLease,
    options: ApplyOptions,
) -> Result<ApplyResult> {
    let start = Instant::now();
    let is_destroy = plan.is_destroy;
    let operation_name = if is_destroy { "destroy" } else { "apply" };
    let stack = plan.stack.clone();

    let tasks: Vec<WalkTask> = plan
        .operations
        .iter()
        .map(|op| WalkTask {
            label: format!("{} ({})", op.resource_id, op.kind),
            verb: match op.kind {
                OperationKind::Create | OperationKind::CreateNew => Verb::CREATE,
                OperationKind::Update => Verb::UPDATE,
                OperationKind::Delete | OperationKind::DeleteOld => Verb::DELETE,
            },
            depends_on: op.depends_on.clone(),
        })
        .collect();

    let run_id = lease
        .backend()
        .start_run(lease.lease(), operation_name, plan.operations.len())
        .await?;
    info!(
        stack = %stack,
        run_id = %run_id,
        operations = plan.operations.len(),
        provider = provider.name(),
        "Starting {}",
        operation_name
    );

    let ctx = Arc::new(RunContext {
        attributes: AttributeTable::from_records(plan.prior.values()),
        operations: plan.operations,
        provider,
        lease: lease.clone(),
        retry: options.retry,
        provider_ids: DashMap::new(),
        attempts: DashMap::new(),
        retained: DashMap::new(),
    });

    let executor: TaskExecutor = {
        let ctx = Arc::clone(&ctx);
        Box::new(move |idx: usize| {
            let ctx = Arc::clone(&ctx);
            Box::pin(async move { execute_operation(&ctx, idx).await })
        })
    };

    let mut walker = DagWalker::new(options.parallelism).with_progress(options.progress);
    if let Some(cancel) = options.cancel.clone() {
        walker = walker.with_cancel(cancel);
    }

    let walk_results = {
        let _renewal = lease.keep_alive(options.lease_ttl);
        walker.walk(&tasks, Arc::new(executor)).await
    };

    let mut results = Vec::with_capacity(walk_results.len());
    for task in walk_results {
        let op = &ctx.operations[task.index];
        let outcome = match task.status {
            TaskStatus::Succeeded => OperationOutcome::Succeeded,
            TaskStatus::Failed(reason) => OperationOutcome::Failed(reason),
            TaskStatus::Skipped(reason) => OperationOutcome::Skipped(reason),
            TaskStatus::Pending | TaskStatus::Running => {
                OperationOutcome::Skipped("not scheduled".to_string())
            }
        };
        results.push(OperationResult {
            resource_id: op.resource_id.clone(),
            kind: op.kind,
            outcome,
            provider_id: ctx.provider_ids.get(&task.index).map(|p| p.value().clone()),
            attempts: ctx.attempts.get(&task.index).map(|a| *a).unwrap_or(0),
            retained: ctx.retained.contains_key(&task.index),
            elapsed: task.elapsed,
        });
    }

    let mut summary = ApplyResult {
        stack,
        results: Vec::new(),
        added: 0,
        changed: 0,
        destroyed: 0,
        retained: 0,
        succeeded: 0,
        failed: 0,
        skipped: 0,
        elapsed: Duration::ZERO,
        is_destroy,
        cancelled: options.cancel.as_ref().map(|c| *c.borrow()).unwrap_or(false),
    };
    for (sequence, result) in results.iter().enumerate() {
        match &result.outcome {
            OperationOutcome::Succeeded => {
                summary.succeeded += 1;
                match result.kind {
                    OperationKind::Create | OperationKind::CreateNew => summary.added += 1,
                    OperationKind::Update => summary.changed += 1,
                    OperationKind::Delete | OperationKind::DeleteOld if result.retained => {
                        summary.retained += 1
                    }
                    OperationKind::Delete | OperationKind::DeleteOld => summary.destroyed += 1,
                }
            }
            OperationOutcome::Failed(_) => summary.failed += 1,
            OperationOutcome::Skipped(_) => summary.skipped += 1,
        }

        let record = OperationRecord {
            sequence: sequence as i64,
            resource_id: result.resource_id.clone(),
            operation: result.kind.as_str().to_string(),
            outcome: result.outcome.as_str().to_string(),
            message: result.outcome.reason().map(str::to_string),
        };
        if let Err(e) = lease.backend().record_operation(&run_id, &record).await {
            warn!(run_id = %run_id, error = %e, "Failed to record operation outcome");
        }
    }

    let status = if summary.cancelled && summary.skipped > 0 {
        run_status::CANCELLED
    } else if summary.is_success() {
        run_status::SUCCEEDED
    } else {
        run_status::PARTIAL
    };
    lease
        .backend()
        .complete_run(&run_id, status, summary.succeeded, summary.failed, summary.skipped)
        .await?;

    summary.results = results;
    summary.elapsed = start.elapsed();
    info!(
        run_id = %run_id,
        status = status,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        "Finished {}",
        operation_name
    );
    Ok(summary)
}

/// Run one operation to completion and save its outcome.
async fn execute_operation(ctx: &RunContext, idx: usize) -> Result<Option<String>> {
    let op = &ctx.operations[idx];
    let key = op.idempotency_key();
    info!(resource = %op.resource_id, operation = %op.kind, "Starting operation");

    match op.kind {
        OperationKind::Create | OperationKind::CreateNew | OperationKind::Update => {
            apply_desired(ctx, idx, op, &key).await
        }
        OperationKind::Delete | OperationKind::DeleteOld => remove_existing(ctx, idx, op, &key).await,
    }
}

async fn apply_desired(
    ctx: &RunContext,
    idx: usize,
    op: &ChangeOperation,
    key: &str,
) -> Result<Option<String>> {
    let desired = op
        .desired
        .as_ref()
        .ok_or_else(|| anyhow!("{} {}: no desired configuration", op.resource_id, op.kind))?;

    if op.kind == OperationKind::Update && op.diff.is_state_only() {
        if let Some(prior) = op.prior.as_ref().filter(|r| r.status == RecordStatus::Applied) {
            return rewrite_record(ctx, idx, op, prior, desired.deletion_policy).await;
        }
    }

    let properties = match ctx.attributes.resolve_properties(&desired.properties) {
        Ok(properties) => properties,
        Err(e) => {
            ctx.attempts.insert(idx, 0);
            return Err(fail(ctx, op, e.to_string()).await);
        }
    };
    let resolved = ResolvedResource {
        id: op.resource_id.clone(),
        resource_type: desired.resource_type.clone(),
        properties,
        idempotency_key: key.to_string(),
    };

    let call: Result<(ProviderOutput, u32), (ProviderError, u32)> = match op.kind {
        OperationKind::Update => {
            let Some(provider_id) = op.prior.as_ref().and_then(|r| r.provider_id.clone()) else {
                return Err(fail(ctx, op, "no provider ID recorded for update".to_string()).await);
            };
            let changed = op.diff.changed_names();
            ctx.retry
                .run(key, || ctx.provider.update(&provider_id, &resolved, &changed))
                .await
        }
        _ => ctx.retry.run(key, || ctx.provider.create(&resolved)).await,
    };

    let output = match call {
        Ok((output, attempts)) => {
            ctx.attempts.insert(idx, attempts);
            output
        }
        Err((e, attempts)) => {
            ctx.attempts.insert(idx, attempts);
            let reason = if attempts > 1 {
                format!("{} (after {} attempts)", e, attempts)
            } else {
                e.to_string()
            };
            return Err(fail(ctx, op, reason).await);
        }
    };

    let now = timestamp(Utc::now());
    let mut record = match (&op.prior, op.kind) {
        (Some(prior), OperationKind::Update) => prior.clone(),
        _ => StateRecord::new(&op.resource_id, &desired.resource_type),
    };
    record.resource_type = desired.resource_type.clone();
    record.provider_id = Some(output.provider_id.clone());
    record.properties = desired.properties.clone();
    record.resolved = resolved.properties;
    record.attributes = output.attributes;
    record.dependencies = desired.dependencies();
    record.deletion_policy = desired.deletion_policy;
    record.status = RecordStatus::Applied;
    record.error = None;
    record.format_version = RECORD_FORMAT_VERSION;
    record.updated_at = now;
    record.refresh_fingerprint();

    ctx.lease.save_record(&record).await?;
    ctx.attributes
        .insert(&record.id, &output.provider_id, &record.attributes);
    ctx.provider_ids.insert(idx, output.provider_id.clone());
    info!(
        resource = %op.resource_id,
        operation = %op.kind,
        provider_id = %output.provider_id,
        "Operation succeeded"
    );
    Ok(Some(output.provider_id))
}

async fn remove_existing(
    ctx: &RunContext,
    idx: usize,
    op: &ChangeOperation,
    key: &str,
) -> Result<Option<String>> {
    let prior = op.prior.as_ref();
    let provider_id = prior.and_then(|r| r.provider_id.clone());
    let retain = prior.is_some_and(|r| r.deletion_policy == DeletionPolicy::Retain);

    if let (true, Some(pid)) = (retain, provider_id.as_ref()) {
        ctx.attempts.insert(idx, 0);
        ctx.retained.insert(idx, ());
        info!(resource = %op.resource_id, provider_id = %pid, "Retaining object; removing it from state only");
    } else if let Some(ref pid) = provider_id {
        let call = ctx
            .retry
            .run(key, || ctx.provider.delete(pid, &op.resource_type, key))
            .await;
        match call {
            Ok(((), attempts)) => {
                ctx.attempts.insert(idx, attempts);
            }
            Err((ProviderError::NotFound(_), attempts)) => {
                ctx.attempts.insert(idx, attempts);
                info!(resource = %op.resource_id, provider_id = %pid, "Already gone");
            }
            Err((e, attempts)) => {
                ctx.attempts.insert(idx, attempts);
                return Err(fail(ctx, op, e.to_string()).await);
            }
        }
    }

    ctx.attributes.remove(&op.resource_id);
    match (op.kind, prior) {
        (OperationKind::DeleteOld, Some(prior)) => {
            // The old object is gone; keep the record until create-new lands
            let mut record = prior.clone();
            record.provider_id = None;
            record.attributes.clear();
            record.status = RecordStatus::Pending;
            record.error = None;
            record.updated_at = timestamp(Utc::now());
            ctx.lease.save_record(&record).await?;
        }
        _ => {
            ctx.lease.remove_record(&op.resource_id).await?;
        }
    }

    if let Some(ref pid) = provider_id {
        ctx.provider_ids.insert(idx, pid.clone());
    }
    info!(resource = %op.resource_id, operation = %op.kind, "Operation succeeded");
    Ok(provider_id)
}

/// Save a changed deletion policy without calling the provider.
async fn rewrite_record(
    ctx: &RunContext,
    idx: usize,
    op: &ChangeOperation,
    prior: &StateRecord,
    policy: DeletionPolicy,
) -> Result<Option<String>> {
    let mut record = prior.clone();
    record.deletion_policy = policy;
    record.updated_at = timestamp(Utc::now());
    ctx.lease.save_record(&record).await?;
    ctx.attempts.insert(idx, 0);
    if let Some(ref pid) = record.provider_id {
        ctx.provider_ids.insert(idx, pid.clone());
    }
    info!(resource = %op.resource_id, deletion_policy = %policy, "Updated deletion policy in state");
    Ok(record.provider_id)
}

/// Record the resource as failed and build the error reported for the
/// operation. Prior applied properties are kept.
async fn fail(ctx: &RunContext, op: &ChangeOperation, reason: String) -> anyhow::Error {
    error!(resource = %op.resource_id, operation = %op.kind, reason = %reason, "Operation failed");

    let mut record = match &op.prior {
        Some(prior) => prior.clone(),
        None => {
            let mut record = StateRecord::new(&op.resource_id, &op.resource_type);
            if let Some(ref desired) = op.desired {
                record.dependencies = desired.dependencies();
            }
            record
        }
    };
    if op.kind == OperationKind::CreateNew {
        // delete-old already removed the object the prior record points at
        record.provider_id = None;
        record.attributes.clear();
    }
    record.status = RecordStatus::Failed;
    record.error = Some(reason.clone());
    record.updated_at = timestamp(Utc::now());
    if let Err(e) = ctx.lease.save_record(&record).await {
        error!(resource = %op.resource_id, error = %e, "Failed to record failure in state");
    }

    anyhow!(reason)
}
