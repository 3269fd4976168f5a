use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::models::{Lease, OperationRecord, OutputValue, RunRecord, StateRecord};

/// Pluggable state backend.
///
/// Reads are free; every write takes the [`Lease`] held on the stack and
/// fails with `EngineError::LeaseLost` if it is no longer current.
#[async_trait]
pub trait StateBackend: Send + Sync {
    // ─── Initialization ─────────────────────────────────────────────────────

    /// Initialize the backend (create tables, run migrations).
    async fn initialize(&self) -> Result<()>;

    // ─── Records ────────────────────────────────────────────────────────────

    /// All records of a stack keyed by logical ID.
    async fn load_records(&self, stack: &str) -> Result<BTreeMap<String, StateRecord>>;

    async fn get_record(&self, stack: &str, id: &str) -> Result<Option<StateRecord>>;

    /// Insert or replace one record.
    async fn put_record(&self, lease: &Lease, record: &StateRecord) -> Result<()>;

    /// Remove one record. Returns whether it existed.
    async fn remove_record(&self, lease: &Lease, id: &str) -> Result<bool>;

    /// Replace every record of the stack in one transaction.
    async fn replace_all(&self, lease: &Lease, records: &[StateRecord]) -> Result<()>;

    // ─── Leases ─────────────────────────────────────────────────────────────

    /// Take the stack's single-writer lease.
    ///
    /// Fails with `EngineError::LockContention` while another unexpired lease
    /// exists; an expired lease is reclaimed.
    async fn acquire_lease(
        &self,
        stack: &str,
        holder: &str,
        operation: &str,
        ttl: Duration,
    ) -> Result<Lease>;

    /// Push the expiry of a held lease out by `ttl`.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;

    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// The lease currently recorded for a stack, expired or not.
    async fn current_lease(&self, stack: &str) -> Result<Option<Lease>>;

    /// Drop any lease on the stack (operator escape hatch).
    async fn force_unlock(&self, stack: &str) -> Result<Option<Lease>>;

    // ─── Outputs ────────────────────────────────────────────────────────────

    /// Replace the stack's outputs.
    async fn set_outputs(&self, lease: &Lease, outputs: &[OutputValue]) -> Result<()>;

    async fn list_outputs(&self, stack: &str) -> Result<Vec<OutputValue>>;

    // ─── Runs ───────────────────────────────────────────────────────────────

    /// Start a new execution run. Returns the run ID.
    async fn start_run(&self, lease: &Lease, operation: &str, planned: usize) -> Result<String>;

    async fn record_operation(&self, run_id: &str, operation: &OperationRecord) -> Result<()>;

    async fn complete_run(
        &self,
        run_id: &str,
        status: &str,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    ) -> Result<()>;

    async fn list_runs(&self, stack: &str, limit: usize) -> Result<Vec<RunRecord>>;

    async fn list_run_operations(&self, run_id: &str) -> Result<Vec<OperationRecord>>;
}
