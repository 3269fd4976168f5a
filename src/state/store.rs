use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::backend::StateBackend;
use super::lock::StackLease;
use super::models::{Lease, OutputValue, RunRecord, StateRecord};

/// One stack's view of a state backend.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    stack: String,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>, stack: impl Into<String>) -> Self {
        Self {
            backend,
            stack: stack.into(),
        }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Last-applied records keyed by logical ID.
    pub async fn load(&self) -> Result<BTreeMap<String, StateRecord>> {
        self.backend.load_records(&self.stack).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        self.backend.get_record(&self.stack, id).await
    }

    /// Take the stack's single-writer lease.
    pub async fn lock(&self, holder: &str, operation: &str, ttl: Duration) -> Result<StackLease> {
        let lease = self
            .backend
            .acquire_lease(&self.stack, holder, operation, ttl)
            .await?;
        tracing::debug!(
            stack = %self.stack,
            lease_id = %lease.lease_id,
            expires_at = %lease.expires_at,
            "Acquired lease"
        );
        Ok(StackLease::new(Arc::clone(&self.backend), lease))
    }

    pub async fn current_lease(&self) -> Result<Option<Lease>> {
        self.backend.current_lease(&self.stack).await
    }

    pub async fn force_unlock(&self) -> Result<Option<Lease>> {
        self.backend.force_unlock(&self.stack).await
    }

    pub async fn outputs(&self) -> Result<Vec<OutputValue>> {
        self.backend.list_outputs(&self.stack).await
    }

    pub async fn runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.backend.list_runs(&self.stack, limit).await
    }
}
