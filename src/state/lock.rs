use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::backend::StateBackend;
use super::models::{Lease, OutputValue, StateRecord};

/// Default lease time-to-live in seconds.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 900;

/// Identify this process as a lease holder: `user@pid-xxxxxxxx`.
pub fn generate_holder_id() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{}@{}-{}", user, std::process::id(), &short[..8])
}

/// Handle proving the holder owns a stack's single-writer lease.
///
/// Every state write goes through it, so code without a lease cannot write.
#[derive(Clone)]
pub struct StackLease {
    backend: Arc<dyn StateBackend>,
    lease: Lease,
}

impl StackLease {
    pub(crate) fn new(backend: Arc<dyn StateBackend>, lease: Lease) -> Self {
        Self { backend, lease }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn stack(&self) -> &str {
        &self.lease.stack
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Incremental save of one record.
    pub async fn save_record(&self, record: &StateRecord) -> Result<()> {
        self.backend.put_record(&self.lease, record).await
    }

    pub async fn remove_record(&self, id: &str) -> Result<bool> {
        self.backend.remove_record(&self.lease, id).await
    }

    /// Replace the stack's whole record set.
    pub async fn save(&self, records: &[StateRecord]) -> Result<()> {
        self.backend.replace_all(&self.lease, records).await
    }

    pub async fn set_outputs(&self, outputs: &[OutputValue]) -> Result<()> {
        self.backend.set_outputs(&self.lease, outputs).await
    }

    /// Extend the lease; returns the new expiry.
    pub async fn renew(&self, ttl: Duration) -> Result<DateTime<Utc>> {
        Ok(self.backend.renew_lease(&self.lease, ttl).await?.expires_at)
    }

    pub async fn release(self) -> Result<()> {
        self.backend.release_lease(&self.lease).await
    }

    /// Renew the lease in the background every third of its TTL until the
    /// returned guard is dropped.
    pub fn keep_alive(&self, ttl: Duration) -> RenewalGuard {
        let handle = self.clone();
        let interval = (ttl / 3).max(Duration::from_millis(100));
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match handle.renew(ttl).await {
                    Ok(expires_at) => {
                        tracing::debug!(stack = %handle.stack(), %expires_at, "Renewed lease")
                    }
                    Err(e) => {
                        tracing::error!(stack = %handle.stack(), error = %e, "Lease renewal failed");
                        break;
                    }
                }
            }
        });
        RenewalGuard { task }
    }
}

/// Stops background lease renewal when dropped.
pub struct RenewalGuard {
    task: JoinHandle<()>,
}

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
