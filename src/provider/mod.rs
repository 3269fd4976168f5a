pub mod local;
pub mod schema;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use schema::SchemaRegistry;

/// Properties sent to a provider, with every reference already resolved.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// A resource ready to hand to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    pub id: String,
    pub resource_type: String,
    pub properties: PropertyMap,
    /// `<logical-id>:<operation kind>`; stable across retries of one operation.
    pub idempotency_key: String,
}

/// What a provider reports after a successful create or update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOutput {
    pub provider_id: String,
    /// Attributes other resources may reference, e.g. `arn` or `endpoint`.
    pub attributes: PropertyMap,
}

/// Errors returned by provider calls, classified for retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    Other { message: String, transient: bool },
}

impl ProviderError {
    /// Transient errors are retried with backoff; the rest fail immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::RateLimited(_)
            | ProviderError::Network(_) => true,
            ProviderError::Validation(_)
            | ProviderError::PermissionDenied(_)
            | ProviderError::NotFound(_) => false,
            ProviderError::Other { transient, .. } => *transient,
        }
    }
}

/// What the engine needs from a vendor integration.
///
/// One implementation per vendor; the engine never branches on which one it
/// is talking to.
#[async_trait]
pub trait ProviderCapability: Send + Sync {
    /// Short name used in logs and `settings.provider`.
    fn name(&self) -> &str;

    /// Per-type immutability metadata.
    fn schemas(&self) -> SchemaRegistry {
        SchemaRegistry::new()
    }

    async fn create(&self, resource: &ResolvedResource) -> Result<ProviderOutput, ProviderError>;

    /// Apply changed properties in place. `changed` names the properties
    /// that differ from the last-applied state.
    async fn update(
        &self,
        provider_id: &str,
        resource: &ResolvedResource,
        changed: &BTreeSet<String>,
    ) -> Result<ProviderOutput, ProviderError>;

    async fn delete(
        &self,
        provider_id: &str,
        resource_type: &str,
        idempotency_key: &str,
    ) -> Result<(), ProviderError>;

    /// Current properties of a provisioned resource, or `NotFound`.
    async fn describe(
        &self,
        provider_id: &str,
        resource_type: &str,
    ) -> Result<PropertyMap, ProviderError>;
}

/// Build the provider named in `settings.provider`.
pub fn from_name(
    name: &str,
    working_dir: &std::path::Path,
) -> anyhow::Result<Arc<dyn ProviderCapability>> {
    match name {
        "local" => Ok(Arc::new(local::LocalProvider::open(
            working_dir.join(local::INVENTORY_FILE),
        )?)),
        "memory" => Ok(Arc::new(local::LocalProvider::in_memory())),
        other => anyhow::bail!(
            "Unknown provider '{}'. Available providers: local, memory",
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(ProviderError::RateLimited("slow down".into()).is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(!ProviderError::Validation("bad cidr".into()).is_transient());
        assert!(!ProviderError::PermissionDenied("iam".into()).is_transient());
        assert!(!ProviderError::NotFound("vpc-1".into()).is_transient());
        assert!(ProviderError::Other {
            message: "503".into(),
            transient: true
        }
        .is_transient());
    }
}
