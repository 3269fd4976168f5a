use std::collections::BTreeMap;

use crate::provider::{ProviderCapability, ProviderError};
use crate::state::models::StateRecord;

/// A resource whose real state no longer matches what keel last applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftResult {
    pub resource_id: String,
    pub provider_id: String,
    pub drift_type: DriftType,
}

/// Type of drift detected.
#[derive(Debug, Clone, PartialEq)]
pub enum DriftType {
    /// The provider no longer knows the resource.
    Missing,
    /// Properties differ from the last-applied values.
    Changed(Vec<PropertyDrift>),
    /// The provider could not be asked.
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDrift {
    pub name: String,
    pub expected: serde_json::Value,
    pub actual: Option<serde_json::Value>,
}

/// Describe every applied record via the provider and report divergence.
///
/// Only properties keel sent are compared; attributes the provider adds on
/// its own are not drift.
pub async fn detect_drift(
    records: &BTreeMap<String, StateRecord>,
    provider: &dyn ProviderCapability,
) -> Vec<DriftResult> {
    let mut drifts = Vec::new();

    for record in records.values().filter(|r| r.is_live()) {
        let Some(provider_id) = record.provider_id.as_deref() else {
            continue;
        };
        let drift_type = match provider.describe(provider_id, &record.resource_type).await {
            Err(ProviderError::NotFound(_)) => Some(DriftType::Missing),
            Err(e) => Some(DriftType::Unknown(e.to_string())),
            Ok(actual) => {
                let changed: Vec<PropertyDrift> = record
                    .resolved
                    .iter()
                    .filter(|(name, expected)| actual.get(name.as_str()) != Some(*expected))
                    .map(|(name, expected)| PropertyDrift {
                        name: name.clone(),
                        expected: expected.clone(),
                        actual: actual.get(name.as_str()).cloned(),
                    })
                    .collect();
                (!changed.is_empty()).then_some(DriftType::Changed(changed))
            }
        };

        if let Some(drift_type) = drift_type {
            tracing::debug!(id = %record.id, provider_id, drift = ?drift_type, "Drift detected");
            drifts.push(DriftResult {
                resource_id: record.id.clone(),
                provider_id: provider_id.to_string(),
                drift_type,
            });
        }
    }

    drifts
}
