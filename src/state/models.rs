use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::types::{DeletionPolicy, Properties, PropertyValue};
use crate::error::EngineError;
use crate::provider::PropertyMap;

/// Current per-record layout. Records written with an older layout are
/// upgraded when read.
pub const RECORD_FORMAT_VERSION: u32 = 2;

// ─── Resource-Level State ───────────────────────────────────────────────────

/// Lifecycle of a state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Applied,
    Failed,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Applied => "applied",
            RecordStatus::Failed => "failed",
            RecordStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "applied" => Ok(RecordStatus::Applied),
            "failed" => Ok(RecordStatus::Failed),
            "deleted" => Ok(RecordStatus::Deleted),
            other => Err(EngineError::State(format!("unknown record status '{}'", other))),
        }
    }
}

/// Last-applied state of one resource, keyed by logical ID within a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: String,
    pub resource_type: String,
    pub provider_id: Option<String>,
    /// Declared properties as last applied, references unresolved.
    pub properties: Properties,
    /// The same properties with references resolved, as sent to the provider.
    pub resolved: PropertyMap,
    /// Attributes the provider reported back.
    pub attributes: PropertyMap,
    pub dependencies: BTreeSet<String>,
    /// Policy the resource was last applied with; decides whether a delete
    /// reaches the provider.
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    pub status: RecordStatus,
    pub fingerprint: String,
    pub error: Option<String>,
    pub format_version: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl StateRecord {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        let now = timestamp(Utc::now());
        let resource_type = resource_type.into();
        Self {
            id: id.into(),
            fingerprint: fingerprint(&resource_type, &Properties::new()),
            resource_type,
            provider_id: None,
            properties: Properties::new(),
            resolved: PropertyMap::new(),
            attributes: PropertyMap::new(),
            dependencies: BTreeSet::new(),
            deletion_policy: DeletionPolicy::Delete,
            status: RecordStatus::Pending,
            error: None,
            format_version: RECORD_FORMAT_VERSION,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Recompute the fingerprint after properties change.
    pub fn refresh_fingerprint(&mut self) {
        self.fingerprint = fingerprint(&self.resource_type, &self.properties);
    }

    pub fn is_live(&self) -> bool {
        self.status != RecordStatus::Deleted && self.provider_id.is_some()
    }
}

/// SHA-256 over the type tag and the canonical JSON of the properties.
///
/// Properties are held in ordered maps, so equal property sets always give
/// the same fingerprint regardless of declaration order.
pub fn fingerprint(resource_type: &str, properties: &Properties) -> String {
    let body = serde_json::Value::Object(
        properties
            .iter()
            .map(|(k, v)| (k.clone(), PropertyValue::to_json(v)))
            .collect(),
    );
    let mut hasher = Sha256::new();
    hasher.update(resource_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that they
/// compare correctly as text.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

// ─── Leases ─────────────────────────────────────────────────────────────────

/// A single-writer lease on one stack's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub stack: String,
    pub holder: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// ─── Outputs ────────────────────────────────────────────────────────────────

/// A stack output as last evaluated. `value` is `None` when the output
/// references a resource that is not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub name: String,
    pub value: Option<serde_json::Value>,
    pub description: Option<String>,
}

// ─── Runs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub stack: String,
    pub operation: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub planned: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
}

/// Run status values.
pub mod run_status {
    pub const RUNNING: &str = "running";
    pub const SUCCEEDED: &str = "succeeded";
    pub const PARTIAL: &str = "partial";
    pub const CANCELLED: &str = "cancelled";
}

/// Outcome of one operation within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub sequence: i64,
    pub resource_id: String,
    pub operation: String,
    pub outcome: String,
    pub message: Option<String>,
}
