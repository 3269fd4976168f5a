use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::config::types::{Properties, PropertyValue, Reference, Segment};
use crate::provider::PropertyMap;
use crate::state::models::{RecordStatus, StateRecord};

/// Attribute name that always resolves to the provider-assigned ID.
pub const ID_ATTRIBUTE: &str = "id";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("reference {reference}: resource '{resource}' has not been applied")]
    NotApplied { reference: String, resource: String },

    #[error("reference {reference}: resource '{resource}' has no attribute '{attribute}'")]
    UnknownAttribute {
        reference: String,
        resource: String,
        attribute: String,
    },
}

/// Attributes of applied resources, shared between concurrently running
/// operations. Each entry includes `id`.
#[derive(Debug, Default)]
pub struct AttributeTable {
    entries: DashMap<String, PropertyMap>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from records that are applied.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a StateRecord>) -> Self {
        let table = Self::new();
        for record in records {
            if record.status != RecordStatus::Applied {
                continue;
            }
            if let Some(ref pid) = record.provider_id {
                table.insert(&record.id, pid, &record.attributes);
            }
        }
        table
    }

    pub fn insert(&self, id: &str, provider_id: &str, attributes: &PropertyMap) {
        let mut entry = attributes.clone();
        entry.insert(ID_ATTRIBUTE.to_string(), Value::String(provider_id.to_string()));
        self.entries.insert(id.to_string(), entry);
    }

    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn lookup(&self, reference: &Reference) -> Result<Value, ResolveError> {
        let entry = self
            .entries
            .get(&reference.resource)
            .ok_or_else(|| ResolveError::NotApplied {
                reference: reference.to_string(),
                resource: reference.resource.clone(),
            })?;
        entry
            .get(&reference.attribute)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownAttribute {
                reference: reference.to_string(),
                resource: reference.resource.clone(),
                attribute: reference.attribute.clone(),
            })
    }

    /// Resolve every reference in a property map.
    pub fn resolve_properties(&self, properties: &Properties) -> Result<PropertyMap, ResolveError> {
        properties
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.resolve(value)?)))
            .collect()
    }

    pub fn resolve(&self, value: &PropertyValue) -> Result<Value, ResolveError> {
        Ok(match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Number(n) => Value::Number(n.clone()),
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve(item))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            PropertyValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                    .collect::<Result<PropertyMap, ResolveError>>()?,
            ),
            PropertyValue::Reference(r) => self.lookup(r)?,
            PropertyValue::Interpolated(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(s) => out.push_str(s),
                        Segment::Reference(r) => match self.lookup(r)? {
                            Value::String(s) => out.push_str(&s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Value::String(out)
            }
        })
    }
}
