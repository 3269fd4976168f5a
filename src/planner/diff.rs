use std::collections::BTreeSet;

use crate::config::types::{DeletionPolicy, Properties, PropertyValue, Resource};
use crate::provider::schema::ResourceSchema;
use crate::state::models::StateRecord;

/// One property that differs between desired and last-applied state.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub name: String,
    pub before: Option<PropertyValue>,
    pub after: Option<PropertyValue>,
    /// The property is immutable for this type, so the resource is replaced.
    pub forces_replace: bool,
    /// Declared value is the same, but it references this resource, which
    /// is being replaced; the resolved value will differ.
    pub upstream: Option<String>,
}

/// Property-level difference for one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDiff {
    pub changes: Vec<PropertyChange>,
    /// `(before, after)` when the type tag itself changed.
    pub type_change: Option<(String, String)>,
    /// `(before, after)` when only keel's handling of the object changes.
    pub policy_change: Option<(DeletionPolicy, DeletionPolicy)>,
}

impl PropertyDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.type_change.is_none() && self.policy_change.is_none()
    }

    /// Nothing the provider sees has changed; only the state record needs
    /// rewriting.
    pub fn is_state_only(&self) -> bool {
        self.changes.is_empty() && self.type_change.is_none() && self.policy_change.is_some()
    }

    pub fn requires_replace(&self) -> bool {
        self.type_change.is_some() || self.changes.iter().any(|c| c.forces_replace)
    }

    pub fn changed_names(&self) -> BTreeSet<String> {
        self.changes.iter().map(|c| c.name.clone()).collect()
    }

    /// Every desired property shown as an addition.
    pub fn additions(properties: &Properties) -> Self {
        Self {
            changes: properties
                .iter()
                .map(|(name, value)| PropertyChange {
                    name: name.clone(),
                    before: None,
                    after: Some(value.clone()),
                    forces_replace: false,
                    upstream: None,
                })
                .collect(),
            type_change: None,
            policy_change: None,
        }
    }

    /// Every recorded property shown as a removal.
    pub fn removals(properties: &Properties) -> Self {
        Self {
            changes: properties
                .iter()
                .map(|(name, value)| PropertyChange {
                    name: name.clone(),
                    before: Some(value.clone()),
                    after: None,
                    forces_replace: false,
                    upstream: None,
                })
                .collect(),
            type_change: None,
            policy_change: None,
        }
    }
}

/// Compare a desired resource to its last-applied record.
///
/// `replaced` holds IDs already known to be replaced in this plan; any
/// property referencing one of them counts as changed.
pub fn diff_resource(
    desired: &Resource,
    prior: &StateRecord,
    schema: &ResourceSchema,
    replaced: &BTreeSet<String>,
) -> PropertyDiff {
    let names: BTreeSet<&str> = desired
        .properties
        .keys()
        .chain(prior.properties.keys())
        .map(String::as_str)
        .collect();

    let mut changes = Vec::new();
    for name in names {
        let before = prior.properties.get(name);
        let after = desired.properties.get(name);

        let upstream = if before == after {
            after.and_then(|value| {
                let mut refs = BTreeSet::new();
                value.collect_references(&mut refs);
                refs.into_iter().find(|r| replaced.contains(r))
            })
        } else {
            None
        };
        if before == after && upstream.is_none() {
            continue;
        }

        changes.push(PropertyChange {
            name: name.to_string(),
            before: before.cloned(),
            after: after.cloned(),
            forces_replace: schema.is_immutable(name),
            upstream,
        });
    }

    let type_change = (desired.resource_type != prior.resource_type)
        .then(|| (prior.resource_type.clone(), desired.resource_type.clone()));

    let policy_change = (desired.deletion_policy != prior.deletion_policy)
        .then_some((prior.deletion_policy, desired.deletion_policy));

    PropertyDiff {
        changes,
        type_change,
        policy_change,
    }
}
