use std::collections::{BTreeMap, BTreeSet};

/// Per-type metadata the planner needs but the engine does not hard-code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Properties that cannot change in place; changing one forces replacement.
    pub immutable: BTreeSet<String>,
}

impl ResourceSchema {
    pub fn immutable<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            immutable: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_immutable(&self, property: &str) -> bool {
        self.immutable.contains(property)
    }
}

/// Schemas keyed by resource type tag.
///
/// Built from the provider's own metadata, then overlaid with whatever the
/// stack file declares under `schemas:`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<String, ResourceSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, resource_type: impl Into<String>, schema: ResourceSchema) -> Self {
        self.insert(resource_type, schema);
        self
    }

    pub fn insert(&mut self, resource_type: impl Into<String>, schema: ResourceSchema) {
        self.types.insert(resource_type.into(), schema);
    }

    /// Union the immutable sets of `other` into this registry.
    pub fn merge(&mut self, other: &SchemaRegistry) {
        for (resource_type, schema) in &other.types {
            self.types
                .entry(resource_type.clone())
                .or_default()
                .immutable
                .extend(schema.immutable.iter().cloned());
        }
    }

    /// Schema for a type; unknown types have no immutable properties.
    pub fn get(&self, resource_type: &str) -> ResourceSchema {
        self.types.get(resource_type).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
