use std::collections::{BTreeSet, HashSet};

use super::types::StackConfig;
use crate::error::EngineError;

/// Validate a loaded stack for correctness.
///
/// Reference targets and cycles are checked when the resource graph is built;
/// this covers what the graph cannot see.
pub fn validate(stack: &StackConfig) -> Result<(), EngineError> {
    validate_stack_name(stack)?;
    validate_resources(stack)?;
    validate_outputs(stack)?;
    Ok(())
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_stack_name(stack: &StackConfig) -> Result<(), EngineError> {
    if !is_valid_id(&stack.name) {
        return Err(EngineError::InvalidConfig(format!(
            "stack name '{}' must be non-empty and use only letters, digits, '_' or '-'",
            stack.name
        )));
    }
    Ok(())
}

/// IDs are unique and well-formed; every resource has a type.
fn validate_resources(stack: &StackConfig) -> Result<(), EngineError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for resource in &stack.resources {
        if !is_valid_id(&resource.id) {
            return Err(EngineError::InvalidConfig(format!(
                "resource ID '{}' must be non-empty and use only letters, digits, '_' or '-'",
                resource.id
            )));
        }
        if !seen.insert(resource.id.as_str()) {
            return Err(EngineError::DuplicateResource(resource.id.clone()));
        }
        if resource.resource_type.trim().is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "resource '{}' has an empty type",
                resource.id
            )));
        }
    }
    Ok(())
}

/// Enabled outputs may only reference declared resources. A disabled output
/// may point at a resource left out by the same condition.
fn validate_outputs(stack: &StackConfig) -> Result<(), EngineError> {
    let ids: HashSet<&str> = stack.resources.iter().map(|r| r.id.as_str()).collect();
    for output in stack.outputs.iter().filter(|o| o.enabled) {
        let mut refs = BTreeSet::new();
        output.value.collect_references(&mut refs);
        if let Some(missing) = refs.iter().find(|r| !ids.contains(r.as_str())) {
            return Err(EngineError::InvalidConfig(format!(
                "output '{}' references unknown resource '{}'",
                output.name, missing
            )));
        }
    }
    Ok(())
}
