use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use super::resolve::AttributeTable;
use crate::config::types::OutputConfig;
use crate::state::lock::StackLease;
use crate::state::models::{OutputValue, StateRecord};

/// Evaluate stack outputs against state.
///
/// Disabled outputs are left out. An output that references a resource
/// which is not applied comes back with an unknown (`None`) value.
pub fn evaluate_outputs(
    outputs: &[OutputConfig],
    records: &BTreeMap<String, StateRecord>,
) -> Vec<OutputValue> {
    let table = AttributeTable::from_records(records.values());
    outputs
        .iter()
        .filter(|output| output.enabled)
        .map(|output| {
            let value = match table.resolve(&output.value) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(output = %output.name, reason = %e, "Output value unknown");
                    None
                }
            };
            OutputValue {
                name: output.name.clone(),
                value,
                description: output.description.clone(),
            }
        })
        .collect()
}

/// Evaluate outputs against the stack's current state and store them.
pub async fn publish_outputs(lease: &StackLease, outputs: &[OutputConfig]) -> Result<Vec<OutputValue>> {
    let records = lease.backend().load_records(lease.stack()).await?;
    let values = evaluate_outputs(outputs, &records);
    lease.set_outputs(&values).await?;
    debug!(stack = %lease.stack(), outputs = values.len(), "Stored outputs");
    Ok(values)
}
