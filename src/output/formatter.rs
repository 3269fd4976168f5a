use colored::Colorize;

use crate::config::types::{DeletionPolicy, PropertyValue};
use crate::executor::engine::{ApplyResult, OperationOutcome};
use crate::planner::diff::PropertyChange;
use crate::planner::drift::{DriftResult, DriftType};
use crate::planner::plan::{ChangeKind, ChangeOperation, OperationKind, Plan};
use crate::state::models::{OutputValue, RecordStatus, StateRecord};

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg.red());
}

type Paint = fn(&str) -> colored::ColoredString;

fn paint_for(change: ChangeKind) -> Paint {
    match change {
        ChangeKind::Create => |s: &str| s.green(),
        ChangeKind::Update => |s: &str| s.yellow(),
        ChangeKind::Replace => |s: &str| s.magenta(),
        ChangeKind::Delete => |s: &str| s.red(),
    }
}

/// Print an execution plan: legend, one block per resource, then counts.
pub fn print_plan(plan: &Plan) {
    println!();

    if plan.is_empty() {
        println!("{}", "No changes. Infrastructure is up-to-date.".green());
        return;
    }

    println!("Resource actions are indicated with the following symbols:");
    let has = |kind: ChangeKind| plan.operations.iter().any(|op| op.change == kind);
    if has(ChangeKind::Create) {
        println!("  {} create", "+".green().bold());
    }
    if has(ChangeKind::Update) {
        println!("  {} update in-place", "~".yellow().bold());
    }
    if has(ChangeKind::Replace) {
        println!("  {} destroy and then create replacement", "-/+".magenta().bold());
    }
    if has(ChangeKind::Delete) {
        println!("  {} destroy", "-".red().bold());
    }

    println!();
    println!("keel will perform the following actions, in order:");
    println!();

    for (position, op) in plan.operations.iter().enumerate() {
        // A replace is shown once, at its delete-old step
        if op.kind == OperationKind::CreateNew {
            continue;
        }
        print_operation(position, op);
    }

    println!("{}", plan.summary());
    println!();
}

fn print_operation(position: usize, op: &ChangeOperation) {
    let paint = paint_for(op.change);
    let retained = op.kind.is_delete()
        && op
            .prior
            .as_ref()
            .is_some_and(|r| r.deletion_policy == DeletionPolicy::Retain);
    let description = match op.change {
        ChangeKind::Create => "will be created",
        ChangeKind::Update => "will be updated in-place",
        ChangeKind::Replace if retained => "must be replaced (old object is retained)",
        ChangeKind::Replace => "must be replaced",
        ChangeKind::Delete if retained => "will be removed from state (object is retained)",
        ChangeKind::Delete => "will be destroyed",
    };

    println!(
        "  {} {} {}",
        "#".dimmed(),
        op.resource_id.bold(),
        description.dimmed()
    );
    if let Some((before, after)) = &op.diff.type_change {
        println!(
            "  {} type {} -> {} {}",
            "#".dimmed(),
            before,
            after,
            "(forces replacement)".dimmed()
        );
    }
    if let Some((before, after)) = &op.diff.policy_change {
        println!("  {} deletion_policy {} -> {}", "#".dimmed(), before, after);
    }
    let header = format!("  {} {} \"{}\" {{", op.change, op.resource_type, op.resource_id);
    println!("{}    {}", paint(&header), format!("[{}]", position + 1).dimmed());

    let width = op
        .diff
        .changes
        .iter()
        .map(|c| c.name.len())
        .max()
        .unwrap_or(0)
        .min(35);
    for change in &op.diff.changes {
        println!("{}", paint(&format_change(op.change, change, width)));
    }

    let closing = format!("  {} }}", if op.change == ChangeKind::Delete { "-" } else { " " });
    println!("{}", paint(&closing));
    println!();
}

fn format_change(kind: ChangeKind, change: &PropertyChange, width: usize) -> String {
    let marker = match (&change.before, &change.after) {
        (None, Some(_)) => "+",
        (Some(_), None) => "-",
        _ if kind == ChangeKind::Replace && change.forces_replace => "#",
        _ => "~",
    };
    let mut line = match (&change.before, &change.after) {
        (Some(before), Some(after)) if before != after => format!(
            "      {} {:<width$} = {} -> {}",
            marker,
            change.name,
            format_property(before),
            format_property(after),
            width = width
        ),
        (_, Some(value)) | (Some(value), None) => format!(
            "      {} {:<width$} = {}",
            marker,
            change.name,
            format_property(value),
            width = width
        ),
        (None, None) => format!("      {} {}", marker, change.name),
    };
    if change.forces_replace {
        line.push_str(" # forces replacement");
    }
    if let Some(ref upstream) = change.upstream {
        line.push_str(&format!(" # '{}' is replaced", upstream));
    }
    line
}

/// Format a declared value; references show until they are known.
pub fn format_property(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Reference(_) | PropertyValue::Interpolated(_) => {
            format!("{} (known after apply)", format_value_short(&value.to_json()))
        }
        other => format_value_short(&other.to_json()),
    }
}

/// Format a JSON value for short inline display.
pub fn format_value_short(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("\"{}\"", s),
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Array(arr) => {
            if arr.is_empty() {
                "[]".to_string()
            } else if arr.len() <= 4 && arr.iter().all(|v| !v.is_array() && !v.is_object()) {
                let items: Vec<String> = arr.iter().map(format_value_short).collect();
                format!("[{}]", items.join(", "))
            } else {
                format!("[...{} items]", arr.len())
            }
        }
        serde_json::Value::Object(obj) => {
            if obj.is_empty() {
                "{}".to_string()
            } else if obj.len() <= 4 {
                let items: Vec<String> = obj
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, format_value_short(v)))
                    .collect();
                format!("{{ {} }}", items.join(", "))
            } else {
                format!("{{...{} keys}}", obj.len())
            }
        }
    }
}

/// Print the apply summary line and every operation that did not succeed.
pub fn print_apply_result(result: &ApplyResult) {
    println!();
    let line = result.to_string();
    if result.is_success() {
        println!("{}", line.green().bold());
        return;
    }
    println!("{}", line.yellow().bold());
    if result.cancelled {
        println!("{}", "Run was cancelled; unscheduled operations were skipped.".yellow());
    }
    println!();
    for problem in result.problems() {
        match &problem.outcome {
            OperationOutcome::Failed(reason) => println!(
                "  {} {} ({}): {}",
                "failed".red().bold(),
                problem.resource_id.bold(),
                problem.kind,
                reason
            ),
            OperationOutcome::Skipped(reason) => println!(
                "  {} {} ({}): {}",
                "skipped".yellow(),
                problem.resource_id.bold(),
                problem.kind,
                reason.dimmed()
            ),
            OperationOutcome::Succeeded => {}
        }
    }
    println!();
}

fn status_colored(status: RecordStatus, text: &str) -> String {
    match status {
        RecordStatus::Applied => text.green().to_string(),
        RecordStatus::Failed => text.red().to_string(),
        RecordStatus::Pending => text.yellow().to_string(),
        RecordStatus::Deleted => text.dimmed().to_string(),
    }
}

/// Print the records in state.
pub fn print_resource_list<'a>(records: impl IntoIterator<Item = &'a StateRecord>) {
    let records: Vec<&StateRecord> = records.into_iter().collect();
    if records.is_empty() {
        println!("{}", "No resources in state.".dimmed());
        return;
    }

    println!();
    println!("{}", "Resources".bold().cyan());
    println!("{}", "─".repeat(80));
    println!(
        "  {:<28} {:<22} {:<10} {}",
        "ID".bold(),
        "TYPE".bold(),
        "STATUS".bold(),
        "PROVIDER ID".bold()
    );
    println!("{}", "─".repeat(80));

    for record in &records {
        // Pad before colouring so escape codes do not skew the columns
        let status = status_colored(record.status, &format!("{:<10}", record.status.as_str()));
        println!(
            "  {:<28} {:<22} {} {}",
            record.id,
            record.resource_type,
            status,
            record.provider_id.as_deref().unwrap_or("-").dimmed()
        );
    }

    println!();
    println!("  {} resource(s) total.", records.len());
    println!();
}

/// Print one record in full.
pub fn print_resource_detail(record: &StateRecord) {
    println!();
    println!("{} {}", "Resource:".bold().cyan(), record.id.bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "Type:".bold(), record.resource_type);
    println!(
        "  {:<18} {}",
        "Provider ID:".bold(),
        record.provider_id.as_deref().unwrap_or("-")
    );
    println!("  {:<18} {}", "Status:".bold(), status_colored(record.status, record.status.as_str()));
    if let Some(ref error) = record.error {
        println!("  {:<18} {}", "Last error:".bold(), error.red());
    }
    if !record.dependencies.is_empty() {
        let deps: Vec<&str> = record.dependencies.iter().map(String::as_str).collect();
        println!("  {:<18} {}", "Depends on:".bold(), deps.join(", "));
    }
    println!("  {:<18} {}", "Fingerprint:".bold(), &record.fingerprint);
    println!("  {:<18} {}", "Format version:".bold(), record.format_version);
    println!("  {:<18} {}", "Created:".bold(), record.created_at);
    println!("  {:<18} {}", "Updated:".bold(), record.updated_at);

    if !record.properties.is_empty() {
        println!();
        println!("  {}:", "Properties".bold());
        for (key, value) in &record.properties {
            println!("    {:<20} = {}", key, format_value_short(&value.to_json()));
        }
    }
    if !record.attributes.is_empty() {
        println!();
        println!("  {}:", "Attributes".bold());
        for (key, value) in &record.attributes {
            println!("    {:<20} = {}", key, format_value_short(value));
        }
    }

    println!("{}", "─".repeat(60));
    println!();
}

/// Print drift findings. Returns whether any drift was found.
pub fn print_drift(results: &[DriftResult]) -> bool {
    println!();
    if results.is_empty() {
        println!("{}", "No drift detected.".green());
        return false;
    }

    let mut drifted = false;
    for result in results {
        match &result.drift_type {
            DriftType::Missing => {
                drifted = true;
                println!(
                    "  {} {} ({}) {}",
                    "-".red().bold(),
                    result.resource_id.bold(),
                    result.provider_id.dimmed(),
                    "no longer exists".red()
                );
            }
            DriftType::Changed(properties) => {
                drifted = true;
                println!(
                    "  {} {} ({}) {}",
                    "~".yellow().bold(),
                    result.resource_id.bold(),
                    result.provider_id.dimmed(),
                    "has changed outside keel".yellow()
                );
                for property in properties {
                    let actual = property
                        .actual
                        .as_ref()
                        .map(format_value_short)
                        .unwrap_or_else(|| "(absent)".to_string());
                    println!(
                        "      {} = {} -> {}",
                        property.name,
                        format_value_short(&property.expected),
                        actual
                    );
                }
            }
            DriftType::Unknown(reason) => println!(
                "  {} {} ({}) {}: {}",
                "?".cyan().bold(),
                result.resource_id.bold(),
                result.provider_id.dimmed(),
                "could not be checked".cyan(),
                reason
            ),
        }
    }
    println!();
    drifted
}

/// Print stack outputs as `name = value`.
pub fn print_outputs(outputs: &[OutputValue]) {
    if outputs.is_empty() {
        println!("{}", "No outputs.".dimmed());
        return;
    }
    println!();
    println!("{}", "Outputs:".bold());
    println!();
    for output in outputs {
        let value = output
            .value
            .as_ref()
            .map(format_value_short)
            .unwrap_or_else(|| "(unknown)".dimmed().to_string());
        println!("{} = {}", output.name.bold(), value);
        if let Some(ref description) = output.description {
            println!("  {}", description.dimmed());
        }
    }
    println!();
}
