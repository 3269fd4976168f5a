use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::types::{SettingsFile, StackFile};
use crate::error::EngineError;

/// Load a stack file, or every `*.yaml`/`*.yml` file in a directory merged
/// into one stack.
pub fn load_stack_file(path: &Path) -> Result<StackFile> {
    if path.is_file() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read stack file: {}", path.display()))?;
        return parse_stack(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()));
    }

    if path.is_dir() {
        let files = find_yaml_files(path)?;
        if files.is_empty() {
            bail!("No .yaml files found in directory: {}", path.display());
        }
        return merge_stack_files(&files);
    }

    bail!(
        "Stack not found: '{}'. Pass a .yaml file or a directory with -c",
        path.display()
    )
}

/// Parse YAML content into a StackFile.
pub fn parse_stack(content: &str) -> Result<StackFile> {
    let stack: StackFile =
        serde_yaml::from_str(content).context("Failed to parse YAML stack definition")?;
    Ok(stack)
}

/// Find all .yaml/.yml files in a directory (non-recursive).
fn find_yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Merge several stack files.
///
/// The stack name and each setting come from the first file that sets them.
/// Variables, tags and schemas merge with first-wins; resources and outputs
/// must be unique across files.
fn merge_stack_files(files: &[PathBuf]) -> Result<StackFile> {
    tracing::info!(
        files = ?files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>(),
        "Discovered stack files"
    );

    let mut merged = StackFile::default();

    for file in files {
        let content = fs::read_to_string(file)
            .with_context(|| format!("Failed to read stack file: {}", file.display()))?;
        let stack = parse_stack(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", file.display()))?;

        if merged.stack.is_none() {
            merged.stack = stack.stack;
        }
        merge_settings(&mut merged.settings, stack.settings);

        for (k, v) in stack.variables {
            merged.variables.entry(k).or_insert(v);
        }
        for (k, v) in stack.tags {
            merged.tags.entry(k).or_insert(v);
        }
        for (k, v) in stack.schemas {
            merged
                .schemas
                .entry(k)
                .or_default()
                .immutable
                .extend(v.immutable);
        }

        for (id, resource) in stack.resources {
            if merged.resources.contains_key(&id) {
                return Err(EngineError::DuplicateResource(id).into());
            }
            merged.resources.insert(id, resource);
        }

        for (name, output) in stack.outputs {
            if merged.outputs.contains_key(&name) {
                bail!(
                    "Duplicate output '{}' found across stack files. Output names must be unique.",
                    name
                );
            }
            merged.outputs.insert(name, output);
        }
    }

    Ok(merged)
}

fn merge_settings(into: &mut SettingsFile, from: SettingsFile) {
    into.provider = into.provider.take().or(from.provider);
    into.parallelism = into.parallelism.or(from.parallelism);
    into.max_attempts = into.max_attempts.or(from.max_attempts);
    into.base_delay_ms = into.base_delay_ms.or(from.base_delay_ms);
    into.operation_timeout_secs = into.operation_timeout_secs.or(from.operation_timeout_secs);
    into.lock_ttl_secs = into.lock_ttl_secs.or(from.lock_ttl_secs);
}
