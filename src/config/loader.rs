use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use regex::Regex;

use super::parser;
use super::types::{
    OutputConfig, PropertyValue, Resource, Settings, StackConfig, StackFile,
};
use super::validator;
use crate::error::EngineError;
use crate::provider::schema::{ResourceSchema, SchemaRegistry};

const DEFAULT_STACK_NAME: &str = "default";

/// Load a stack from disk and resolve it.
///
/// `overrides` are `--var name=value` pairs from the command line; they win
/// over defaults declared in the stack file.
pub fn load_stack(path: &Path, overrides: &[(String, String)]) -> Result<StackConfig> {
    let file = parser::load_stack_file(path)?;
    let fallback_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && *s != ".")
        .unwrap_or(DEFAULT_STACK_NAME);
    resolve_stack(file, fallback_name, overrides)
}

/// Turn a raw stack file into a [`StackConfig`].
pub fn resolve_stack(
    file: StackFile,
    fallback_name: &str,
    overrides: &[(String, String)],
) -> Result<StackConfig> {
    let name = file
        .stack
        .clone()
        .unwrap_or_else(|| fallback_name.to_string());

    let mut settings = Settings::default();
    settings.apply_overrides(&file.settings);

    let mut variables: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for (key, value) in &file.variables {
        variables.insert(key.clone(), yaml_to_json(value)?);
    }
    for (key, value) in overrides {
        variables.insert(key.clone(), parse_override(value));
    }

    let var_re = Regex::new(r"\$\{var\.([A-Za-z0-9_-]+)\}")?;

    let mut resources = Vec::with_capacity(file.resources.len());
    for (id, block) in &file.resources {
        if !condition_holds(block.condition.as_deref(), &variables)
            .with_context(|| format!("Resource '{}'", id))?
        {
            tracing::debug!(resource = %id, "Condition is false; resource left out");
            continue;
        }
        let mut properties = BTreeMap::new();
        for (key, raw) in &block.properties {
            let json = yaml_to_json(raw)?;
            let substituted = substitute_variables(&json, &variables, &var_re)
                .with_context(|| format!("In property '{}' of resource '{}'", key, id))?;
            properties.insert(key.clone(), PropertyValue::from_json(&substituted));
        }
        merge_stack_tags(id, &mut properties, &file.tags)?;

        resources.push(Resource {
            id: id.clone(),
            resource_type: block.resource_type.clone(),
            properties,
            depends_on: block.depends_on.iter().cloned().collect(),
            deletion_policy: block.deletion_policy,
        });
    }

    let mut schemas = SchemaRegistry::new();
    for (resource_type, block) in &file.schemas {
        schemas.insert(
            resource_type.clone(),
            ResourceSchema::immutable(block.immutable.iter().cloned()),
        );
    }

    let mut outputs = Vec::with_capacity(file.outputs.len());
    for (output_name, block) in &file.outputs {
        let raw = serde_json::Value::String(block.value.clone());
        let substituted = substitute_variables(&raw, &variables, &var_re)
            .with_context(|| format!("In output '{}'", output_name))?;
        let enabled = condition_holds(block.condition.as_deref(), &variables)
            .with_context(|| format!("Output '{}'", output_name))?;
        outputs.push(OutputConfig {
            name: output_name.clone(),
            value: PropertyValue::from_json(&substituted),
            description: block.description.clone(),
            enabled,
        });
    }

    let stack = StackConfig {
        name,
        settings,
        variables,
        resources,
        schemas,
        outputs,
    };
    validator::validate(&stack)?;

    tracing::debug!(
        stack = %stack.name,
        resources = stack.resources.len(),
        outputs = stack.outputs.len(),
        "Loaded stack"
    );
    Ok(stack)
}

/// Parse a `name=value` command-line pair.
pub fn parse_var_assignment(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => bail!("Invalid variable '{}'. Expected name=value", raw),
    }
}

/// Values given on the command line are typed when they look like JSON
/// scalars (`true`, `3`), otherwise kept as strings.
fn parse_override(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_))) => v,
        _ => serde_json::Value::String(raw.to_string()),
    }
}

/// An absent condition always holds; otherwise the named variable must be
/// defined and truthy.
fn condition_holds(
    condition: Option<&str>,
    variables: &BTreeMap<String, serde_json::Value>,
) -> Result<bool> {
    match condition {
        None => Ok(true),
        Some(var) => match variables.get(var) {
            Some(value) => Ok(is_truthy(value)),
            None => bail!("Condition refers to undefined variable '{}'", var),
        },
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

/// Stack-wide tags go under each resource's `tags` map; resource-level tags win.
fn merge_stack_tags(
    id: &str,
    properties: &mut BTreeMap<String, PropertyValue>,
    stack_tags: &BTreeMap<String, String>,
) -> Result<()> {
    if stack_tags.is_empty() {
        return Ok(());
    }
    let mut tags: BTreeMap<String, PropertyValue> = stack_tags
        .iter()
        .map(|(k, v)| (k.clone(), PropertyValue::String(v.clone())))
        .collect();
    match properties.remove("tags") {
        None => {}
        Some(PropertyValue::Map(own)) => tags.extend(own),
        Some(_) => {
            return Err(EngineError::InvalidConfig(format!(
                "resource '{}' has a 'tags' property that is not a map",
                id
            ))
            .into())
        }
    }
    properties.insert("tags".to_string(), PropertyValue::Map(tags));
    Ok(())
}

/// Replace `${var.*}` references throughout a JSON value.
///
/// A string that is exactly one reference takes the variable's typed value.
fn substitute_variables(
    value: &serde_json::Value,
    variables: &BTreeMap<String, serde_json::Value>,
    var_re: &Regex,
) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::String(s) => {
            if let Some(cap) = var_re.captures(s) {
                if cap[0].len() == s.len() {
                    return lookup(variables, &cap[1]).cloned();
                }
            }
            let mut missing = None;
            let replaced = var_re.replace_all(s, |cap: &regex::Captures| {
                match variables.get(&cap[1]) {
                    Some(serde_json::Value::String(v)) => v.clone(),
                    Some(other) => other.to_string(),
                    None => {
                        missing.get_or_insert_with(|| cap[1].to_string());
                        String::new()
                    }
                }
            });
            if let Some(name) = missing {
                bail!("Undefined variable 'var.{}'", name);
            }
            Ok(serde_json::Value::String(replaced.into_owned()))
        }
        serde_json::Value::Array(items) => {
            let resolved: Result<Vec<_>> = items
                .iter()
                .map(|v| substitute_variables(v, variables, var_re))
                .collect();
            Ok(serde_json::Value::Array(resolved?))
        }
        serde_json::Value::Object(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), substitute_variables(v, variables, var_re)?);
            }
            Ok(serde_json::Value::Object(obj))
        }
        other => Ok(other.clone()),
    }
}

fn lookup<'a>(
    variables: &'a BTreeMap<String, serde_json::Value>,
    name: &str,
) -> Result<&'a serde_json::Value> {
    match variables.get(name) {
        Some(v) => Ok(v),
        None => bail!("Undefined variable 'var.{}'", name),
    }
}

/// Convert a serde_yaml value to JSON.
fn yaml_to_json(value: &serde_yaml::Value) -> Result<serde_json::Value> {
    match value {
        serde_yaml::Value::Null => Ok(serde_json::Value::Null),
        serde_yaml::Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(serde_json::Value::Number(i.into()))
            } else if let Some(u) = n.as_u64() {
                Ok(serde_json::Value::Number(u.into()))
            } else if let Some(f) = n.as_f64() {
                Ok(serde_json::json!(f))
            } else {
                Ok(serde_json::Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Ok(serde_json::Value::String(s.clone())),
        serde_yaml::Value::Sequence(seq) => {
            let items: Result<Vec<_>> = seq.iter().map(yaml_to_json).collect();
            Ok(serde_json::Value::Array(items?))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => bail!("Unsupported mapping key: {:?}", other),
                };
                obj.insert(key, yaml_to_json(v)?);
            }
            Ok(serde_json::Value::Object(obj))
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_values_are_typed_when_scalar() {
        assert_eq!(parse_override("true"), serde_json::Value::Bool(true));
        assert_eq!(parse_override("3"), serde_json::json!(3));
        assert_eq!(
            parse_override("t3.micro"),
            serde_json::Value::String("t3.micro".into())
        );
    }

    #[test]
    fn var_assignment_requires_name() {
        assert_eq!(
            parse_var_assignment("region=us-east-2").unwrap(),
            ("region".to_string(), "us-east-2".to_string())
        );
        assert!(parse_var_assignment("=x").is_err());
        assert!(parse_var_assignment("novalue").is_err());
    }
}
