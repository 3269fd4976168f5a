use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::provider::schema::SchemaRegistry;

// ─── Stack File (raw YAML shape) ────────────────────────────────────────────

/// A stack file as written on disk, before variables are substituted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackFile {
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub settings: SettingsFile,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceBlock>,
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaBlock>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputBlock>,
}

/// Optional overrides for [`Settings`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    pub provider: Option<String>,
    pub parallelism: Option<usize>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub operation_timeout_secs: Option<u64>,
    pub lock_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceBlock {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Name of a variable; the resource is only declared when it is truthy.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

/// What happens to the provider object when keel stops managing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionPolicy {
    /// Delete the object through the provider.
    #[default]
    Delete,
    /// Leave the object in place and only forget it in state.
    Retain,
}

impl DeletionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionPolicy::Delete => "delete",
            DeletionPolicy::Retain => "retain",
        }
    }
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(DeletionPolicy::Delete),
            "retain" => Ok(DeletionPolicy::Retain),
            other => Err(format!("unknown deletion policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaBlock {
    #[serde(default)]
    pub immutable: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputBlock {
    pub value: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Name of a variable; the output is only emitted when it is truthy.
    #[serde(default)]
    pub condition: Option<String>,
}

// ─── Resolved Stack ─────────────────────────────────────────────────────────

/// A fully loaded stack: variables substituted, tags merged, references parsed.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub name: String,
    pub settings: Settings,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub resources: Vec<Resource>,
    pub schemas: SchemaRegistry,
    pub outputs: Vec<OutputConfig>,
}

/// Settings controlling execution behavior.
#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: String,
    pub parallelism: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub operation_timeout: Duration,
    pub lock_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            parallelism: 10,
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            operation_timeout: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(900),
        }
    }
}

impl Settings {
    pub fn apply_overrides(&mut self, file: &SettingsFile) {
        if let Some(ref provider) = file.provider {
            self.provider = provider.clone();
        }
        if let Some(p) = file.parallelism {
            self.parallelism = p.max(1);
        }
        if let Some(a) = file.max_attempts {
            self.max_attempts = a.max(1);
        }
        if let Some(ms) = file.base_delay_ms {
            self.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = file.operation_timeout_secs {
            self.operation_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.lock_ttl_secs {
            self.lock_ttl = Duration::from_secs(secs);
        }
    }
}

/// A stack output evaluated against state after apply.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub name: String,
    pub value: PropertyValue,
    pub description: Option<String>,
    pub enabled: bool,
}

// ─── Resources ──────────────────────────────────────────────────────────────

pub type Properties = BTreeMap<String, PropertyValue>;

/// One declared resource. Dependencies are the union of `depends_on` and
/// every resource referenced from `properties`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub properties: Properties,
    pub depends_on: BTreeSet<String>,
    pub deletion_policy: DeletionPolicy,
}

impl Resource {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            deletion_policy: DeletionPolicy::Delete,
        }
    }

    pub fn with_deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = policy;
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Resource IDs referenced anywhere in the property tree.
    pub fn references(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        for value in self.properties.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Explicit and implicit dependencies together.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = self.depends_on.clone();
        deps.extend(self.references());
        deps
    }
}

/// A reference to an attribute another resource exposes once applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    pub resource: String,
    pub attribute: String,
}

impl Reference {
    pub fn new(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    /// Parse the inside of `${...}`, e.g. `ref.net.id`.
    pub fn parse(inner: &str) -> Option<Self> {
        let rest = inner.trim().strip_prefix("ref.")?;
        let (resource, attribute) = rest.split_once('.')?;
        if resource.is_empty() || attribute.is_empty() {
            return None;
        }
        Some(Self::new(resource, attribute))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{ref.{}.{}}}", self.resource, self.attribute)
    }
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Reference(Reference),
}

/// A declared property value.
///
/// Strings of the form `${ref.<id>.<attr>}` become [`PropertyValue::Reference`];
/// strings that embed references inside other text become
/// [`PropertyValue::Interpolated`]. `$${` escapes a literal `${`.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    Reference(Reference),
    Interpolated(Vec<Segment>),
}

impl PropertyValue {
    /// Convert a plain JSON value, parsing reference syntax out of strings.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(*b),
            serde_json::Value::Number(n) => PropertyValue::Number(n.clone()),
            serde_json::Value::String(s) => parse_template(s),
            serde_json::Value::Array(items) => {
                PropertyValue::List(items.iter().map(PropertyValue::from_json).collect())
            }
            serde_json::Value::Object(map) => PropertyValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), PropertyValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render back to JSON, writing references in `${ref...}` syntax.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Number(n) => serde_json::Value::Number(n.clone()),
            PropertyValue::String(s) => serde_json::Value::String(escape_literal(s)),
            PropertyValue::List(items) => {
                serde_json::Value::Array(items.iter().map(PropertyValue::to_json).collect())
            }
            PropertyValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            PropertyValue::Reference(r) => serde_json::Value::String(r.to_string()),
            PropertyValue::Interpolated(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(s) => out.push_str(&escape_literal(s)),
                        Segment::Reference(r) => out.push_str(&r.to_string()),
                    }
                }
                serde_json::Value::String(out)
            }
        }
    }

    pub fn collect_references(&self, refs: &mut BTreeSet<String>) {
        match self {
            PropertyValue::Reference(r) => {
                refs.insert(r.resource.clone());
            }
            PropertyValue::Interpolated(segments) => {
                for segment in segments {
                    if let Segment::Reference(r) = segment {
                        refs.insert(r.resource.clone());
                    }
                }
            }
            PropertyValue::List(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            PropertyValue::Map(map) => {
                for v in map.values() {
                    v.collect_references(refs);
                }
            }
            _ => {}
        }
    }

    /// True if this value references the given resource anywhere.
    pub fn references_resource(&self, id: &str) -> bool {
        let mut refs = BTreeSet::new();
        self.collect_references(&mut refs);
        refs.contains(id)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        parse_template(s)
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        parse_template(&s)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Number(n.into())
    }
}

impl From<Reference> for PropertyValue {
    fn from(r: Reference) -> Self {
        PropertyValue::Reference(r)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(v: serde_json::Value) -> Self {
        PropertyValue::from_json(&v)
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(PropertyValue::from_json(&value))
    }
}

fn escape_literal(s: &str) -> String {
    s.replace("${", "$${")
}

/// Split a string into literal text and `${ref.*}` references.
fn parse_template(s: &str) -> PropertyValue {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = s;

    while let Some(pos) = rest.find("${") {
        if rest[..pos].ends_with('$') {
            // `$${` is an escaped literal `${`
            literal.push_str(&rest[..pos - 1]);
            literal.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let Some(end) = after.find('}') else {
            literal.push_str(&rest[pos..]);
            rest = "";
            break;
        };
        let inner = &after[..end];
        match Reference::parse(inner) {
            Some(reference) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Reference(reference));
            }
            None => {
                literal.push_str("${");
                literal.push_str(inner);
                literal.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    literal.push_str(rest);

    if segments.is_empty() {
        return PropertyValue::String(literal);
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    if segments.len() == 1 {
        if let Some(Segment::Reference(r)) = segments.first() {
            return PropertyValue::Reference(r.clone());
        }
    }
    PropertyValue::Interpolated(segments)
}
