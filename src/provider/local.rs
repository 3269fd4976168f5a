use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::schema::SchemaRegistry;
use super::{PropertyMap, ProviderCapability, ProviderError, ProviderOutput, ResolvedResource};

/// Inventory file kept in the working directory.
pub const INVENTORY_FILE: &str = "local-inventory.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Inventory {
    /// provider ID -> record
    #[serde(default)]
    objects: BTreeMap<String, LocalObject>,
    /// idempotency key -> provider ID
    #[serde(default)]
    keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalObject {
    resource_type: String,
    logical_id: String,
    properties: PropertyMap,
}

/// Provider that materialises resources as records in a JSON file.
///
/// Useful for trying stacks without a cloud account, and (in memory) for
/// tests. A `null` property value is rejected as a validation error.
pub struct LocalProvider {
    path: Option<PathBuf>,
    inventory: Mutex<Inventory>,
    schemas: SchemaRegistry,
}

impl LocalProvider {
    /// Open (or start) an inventory at `path`.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let inventory = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Corrupt local inventory {}: {}", path.display(), e)
            })?
        } else {
            Inventory::default()
        };
        Ok(Self {
            path: Some(path),
            inventory: Mutex::new(inventory),
            schemas: SchemaRegistry::new(),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            inventory: Mutex::new(Inventory::default()),
            schemas: SchemaRegistry::new(),
        }
    }

    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.lock().map(|inv| inv.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove an object behind the engine's back, for drift testing.
    pub fn forget(&self, provider_id: &str) -> Result<bool, ProviderError> {
        let mut inv = self.lock()?;
        let removed = inv.objects.remove(provider_id).is_some();
        inv.keys.retain(|_, pid| pid != provider_id);
        self.persist(&inv)?;
        Ok(removed)
    }

    /// Overwrite one property of an object, for drift testing.
    pub fn tamper(
        &self,
        provider_id: &str,
        property: &str,
        value: serde_json::Value,
    ) -> Result<(), ProviderError> {
        let mut inv = self.lock()?;
        let object = inv
            .objects
            .get_mut(provider_id)
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))?;
        object.properties.insert(property.to_string(), value);
        self.persist(&inv)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inventory>, ProviderError> {
        self.inventory.lock().map_err(|_| ProviderError::Other {
            message: "local inventory lock poisoned".to_string(),
            transient: false,
        })
    }

    fn persist(&self, inventory: &Inventory) -> Result<(), ProviderError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        write_atomic(path, inventory).map_err(|e| ProviderError::Other {
            message: format!("failed to write {}: {}", path.display(), e),
            transient: false,
        })
    }
}

fn write_atomic(path: &Path, inventory: &Inventory) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&serde_json::to_vec_pretty(inventory)?)?;
    tmp.persist(path)?;
    Ok(())
}

fn validate(resource: &ResolvedResource) -> Result<(), ProviderError> {
    if let Some((name, _)) = resource.properties.iter().find(|(_, v)| v.is_null()) {
        return Err(ProviderError::Validation(format!(
            "{}: property '{}' must not be null",
            resource.id, name
        )));
    }
    Ok(())
}

fn attributes(provider_id: &str, resource_type: &str, properties: &PropertyMap) -> PropertyMap {
    let mut attrs = properties.clone();
    attrs.insert(
        "arn".to_string(),
        serde_json::Value::String(format!("local:{}/{}", resource_type, provider_id)),
    );
    attrs
}

#[async_trait]
impl ProviderCapability for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn schemas(&self) -> SchemaRegistry {
        self.schemas.clone()
    }

    async fn create(&self, resource: &ResolvedResource) -> Result<ProviderOutput, ProviderError> {
        validate(resource)?;
        let mut inv = self.lock()?;

        let provider_id = match inv.keys.get(&resource.idempotency_key) {
            Some(existing) if inv.objects.contains_key(existing) => existing.clone(),
            _ => {
                let short = uuid::Uuid::new_v4().simple().to_string();
                format!("{}-{}", resource.resource_type, &short[..8])
            }
        };
        inv.objects.insert(
            provider_id.clone(),
            LocalObject {
                resource_type: resource.resource_type.clone(),
                logical_id: resource.id.clone(),
                properties: resource.properties.clone(),
            },
        );
        inv.keys
            .insert(resource.idempotency_key.clone(), provider_id.clone());
        self.persist(&inv)?;

        debug!(id = %resource.id, provider_id = %provider_id, "Local object created");
        Ok(ProviderOutput {
            attributes: attributes(&provider_id, &resource.resource_type, &resource.properties),
            provider_id,
        })
    }

    async fn update(
        &self,
        provider_id: &str,
        resource: &ResolvedResource,
        changed: &BTreeSet<String>,
    ) -> Result<ProviderOutput, ProviderError> {
        validate(resource)?;
        let mut inv = self.lock()?;
        let object = inv
            .objects
            .get_mut(provider_id)
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))?;
        object.properties = resource.properties.clone();
        self.persist(&inv)?;

        debug!(id = %resource.id, provider_id, changed = ?changed, "Local object updated");
        Ok(ProviderOutput {
            provider_id: provider_id.to_string(),
            attributes: attributes(provider_id, &resource.resource_type, &resource.properties),
        })
    }

    async fn delete(
        &self,
        provider_id: &str,
        _resource_type: &str,
        _idempotency_key: &str,
    ) -> Result<(), ProviderError> {
        let mut inv = self.lock()?;
        if inv.objects.remove(provider_id).is_none() {
            return Err(ProviderError::NotFound(provider_id.to_string()));
        }
        inv.keys.retain(|_, pid| pid != provider_id);
        self.persist(&inv)?;
        debug!(provider_id, "Local object deleted");
        Ok(())
    }

    async fn describe(
        &self,
        provider_id: &str,
        _resource_type: &str,
    ) -> Result<PropertyMap, ProviderError> {
        let inv = self.lock()?;
        inv.objects
            .get(provider_id)
            .map(|o| o.properties.clone())
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolved(id: &str, key: &str, props: serde_json::Value) -> ResolvedResource {
        ResolvedResource {
            id: id.to_string(),
            resource_type: "network".to_string(),
            properties: props.as_object().cloned().unwrap_or_default(),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_key() {
        let provider = LocalProvider::in_memory();
        let res = resolved("net", "net:create", json!({"cidr": "10.0.0.0/16"}));
        let first = provider.create(&res).await.unwrap();
        let second = provider.create(&res).await.unwrap();
        assert_eq!(first.provider_id, second.provider_id);
        assert_eq!(provider.len(), 1);
        assert_eq!(first.attributes["cidr"], json!("10.0.0.0/16"));
    }

    #[tokio::test]
    async fn null_property_is_a_validation_error() {
        let provider = LocalProvider::in_memory();
        let res = resolved("net", "net:create", json!({"cidr": null}));
        let err = provider.create(&res).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn inventory_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(INVENTORY_FILE);
        let pid = {
            let provider = LocalProvider::open(&path).unwrap();
            let res = resolved("net", "net:create", json!({"cidr": "10.0.0.0/16"}));
            provider.create(&res).await.unwrap().provider_id
        };

        let provider = LocalProvider::open(&path).unwrap();
        let props = provider.describe(&pid, "network").await.unwrap();
        assert_eq!(props["cidr"], json!("10.0.0.0/16"));

        provider.delete(&pid, "network", "net:delete").await.unwrap();
        let err = provider.describe(&pid, "network").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }
}
