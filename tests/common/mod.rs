#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use keel::config::types::Resource;
use keel::dag::resource_graph::ResourceGraph;
use keel::executor::engine::{self, ApplyOptions, ApplyResult};
use keel::executor::retry::RetryPolicy;
use keel::planner::{self, plan::Plan};
use keel::provider::local::LocalProvider;
use keel::provider::schema::SchemaRegistry;
use keel::provider::{PropertyMap, ProviderCapability, ProviderError, ProviderOutput, ResolvedResource};
use keel::state::backend::StateBackend;
use keel::state::sqlite::SqliteBackend;
use keel::state::store::StateStore;

pub const STACK: &str = "test";

/// In-memory local provider with scripted failures and a call log.
pub struct ScriptedProvider {
    inner: LocalProvider,
    /// Errors returned, in order, before calls for a logical ID succeed.
    queued: Mutex<BTreeMap<String, VecDeque<ProviderError>>>,
    /// Logical IDs (or full idempotency keys) whose calls always fail.
    broken: Mutex<BTreeMap<String, ProviderError>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            inner: LocalProvider::in_memory(),
            queued: Mutex::new(BTreeMap::new()),
            broken: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.inner = self.inner.with_schemas(schemas);
        self
    }

    pub fn fail_next(&self, id: &str, errors: Vec<ProviderError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn fail_always(&self, id: &str, error: ProviderError) {
        self.broken.lock().unwrap().insert(id.to_string(), error);
    }

    pub fn heal(&self, id: &str) {
        self.broken.lock().unwrap().remove(id);
        self.queued.lock().unwrap().remove(id);
    }

    /// Idempotency keys of every call made, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == key).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &LocalProvider {
        &self.inner
    }

    async fn enter(&self, key: &str) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(key.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let id = key.split(':').next().unwrap_or(key);
        let broken = self.broken.lock().unwrap();
        if let Some(error) = broken.get(key).or_else(|| broken.get(id)) {
            return Err(error.clone());
        }
        drop(broken);
        if let Some(error) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderCapability for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn schemas(&self) -> SchemaRegistry {
        self.inner.schemas()
    }

    async fn create(&self, resource: &ResolvedResource) -> Result<ProviderOutput, ProviderError> {
        self.enter(&resource.idempotency_key).await?;
        self.inner.create(resource).await
    }

    async fn update(
        &self,
        provider_id: &str,
        resource: &ResolvedResource,
        changed: &BTreeSet<String>,
    ) -> Result<ProviderOutput, ProviderError> {
        self.enter(&resource.idempotency_key).await?;
        self.inner.update(provider_id, resource, changed).await
    }

    async fn delete(
        &self,
        provider_id: &str,
        resource_type: &str,
        idempotency_key: &str,
    ) -> Result<(), ProviderError> {
        self.enter(idempotency_key).await?;
        self.inner
            .delete(provider_id, resource_type, idempotency_key)
            .await
    }

    async fn describe(
        &self,
        provider_id: &str,
        resource_type: &str,
    ) -> Result<PropertyMap, ProviderError> {
        self.inner.describe(provider_id, resource_type).await
    }
}

pub async fn memory_store() -> StateStore {
    let backend = SqliteBackend::open_memory().unwrap();
    backend.initialize().await.unwrap();
    StateStore::new(Arc::new(backend), STACK)
}

/// Retries without real waiting.
pub fn quick_options() -> ApplyOptions {
    ApplyOptions {
        retry: RetryPolicy::new(5, Duration::from_millis(1), Duration::from_secs(5)),
        ..ApplyOptions::default()
    }
}

pub async fn plan_for(store: &StateStore, resources: Vec<Resource>, schemas: &SchemaRegistry) -> Plan {
    let graph = ResourceGraph::build(resources).unwrap();
    let prior = store.load().await.unwrap();
    planner::plan(STACK, &graph, &prior, schemas).unwrap()
}

pub async fn apply_plan(
    store: &StateStore,
    plan: Plan,
    provider: Arc<dyn ProviderCapability>,
    options: ApplyOptions,
) -> ApplyResult {
    let lease = store
        .lock("tester", "apply", Duration::from_secs(60))
        .await
        .unwrap();
    let result = engine::apply(plan, provider, &lease, options).await.unwrap();
    lease.release().await.unwrap();
    result
}

/// Plan against current state and apply.
pub async fn converge(
    store: &StateStore,
    resources: Vec<Resource>,
    provider: Arc<ScriptedProvider>,
) -> ApplyResult {
    let schemas = provider.schemas();
    let plan = plan_for(store, resources, &schemas).await;
    apply_plan(store, plan, provider, quick_options()).await
}

/// `{net: network(cidr=10.0.0.0/16), vm: instance(depends on net)}`
pub fn net_and_vm() -> Vec<Resource> {
    vec![
        Resource::new("net", "network").with_property("cidr", "10.0.0.0/16"),
        Resource::new("vm", "compute-instance")
            .with_property("subnet", "${ref.net.id}")
            .with_property("size", "small"),
    ]
}

pub fn chain_abc() -> Vec<Resource> {
    vec![
        Resource::new("a", "network").with_property("cidr", "10.0.0.0/16"),
        Resource::new("b", "subnet").with_property("network", "${ref.a.id}"),
        Resource::new("c", "compute-instance").with_property("subnet", "${ref.b.id}"),
    ]
}
