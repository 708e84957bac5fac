//! In-memory fakes for tests: a Kubernetes API and a compute provider.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use turndown_core::{NodePool, PoolSize, ProviderKind};

use crate::cluster::{KubeClient, node_label};
use crate::error::{ProviderError, ProviderResult};
use crate::provider::ComputeProvider;

/// Label the fakes use to map nodes to pools.
pub const FAKE_POOL_LABEL: &str = "fake.turndown/pool";

/// Build a node with the given labels and provider id.
pub fn make_node(name: &str, labels: &[(&str, &str)], provider_id: Option<&str>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: provider_id.map(str::to_string),
            ..Default::default()
        }),
        status: None,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── FakeKube ───────────────────────────────────────────────────────

#[derive(Default)]
struct KubeState {
    nodes: Vec<Node>,
    selectors: HashMap<(String, String), BTreeMap<String, String>>,
    config_maps: HashMap<(String, String), BTreeMap<String, String>>,
}

/// An in-memory cluster supporting the calls in [`KubeClient`].
#[derive(Default)]
pub struct FakeKube {
    state: Mutex<KubeState>,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: Node) {
        lock(&self.state).nodes.push(node);
    }

    /// The `nodeSelector` last set on a Deployment.
    pub fn node_selector(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.state)
            .selectors
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

/// Match `k=v` and bare `k` (existence) terms, comma-separated.
fn matches_selector(node: &Node, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => node_label(node, key) == Some(value),
            None => node.labels().contains_key(term),
        })
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn list_nodes(&self, label_selector: Option<&str>) -> ProviderResult<Vec<Node>> {
        let state = lock(&self.state);
        Ok(state
            .nodes
            .iter()
            .filter(|n| label_selector.is_none_or(|s| matches_selector(n, s)))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> ProviderResult<Node> {
        lock(&self.state)
            .nodes
            .iter()
            .find(|n| n.name_any() == name)
            .cloned()
            .ok_or_else(|| ProviderError::Kube(format!("node {name} not found")))
    }

    async fn label_node(&self, name: &str, key: &str, value: &str) -> ProviderResult<()> {
        let mut state = lock(&self.state);
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.name_any() == name)
            .ok_or_else(|| ProviderError::Kube(format!("node {name} not found")))?;
        node.labels_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_deployment_node_selector(
        &self,
        namespace: &str,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        let mut state = lock(&self.state);
        state
            .selectors
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .extend(selector.clone());
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<BTreeMap<String, String>>> {
        Ok(lock(&self.state)
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        lock(&self.state)
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data.clone());
        Ok(())
    }
}

// ── FakeProvider ───────────────────────────────────────────────────

#[derive(Default)]
struct ProviderState {
    pools: Vec<NodePool>,
    snapshots: HashMap<String, PoolSize>,
    set_calls: Vec<(Vec<String>, u32)>,
    reset_calls: Vec<Vec<(String, u32)>>,
    singleton_creations: u32,
    on_singleton: bool,
    stuck: bool,
    fail_resize: bool,
}

/// A provider whose pools live in memory.
///
/// Resizes converge immediately unless [`FakeProvider::set_stuck`] is on.
/// The agent counts as off the singleton pool until
/// [`FakeProvider::set_on_singleton`] says otherwise.
pub struct FakeProvider {
    kind: ProviderKind,
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            state: Mutex::new(ProviderState::default()),
        }
    }

    pub fn with_pool(self, pool: NodePool) -> Self {
        lock(&self.state).pools.push(pool);
        self
    }

    pub fn set_on_singleton(&self, on: bool) {
        lock(&self.state).on_singleton = on;
    }

    /// Accept resizes without the node counts ever following.
    pub fn set_stuck(&self, stuck: bool) {
        lock(&self.state).stuck = stuck;
    }

    pub fn set_fail_resize(&self, fail: bool) {
        lock(&self.state).fail_resize = fail;
    }

    /// Let registered node counts catch up with the requested sizes.
    pub fn converge(&self) {
        for pool in &mut lock(&self.state).pools {
            pool.node_count = pool.desired;
        }
    }

    pub fn pool(&self, id: &str) -> Option<NodePool> {
        lock(&self.state).pools.iter().find(|p| p.id == id).cloned()
    }

    /// Pool ids and size of every `set_node_pool_sizes` call.
    pub fn set_calls(&self) -> Vec<(Vec<String>, u32)> {
        lock(&self.state).set_calls.clone()
    }

    /// Restored (pool id, size) pairs of every `reset_node_pool_sizes` call.
    pub fn reset_calls(&self) -> Vec<Vec<(String, u32)>> {
        lock(&self.state).reset_calls.clone()
    }

    pub fn singleton_creations(&self) -> u32 {
        lock(&self.state).singleton_creations
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn is_turndown_node_pool(&self) -> bool {
        lock(&self.state).on_singleton
    }

    async fn create_singleton_node_pool(&self) -> ProviderResult<()> {
        let mut state = lock(&self.state);
        if !state.pools.iter().any(|p| p.singleton) {
            state.pools.push(NodePool::new("cluster-turndown", 1, 1).singleton());
            state.singleton_creations += 1;
        }
        Ok(())
    }

    async fn node_pools(&self) -> ProviderResult<Vec<NodePool>> {
        Ok(lock(&self.state).pools.clone())
    }

    fn pool_id(&self, node: &Node) -> Option<String> {
        node_label(node, FAKE_POOL_LABEL).map(str::to_string)
    }

    async fn set_node_pool_sizes(&self, pools: &[NodePool], size: u32) -> ProviderResult<()> {
        let mut state = lock(&self.state);
        if state.fail_resize {
            return Err(ProviderError::api(self.kind, "resize rejected"));
        }
        state
            .set_calls
            .push((pools.iter().map(|p| p.id.clone()).collect(), size));
        let stuck = state.stuck;
        for requested in pools {
            let Some(index) = state.pools.iter().position(|p| p.id == requested.id) else {
                continue;
            };
            let original = PoolSize {
                node_count: state.pools[index].desired,
                autoscaling: state.pools[index].autoscaling,
            };
            state.snapshots.entry(requested.id.clone()).or_insert(original);
            let pool = &mut state.pools[index];
            pool.desired = size;
            if !stuck {
                pool.node_count = size;
            }
        }
        Ok(())
    }

    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> ProviderResult<()> {
        let mut state = lock(&self.state);
        if state.fail_resize {
            return Err(ProviderError::api(self.kind, "resize rejected"));
        }
        let stuck = state.stuck;
        let mut restored = Vec::new();
        for requested in pools {
            let Some(original) = state.snapshots.remove(&requested.id) else {
                continue;
            };
            if let Some(pool) = state.pools.iter_mut().find(|p| p.id == requested.id) {
                pool.desired = original.node_count;
                if !stuck {
                    pool.node_count = original.node_count;
                }
            }
            restored.push((requested.id.clone(), original.node_count));
        }
        state.reset_calls.push(restored);
        Ok(())
    }
}
