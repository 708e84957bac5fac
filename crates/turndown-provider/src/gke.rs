//! Google Kubernetes Engine adapter.
//!
//! Node pools come from the Container REST API, target sizes from the
//! Compute instance-group managers behind each pool. Nodes map to pools
//! through the `cloud.google.com/gke-nodepool` label.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use turndown_core::{
    AutoscalingRange, GKE_NODE_POOL_LABEL, NodePool, PoolSize, ProviderKind, TURNDOWN_NODE_LABEL,
    TURNDOWN_NODE_LABEL_VALUE,
};

use crate::cluster::{KubeClient, node_label};
use crate::error::{ProviderError, ProviderResult};
use crate::metadata::MetadataClient;
use crate::provider::{ComputeProvider, ProviderSettings, host_is_singleton};
use crate::snapshot::SizeSnapshots;
use crate::user_agent;
use crate::wait::{PollPolicy, poll_until, wait_until_node_created};

const CONTAINER_API: &str = "https://container.googleapis.com/v1";

// ── API model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GkeNodePool {
    pub name: String,
    #[serde(default)]
    pub config: Option<GkeNodeConfig>,
    #[serde(default)]
    pub autoscaling: Option<GkeAutoscaling>,
    #[serde(default)]
    pub instance_group_urls: Vec<String>,
}

impl GkeNodePool {
    /// GKE sizes are per zone; a regional pool has one group per zone.
    pub fn zone_count(&self) -> u32 {
        (self.instance_group_urls.len() as u32).max(1)
    }

    pub fn autoscaling_range(&self) -> Option<AutoscalingRange> {
        self.autoscaling
            .as_ref()
            .filter(|a| a.enabled)
            .map(|a| AutoscalingRange {
                min: a.min_node_count,
                max: a.max_node_count,
            })
    }

    fn has_marker_label(&self) -> bool {
        self.config
            .as_ref()
            .and_then(|c| c.labels.get(TURNDOWN_NODE_LABEL))
            .is_some_and(|v| v == TURNDOWN_NODE_LABEL_VALUE)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GkeNodeConfig {
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GkeAutoscaling {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub min_node_count: u32,
    #[serde(default)]
    pub max_node_count: u32,
}

/// Request to create a node pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNodePool {
    pub name: String,
    pub node_count: u32,
    pub machine_type: String,
    pub labels: BTreeMap<String, String>,
}

/// The Container and Compute API calls the adapter makes.
#[async_trait]
pub trait GkeApi: Send + Sync {
    async fn list_node_pools(&self) -> ProviderResult<Vec<GkeNodePool>>;

    /// Sum of the target sizes of the pool's instance groups.
    async fn target_size(&self, pool: &GkeNodePool) -> ProviderResult<u32>;

    /// Set the per-zone node count and wait for the operation to finish.
    async fn set_size(&self, pool: &str, node_count: u32) -> ProviderResult<()>;

    /// Enable autoscaling with `range`, or disable it with `None`.
    async fn set_autoscaling(&self, pool: &str, range: Option<AutoscalingRange>) -> ProviderResult<()>;

    /// Create a node pool. An already-existing pool is not an error.
    async fn create_node_pool(&self, request: &NewNodePool) -> ProviderResult<()>;
}

// ── REST client ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListNodePoolsResponse {
    #[serde(default)]
    node_pools: Vec<GkeNodePool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceGroupManager {
    #[serde(default)]
    target_size: u32,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    message: String,
}

/// [`GkeApi`] over the GKE and Compute REST endpoints, authenticated
/// with the node service account token from the metadata server.
pub struct GkeClient {
    http: Client,
    metadata: MetadataClient,
    cluster_url: String,
    operations_url: String,
    poll: PollPolicy,
}

impl GkeClient {
    /// Resolve project, location and cluster from the metadata server.
    pub async fn from_metadata(metadata: MetadataClient, poll: PollPolicy) -> ProviderResult<Self> {
        let project = metadata.project_id().await?;
        let location = metadata.cluster_location().await?;
        let cluster = metadata.cluster_name().await?;
        let http = Client::builder()
            .user_agent(user_agent())
            .build()
            .map_err(|e| ProviderError::Config(format!("gke http client: {e}")))?;

        info!(%project, %location, %cluster, "using GKE cluster");
        let base = format!("{CONTAINER_API}/projects/{project}/locations/{location}");
        Ok(Self {
            http,
            metadata,
            cluster_url: format!("{base}/clusters/{cluster}"),
            operations_url: format!("{base}/operations"),
            poll,
        })
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> ProviderResult<Response> {
        let token = self.metadata.access_token().await?;
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(token.access_token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        req.send()
            .await
            .map_err(|e| ProviderError::api(ProviderKind::Gke, e))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> ProviderResult<T> {
        decode(self.request(method, url, body).await?).await
    }

    async fn wait_operation(&self, op: Operation) -> ProviderResult<()> {
        let url = format!("{}/{}", self.operations_url, op.name);
        if op.status != "DONE" {
            let what = format!("gke operation {}", op.name);
            let url = url.as_str();
            poll_until(&self.poll, &what, move || async move {
                let current: Operation = self.call(Method::GET, url, None).await?;
                Ok::<_, ProviderError>(current.status == "DONE")
            })
            .await?;
        }
        let done: Operation = self.call(Method::GET, &url, None).await?;
        match done.error {
            Some(e) if !e.message.is_empty() => Err(ProviderError::api(
                ProviderKind::Gke,
                format!("operation {} failed: {}", done.name, e.message),
            )),
            _ => Ok(()),
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> ProviderResult<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::api(ProviderKind::Gke, format!("HTTP {status}: {body}")));
    }
    resp.json()
        .await
        .map_err(|e| ProviderError::api(ProviderKind::Gke, format!("decoding response: {e}")))
}

#[async_trait]
impl GkeApi for GkeClient {
    async fn list_node_pools(&self) -> ProviderResult<Vec<GkeNodePool>> {
        let url = format!("{}/nodePools", self.cluster_url);
        let list: ListNodePoolsResponse = self.call(Method::GET, &url, None).await?;
        Ok(list.node_pools)
    }

    async fn target_size(&self, pool: &GkeNodePool) -> ProviderResult<u32> {
        let mut total = 0;
        for url in &pool.instance_group_urls {
            let url = url.replace("/instanceGroups/", "/instanceGroupManagers/");
            let igm: InstanceGroupManager = self.call(Method::GET, &url, None).await?;
            total += igm.target_size;
        }
        Ok(total)
    }

    async fn set_size(&self, pool: &str, node_count: u32) -> ProviderResult<()> {
        let url = format!("{}/nodePools/{pool}:setSize", self.cluster_url);
        let body = serde_json::json!({ "nodeCount": node_count });
        let op: Operation = self.call(Method::POST, &url, Some(body)).await?;
        self.wait_operation(op).await
    }

    async fn set_autoscaling(&self, pool: &str, range: Option<AutoscalingRange>) -> ProviderResult<()> {
        let url = format!("{}/nodePools/{pool}:setAutoscaling", self.cluster_url);
        let autoscaling = match range {
            Some(r) => serde_json::json!({
                "enabled": true,
                "minNodeCount": r.min,
                "maxNodeCount": r.max,
            }),
            None => serde_json::json!({ "enabled": false }),
        };
        let body = serde_json::json!({ "autoscaling": autoscaling });
        let op: Operation = self.call(Method::POST, &url, Some(body)).await?;
        self.wait_operation(op).await
    }

    async fn create_node_pool(&self, request: &NewNodePool) -> ProviderResult<()> {
        let url = format!("{}/nodePools", self.cluster_url);
        let body = serde_json::json!({
            "nodePool": {
                "name": request.name,
                "initialNodeCount": request.node_count,
                "config": {
                    "machineType": request.machine_type,
                    "labels": request.labels,
                },
            }
        });
        let resp = self.request(Method::POST, &url, Some(body)).await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            debug!(pool = %request.name, "node pool already exists");
            return Ok(());
        }
        let op: Operation = decode(resp).await?;
        self.wait_operation(op).await
    }
}

// ── Provider ───────────────────────────────────────────────────────

pub struct GkeProvider {
    api: Arc<dyn GkeApi>,
    kube: Arc<dyn KubeClient>,
    snapshots: SizeSnapshots,
    settings: ProviderSettings,
}

impl GkeProvider {
    pub fn new(api: Arc<dyn GkeApi>, kube: Arc<dyn KubeClient>, settings: ProviderSettings) -> Self {
        let snapshots = settings.snapshots(kube.clone());
        Self {
            api,
            kube,
            snapshots,
            settings,
        }
    }

    fn is_singleton(&self, pool: &GkeNodePool) -> bool {
        pool.name == self.settings.singleton_pool || pool.has_marker_label()
    }
}

#[async_trait]
impl ComputeProvider for GkeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gke
    }

    async fn is_turndown_node_pool(&self) -> bool {
        host_is_singleton(self.kube.as_ref(), &self.settings.node_name).await
    }

    async fn create_singleton_node_pool(&self) -> ProviderResult<()> {
        let pools = self.api.list_node_pools().await?;
        if pools.iter().any(|p| self.is_singleton(p)) {
            debug!(pool = %self.settings.singleton_pool, "singleton node pool already exists");
        } else {
            let request = NewNodePool {
                name: self.settings.singleton_pool.clone(),
                node_count: 1,
                machine_type: self.settings.gke_machine_type.clone(),
                labels: BTreeMap::from([(
                    TURNDOWN_NODE_LABEL.to_string(),
                    TURNDOWN_NODE_LABEL_VALUE.to_string(),
                )]),
            };
            self.api.create_node_pool(&request).await?;
            info!(pool = %request.name, machine_type = %request.machine_type, "singleton node pool created");
        }

        wait_until_node_created(
            self.kube.as_ref(),
            TURNDOWN_NODE_LABEL,
            TURNDOWN_NODE_LABEL_VALUE,
            &self.settings.singleton_pool,
            &self.settings.poll,
        )
        .await
    }

    async fn node_pools(&self) -> ProviderResult<Vec<NodePool>> {
        let pools = self.api.list_node_pools().await?;
        let nodes = self.kube.list_nodes(None).await?;

        let mut out = Vec::with_capacity(pools.len());
        for pool in &pools {
            let node_count = nodes
                .iter()
                .filter(|n| node_label(n, GKE_NODE_POOL_LABEL) == Some(pool.name.as_str()))
                .count() as u32;
            let desired = self.api.target_size(pool).await?;
            let mut np = NodePool::new(&pool.name, node_count, desired);
            np.autoscaling = pool.autoscaling_range();
            np.singleton = self.is_singleton(pool);
            out.push(np);
        }
        Ok(out)
    }

    fn pool_id(&self, node: &Node) -> Option<String> {
        node_label(node, GKE_NODE_POOL_LABEL).map(str::to_string)
    }

    async fn set_node_pool_sizes(&self, pools: &[NodePool], size: u32) -> ProviderResult<()> {
        let zones: HashMap<String, u32> = self
            .api
            .list_node_pools()
            .await?
            .into_iter()
            .map(|p| (p.name.clone(), p.zone_count()))
            .collect();

        for pool in pools {
            let zone_count = zones.get(&pool.id).copied().unwrap_or(1);
            let original = PoolSize {
                node_count: pool.desired.div_ceil(zone_count),
                autoscaling: pool.autoscaling,
            };
            self.snapshots.record(&pool.id, original).await?;

            if pool.autoscaling.is_some() {
                self.api
                    .set_autoscaling(&pool.id, None)
                    .await
                    .inspect_err(|e| warn!(pool = %pool.id, error = %e, "disabling autoscaling failed"))?;
            }
            self.api
                .set_size(&pool.id, size)
                .await
                .inspect_err(|e| warn!(pool = %pool.id, size, error = %e, "node pool resize failed"))?;
            info!(pool = %pool.id, size, "node pool resize requested");
        }
        Ok(())
    }

    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> ProviderResult<()> {
        for pool in pools {
            let Some(original) = self.snapshots.get(&pool.id).await? else {
                debug!(pool = %pool.id, "no size snapshot, leaving pool as is");
                continue;
            };
            self.api
                .set_size(&pool.id, original.node_count)
                .await
                .inspect_err(|e| {
                    warn!(pool = %pool.id, size = original.node_count, error = %e, "node pool restore failed")
                })?;
            if let Some(range) = original.autoscaling {
                self.api.set_autoscaling(&pool.id, Some(range)).await?;
            }
            self.snapshots.clear(&pool.id).await?;
            info!(pool = %pool.id, size = original.node_count, "node pool size restored");
        }
        Ok(())
    }
}
