//! The compute provider contract and the closed set of implementations.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tracing::{info, warn};

use turndown_core::{NodePool, ProviderKind, TURNDOWN_NODE_LABEL, TURNDOWN_NODE_LABEL_VALUE, TurndownConfig};

use crate::aws::{AsgClient, AwsProvider};
use crate::cluster::{KubeClient, has_label};
use crate::eks::{EksClient, EksProvider};
use crate::error::{ProviderError, ProviderResult};
use crate::gke::{GkeClient, GkeProvider};
use crate::metadata::MetadataClient;
use crate::snapshot::SizeSnapshots;
use crate::wait::PollPolicy;

/// Cloud-specific node pool operations.
///
/// Resizes are requests: none of these calls waits for the cluster to
/// converge, callers poll [`ComputeProvider::node_pools`] for that.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// True if the node running this agent belongs to the singleton pool.
    async fn is_turndown_node_pool(&self) -> bool;

    /// Create the singleton pool unless it exists, then wait for its node.
    async fn create_singleton_node_pool(&self) -> ProviderResult<()>;

    /// Every pool in the cluster, the singleton included.
    async fn node_pools(&self) -> ProviderResult<Vec<NodePool>>;

    /// The id of the pool owning `node`, if it can be resolved.
    fn pool_id(&self, node: &Node) -> Option<String>;

    /// Request `size` nodes for each pool, recording its original size first.
    async fn set_node_pool_sizes(&self, pools: &[NodePool], size: u32) -> ProviderResult<()>;

    /// Restore each pool to its recorded size. Pools without one are skipped.
    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> ProviderResult<()>;
}

/// Settings shared by every provider adapter.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Node this agent runs on.
    pub node_name: String,
    pub singleton_pool: String,
    pub gke_machine_type: String,
    pub aws_instance_type: String,
    /// Required by the EKS and AWS adapters.
    pub cluster_name: Option<String>,
    /// Namespace of the agent, holding the size snapshot ConfigMap.
    pub namespace: String,
    pub snapshot_config_map: String,
    pub poll: PollPolicy,
}

impl ProviderSettings {
    /// Default settings for an agent on `node_name`.
    pub fn new(node_name: impl Into<String>) -> Self {
        let config = TurndownConfig::default();
        Self::from_config(&config, node_name, PollPolicy::default())
    }

    pub fn from_config(config: &TurndownConfig, node_name: impl Into<String>, poll: PollPolicy) -> Self {
        Self {
            node_name: node_name.into(),
            singleton_pool: config.singleton.pool_name.clone(),
            gke_machine_type: config.singleton.gke_machine_type.clone(),
            aws_instance_type: config.singleton.aws_instance_type.clone(),
            cluster_name: config.aws.cluster_name.clone(),
            namespace: config.agent.namespace.clone(),
            snapshot_config_map: config.snapshot.config_map.clone(),
            poll,
        }
    }

    pub(crate) fn snapshots(&self, kube: Arc<dyn KubeClient>) -> SizeSnapshots {
        SizeSnapshots::new(kube, &self.namespace, &self.snapshot_config_map)
    }

    fn require_cluster_name(&self, kind: ProviderKind) -> ProviderResult<String> {
        self.cluster_name
            .clone()
            .ok_or_else(|| ProviderError::Config(format!("the {kind} provider needs a cluster name")))
    }
}

/// True if `node_name` carries the singleton marker label.
pub(crate) async fn host_is_singleton(kube: &dyn KubeClient, node_name: &str) -> bool {
    match kube.get_node(node_name).await {
        Ok(node) => has_label(&node, TURNDOWN_NODE_LABEL, TURNDOWN_NODE_LABEL_VALUE),
        Err(e) => {
            warn!(node = %node_name, error = %e, "could not read own node, assuming not on singleton pool");
            false
        }
    }
}

/// The supported providers, selected once at startup.
pub enum Provider {
    Gke(GkeProvider),
    Eks(EksProvider),
    Aws(AwsProvider),
}

impl Provider {
    /// Build the adapter for `kind` with its production cloud client.
    pub async fn connect(
        kind: ProviderKind,
        kube: Arc<dyn KubeClient>,
        metadata: MetadataClient,
        settings: ProviderSettings,
    ) -> ProviderResult<Self> {
        let provider = match kind {
            ProviderKind::Gke => {
                let api = GkeClient::from_metadata(metadata, settings.poll).await?;
                Provider::Gke(GkeProvider::new(Arc::new(api), kube, settings))
            }
            ProviderKind::Eks => {
                let cluster = settings.require_cluster_name(kind)?;
                let config = aws_config::load_from_env().await;
                Provider::Eks(EksProvider::new(Arc::new(EksClient::new(&config, cluster)), kube, settings))
            }
            ProviderKind::Aws => {
                let cluster = settings.require_cluster_name(kind)?;
                let config = aws_config::load_from_env().await;
                Provider::Aws(AwsProvider::new(Arc::new(AsgClient::new(&config, cluster)), kube, settings))
            }
        };
        info!(provider = %kind, "compute provider ready");
        Ok(provider)
    }

    fn inner(&self) -> &dyn ComputeProvider {
        match self {
            Provider::Gke(p) => p,
            Provider::Eks(p) => p,
            Provider::Aws(p) => p,
        }
    }
}

#[async_trait]
impl ComputeProvider for Provider {
    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    async fn is_turndown_node_pool(&self) -> bool {
        self.inner().is_turndown_node_pool().await
    }

    async fn create_singleton_node_pool(&self) -> ProviderResult<()> {
        self.inner().create_singleton_node_pool().await
    }

    async fn node_pools(&self) -> ProviderResult<Vec<NodePool>> {
        self.inner().node_pools().await
    }

    fn pool_id(&self, node: &Node) -> Option<String> {
        self.inner().pool_id(node)
    }

    async fn set_node_pool_sizes(&self, pools: &[NodePool], size: u32) -> ProviderResult<()> {
        self.inner().set_node_pool_sizes(pools, size).await
    }

    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> ProviderResult<()> {
        self.inner().reset_node_pool_sizes(pools).await
    }
}
