//! Turndown strategies — how to shrink a cluster without killing the agent.
//!
//! Both strategies share the same steps: make sure the singleton pool
//! exists, move the agent onto it, shrink every other pool to zero and
//! wait for the nodes to go away. Turning up restores the recorded sizes
//! and waits for the nodes to register again.
//!
//! - **Masterless** (GKE, EKS): the control plane is managed by the cloud,
//!   so every worker pool may be shrunk. Relocation is requested and the
//!   turndown carries on.
//! - **Standard** (self-managed AWS): pools hosting control-plane nodes are
//!   never touched, and no pool is shrunk until the agent is confirmed to
//!   be running on the singleton pool.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use turndown_core::{NodePool, ProviderKind, TURNDOWN_NODE_LABEL, TURNDOWN_NODE_LABEL_VALUE};
use turndown_provider::cluster::is_control_plane;
use turndown_provider::{ComputeProvider, KubeClient, PollPolicy, ProviderError, poll_until};

use crate::error::{StrategyError, StrategyResult};

/// Where the agent runs: its node and the Deployment that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHost {
    pub node_name: String,
    pub namespace: String,
    pub deployment: String,
}

#[async_trait]
pub trait TurndownStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn turn_down(&self, host: &AgentHost) -> StrategyResult<()>;

    async fn turn_up(&self, host: &AgentHost) -> StrategyResult<()>;
}

/// Pick the strategy for a provider.
pub fn strategy_for(
    provider: Arc<dyn ComputeProvider>,
    kube: Arc<dyn KubeClient>,
    poll: PollPolicy,
) -> Arc<dyn TurndownStrategy> {
    let steps = Steps { provider, kube, poll };
    match steps.provider.kind() {
        ProviderKind::Gke | ProviderKind::Eks => Arc::new(MasterlessStrategy { steps }),
        ProviderKind::Aws => Arc::new(StandardStrategy { steps }),
    }
}

// ── Shared steps ───────────────────────────────────────────────────

struct Steps {
    provider: Arc<dyn ComputeProvider>,
    kube: Arc<dyn KubeClient>,
    poll: PollPolicy,
}

impl Steps {
    /// Make sure the singleton pool exists and has a registered node.
    async fn ensure_singleton(&self) -> StrategyResult<()> {
        if self.provider.is_turndown_node_pool().await {
            debug!("agent already on the singleton pool");
            return Ok(());
        }
        self.provider.create_singleton_node_pool().await?;

        let pools = self.provider.node_pools().await?;
        if !pools.iter().any(|p| p.singleton) {
            return Err(StrategyError::NoSingletonNode);
        }
        let provider = self.provider.as_ref();
        poll_until(&self.poll, "singleton pool node", move || async move {
            let pools = provider.node_pools().await?;
            Ok::<_, ProviderError>(pools.iter().any(|p| p.singleton && p.node_count >= 1))
        })
        .await?;
        Ok(())
    }

    /// Pin the agent Deployment to singleton nodes. Returns true if the
    /// agent still has to move.
    async fn relocate(&self, host: &AgentHost) -> StrategyResult<bool> {
        if self.provider.is_turndown_node_pool().await {
            return Ok(false);
        }
        let selector = BTreeMap::from([(
            TURNDOWN_NODE_LABEL.to_string(),
            TURNDOWN_NODE_LABEL_VALUE.to_string(),
        )]);
        self.kube
            .set_deployment_node_selector(&host.namespace, &host.deployment, &selector)
            .await?;
        info!(
            node = %host.node_name,
            deployment = %host.deployment,
            "requested relocation onto the singleton pool"
        );
        Ok(true)
    }

    /// Pool ids hosting control-plane nodes.
    async fn control_plane_pools(&self) -> StrategyResult<HashSet<String>> {
        let nodes = self.kube.list_nodes(None).await?;
        Ok(nodes
            .iter()
            .filter(|n| is_control_plane(n))
            .filter_map(|n| self.provider.pool_id(n))
            .collect())
    }

    /// Shrink every non-singleton pool not in `protected` to zero and
    /// wait until their nodes are gone.
    async fn shrink(&self, protected: &HashSet<String>) -> StrategyResult<()> {
        let pools = self.provider.node_pools().await?;
        let targets: Vec<NodePool> = pools
            .into_iter()
            .filter(|p| !p.singleton && !protected.contains(&p.id))
            .collect();
        let ids: HashSet<String> = targets.iter().map(|p| p.id.clone()).collect();

        let pending: Vec<NodePool> = targets.into_iter().filter(|p| p.desired != 0).collect();
        if pending.is_empty() {
            debug!("every pool already requested at zero");
        } else {
            info!(pools = pending.len(), "shrinking node pools to zero");
            self.provider.set_node_pool_sizes(&pending, 0).await?;
        }

        let provider = self.provider.as_ref();
        let ids = &ids;
        poll_until(&self.poll, "node pools to scale to zero", move || async move {
            let pools = provider.node_pools().await?;
            let remaining: u32 = pools
                .iter()
                .filter(|p| ids.contains(&p.id))
                .map(|p| p.node_count)
                .sum();
            if remaining > 0 {
                debug!(remaining, "waiting for nodes to drain");
            }
            Ok::<_, ProviderError>(remaining == 0)
        })
        .await
        .inspect_err(|e| warn!(pools = ?ids, size = 0, error = %e, "node pools did not scale down"))?;
        Ok(())
    }

    /// Restore every non-singleton pool not in `protected` and wait until
    /// the registered nodes reach the requested sizes.
    async fn restore(&self, protected: &HashSet<String>) -> StrategyResult<()> {
        let pools: Vec<NodePool> = self
            .provider
            .node_pools()
            .await?
            .into_iter()
            .filter(|p| !p.singleton && !protected.contains(&p.id))
            .collect();
        let ids: HashSet<String> = pools.iter().map(|p| p.id.clone()).collect();

        info!(pools = pools.len(), "restoring node pool sizes");
        self.provider.reset_node_pool_sizes(&pools).await?;

        let provider = self.provider.as_ref();
        let ids = &ids;
        poll_until(&self.poll, "node pools to scale back up", move || async move {
            let pools = provider.node_pools().await?;
            Ok::<_, ProviderError>(
                pools
                    .iter()
                    .filter(|p| ids.contains(&p.id))
                    .all(|p| p.node_count >= p.desired),
            )
        })
        .await
        .inspect_err(|e| warn!(pools = ?ids, error = %e, "node pools did not scale up"))?;
        Ok(())
    }
}

// ── Masterless ─────────────────────────────────────────────────────

pub struct MasterlessStrategy {
    steps: Steps,
}

#[async_trait]
impl TurndownStrategy for MasterlessStrategy {
    fn name(&self) -> &'static str {
        "masterless"
    }

    async fn turn_down(&self, host: &AgentHost) -> StrategyResult<()> {
        self.steps.ensure_singleton().await?;
        self.steps.relocate(host).await?;
        self.steps.shrink(&HashSet::new()).await
    }

    async fn turn_up(&self, _host: &AgentHost) -> StrategyResult<()> {
        self.steps.restore(&HashSet::new()).await
    }
}

// ── Standard ───────────────────────────────────────────────────────

pub struct StandardStrategy {
    steps: Steps,
}

#[async_trait]
impl TurndownStrategy for StandardStrategy {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn turn_down(&self, host: &AgentHost) -> StrategyResult<()> {
        self.steps.ensure_singleton().await?;
        if self.steps.relocate(host).await? {
            return Err(StrategyError::RelocationPending {
                node: host.node_name.clone(),
            });
        }
        let protected = self.steps.control_plane_pools().await?;
        if !protected.is_empty() {
            info!(pools = ?protected, "leaving control-plane pools untouched");
        }
        self.steps.shrink(&protected).await
    }

    async fn turn_up(&self, _host: &AgentHost) -> StrategyResult<()> {
        let protected = self.steps.control_plane_pools().await?;
        self.steps.restore(&protected).await
    }
}
