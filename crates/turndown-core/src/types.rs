//! Shared types used across the turndown crates.

use serde::{Deserialize, Serialize};

/// Label carried by every node of the singleton pool.
pub const TURNDOWN_NODE_LABEL: &str = "cluster-turndown-node";

/// Value of [`TURNDOWN_NODE_LABEL`] on singleton nodes.
pub const TURNDOWN_NODE_LABEL_VALUE: &str = "true";

/// Node label GKE sets to the owning node pool name.
pub const GKE_NODE_POOL_LABEL: &str = "cloud.google.com/gke-nodepool";

/// Node label EKS sets to the owning managed node group name.
pub const EKS_NODE_GROUP_LABEL: &str = "eks.amazonaws.com/nodegroup";

/// Role labels identifying control-plane nodes on self-managed clusters.
pub const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Label selector matching singleton pool nodes.
pub fn turndown_node_selector() -> String {
    format!("{TURNDOWN_NODE_LABEL}={TURNDOWN_NODE_LABEL_VALUE}")
}

/// The cloud environments a provider adapter exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Kubernetes Engine.
    Gke,
    /// Amazon EKS managed node groups.
    Eks,
    /// Self-managed Kubernetes on AWS auto-scaling groups.
    Aws,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gke => "gke",
            ProviderKind::Eks => "eks",
            ProviderKind::Aws => "aws",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Autoscaler bounds configured on a node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingRange {
    pub min: u32,
    pub max: u32,
}

/// A resizable group of nodes as reported by the cloud provider.
///
/// Membership is not embedded: nodes point back at their pool through a
/// label (or provider id), resolved by `ComputeProvider::pool_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    /// Provider-specific identifier (GKE pool name, EKS node group, ASG name).
    pub id: String,
    /// Human-readable name. Equal to `id` for every current provider.
    pub name: String,
    /// Nodes currently registered for this pool.
    pub node_count: u32,
    /// Size most recently requested from the provider.
    pub desired: u32,
    /// Autoscaling bounds, if the provider autoscales this pool.
    pub autoscaling: Option<AutoscalingRange>,
    /// Whether this is the singleton pool hosting the agent.
    pub singleton: bool,
}

impl NodePool {
    pub fn new(id: impl Into<String>, node_count: u32, desired: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_count,
            desired,
            autoscaling: None,
            singleton: false,
        }
    }

    pub fn with_autoscaling(mut self, min: u32, max: u32) -> Self {
        self.autoscaling = Some(AutoscalingRange { min, max });
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    /// True when both the requested and the registered size equal `size`.
    pub fn is_at(&self, size: u32) -> bool {
        self.desired == size && self.node_count == size
    }
}

/// Pre-turndown sizing of a pool, remembered so turn-up can restore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSize {
    /// Requested node count (per zone on GKE).
    pub node_count: u32,
    pub autoscaling: Option<AutoscalingRange>,
}
