//! One-time provider detection at startup.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info};

use turndown_core::{EKS_NODE_GROUP_LABEL, ProviderKind};

use crate::cluster::{KubeClient, provider_id};
use crate::error::{ProviderError, ProviderResult};

/// Classify a cluster from one of its nodes.
///
/// An `aws` provider id selects EKS when the node carries the EKS node
/// group label and plain AWS otherwise. Everything else is unsupported.
pub fn detect_from_node(node: &Node) -> ProviderResult<ProviderKind> {
    let id = provider_id(node).unwrap_or_default().to_lowercase();
    if id.starts_with("aws") {
        if node.labels().contains_key(EKS_NODE_GROUP_LABEL) {
            debug!(provider_id = %id, "aws provider id with EKS node group label");
            return Ok(ProviderKind::Eks);
        }
        debug!(provider_id = %id, "aws provider id");
        return Ok(ProviderKind::Aws);
    }
    if id.starts_with("azure") {
        return Err(ProviderError::UnsupportedProvider("azure".to_string()));
    }
    Err(ProviderError::UnsupportedProvider(if id.is_empty() {
        format!("node {} has no provider id", node.name_any())
    } else {
        id
    }))
}

/// Detect the provider: GKE if the GCE metadata server answered, else by
/// inspecting the first node of the cluster.
pub async fn detect(on_gce: bool, kube: &dyn KubeClient) -> ProviderResult<ProviderKind> {
    let kind = if on_gce {
        ProviderKind::Gke
    } else {
        let nodes = kube.list_nodes(None).await?;
        let node = nodes
            .first()
            .ok_or_else(|| ProviderError::Detection("cluster has no nodes".to_string()))?;
        detect_from_node(node)?
    };
    info!(provider = %kind, "detected compute provider");
    Ok(kind)
}
