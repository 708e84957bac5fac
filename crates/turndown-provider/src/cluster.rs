//! Kubernetes operations the turndown core needs.
//!
//! Everything goes through the [`KubeClient`] trait so strategies and
//! providers can run against an in-memory cluster in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use turndown_core::CONTROL_PLANE_LABELS;

use crate::error::ProviderResult;

/// Field manager name used for server-side apply.
pub const FIELD_MANAGER: &str = "cluster-turndown";

/// Trait abstracting the Kubernetes API calls made during turndown.
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// List nodes, optionally filtered by a label selector (`k=v,k2`).
    async fn list_nodes(&self, label_selector: Option<&str>) -> ProviderResult<Vec<Node>>;

    async fn get_node(&self, name: &str) -> ProviderResult<Node>;

    /// Set a single label on a node, leaving other labels intact.
    async fn label_node(&self, name: &str, key: &str, value: &str) -> ProviderResult<()>;

    /// Merge `selector` into a Deployment's pod template `nodeSelector`.
    ///
    /// Changing the template makes the Deployment reschedule its pods.
    async fn set_deployment_node_selector(
        &self,
        namespace: &str,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> ProviderResult<()>;

    /// Read a ConfigMap's data. `None` if the ConfigMap does not exist.
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<BTreeMap<String, String>>>;

    /// Create or replace a ConfigMap's data.
    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> ProviderResult<()>;
}

/// Real implementation backed by a `kube::Client`.
#[derive(Clone)]
pub struct KubeApiClient {
    client: Client,
}

impl KubeApiClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster service account or local kubeconfig.
    pub async fn try_default() -> ProviderResult<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

#[async_trait]
impl KubeClient for KubeApiClient {
    async fn list_nodes(&self, label_selector: Option<&str>) -> ProviderResult<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get_node(&self, name: &str) -> ProviderResult<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn label_node(&self, name: &str, key: &str, value: &str) -> ProviderResult<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "labels": { key: value } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node = %name, %key, %value, "node labelled");
        Ok(())
    }

    async fn set_deployment_node_selector(
        &self,
        namespace: &str,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "template": { "spec": { "nodeSelector": selector } } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(%namespace, deployment = %name, ?selector, "deployment node selector patched");
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .map(|cm| cm.data.unwrap_or_default()))
    }

    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": namespace },
            "data": data,
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&manifest),
        )
        .await?;
        Ok(())
    }
}

// ── Node helpers ───────────────────────────────────────────────────

/// Value of `key` on the node, if set.
pub fn node_label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.labels().get(key).map(String::as_str)
}

pub fn has_label(node: &Node, key: &str, value: &str) -> bool {
    node_label(node, key) == Some(value)
}

/// The cloud provider id (`spec.providerID`), e.g. `aws:///us-east-1a/i-0123`.
pub fn provider_id(node: &Node) -> Option<&str> {
    node.spec.as_ref()?.provider_id.as_deref()
}

/// EC2 instance id from an AWS provider id: its last path segment.
pub fn aws_instance_id(node: &Node) -> Option<&str> {
    provider_id(node)?
        .rsplit('/')
        .next()
        .filter(|id| id.starts_with("i-"))
}

pub fn is_control_plane(node: &Node) -> bool {
    CONTROL_PLANE_LABELS
        .iter()
        .any(|label| node.labels().contains_key(*label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_node;

    #[test]
    fn aws_instance_id_from_provider_id() {
        let node = make_node("ip-10-0-0-1", &[], Some("aws:///us-east-1a/i-0123"));
        assert_eq!(aws_instance_id(&node), Some("i-0123"));

        let gce = make_node("gke-a", &[], Some("gce://project/us-central1-a/gke-a"));
        assert_eq!(aws_instance_id(&gce), None);

        let bare = make_node("kind-worker", &[], None);
        assert_eq!(aws_instance_id(&bare), None);
    }

    #[test]
    fn control_plane_detection() {
        let master = make_node("m", &[("node-role.kubernetes.io/master", "")], None);
        let cp = make_node("c", &[("node-role.kubernetes.io/control-plane", "")], None);
        let worker = make_node("w", &[("kubernetes.io/os", "linux")], None);
        assert!(is_control_plane(&master));
        assert!(is_control_plane(&cp));
        assert!(!is_control_plane(&worker));
    }

    #[test]
    fn label_lookup() {
        let node = make_node("n", &[("cluster-turndown-node", "true")], None);
        assert!(has_label(&node, "cluster-turndown-node", "true"));
        assert!(!has_label(&node, "cluster-turndown-node", "false"));
        assert_eq!(node_label(&node, "missing"), None);
    }
}
