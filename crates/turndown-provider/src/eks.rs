//! Amazon EKS managed node group adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_eks::types::{Nodegroup, NodegroupScalingConfig};
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info, warn};

use turndown_core::{
    AutoscalingRange, EKS_NODE_GROUP_LABEL, NodePool, PoolSize, ProviderKind, TURNDOWN_NODE_LABEL,
    TURNDOWN_NODE_LABEL_VALUE,
};

use crate::cluster::{KubeClient, node_label};
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{ComputeProvider, ProviderSettings, host_is_singleton};
use crate::sdk::{count, sdk_error};
use crate::snapshot::SizeSnapshots;
use crate::wait::poll_until;

/// A managed node group as the adapter sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EksNodegroup {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    pub labels: HashMap<String, String>,
    pub subnets: Vec<String>,
    pub node_role: Option<String>,
    pub instance_types: Vec<String>,
}

impl EksNodegroup {
    fn from_sdk(ng: &Nodegroup) -> Self {
        let scaling = ng.scaling_config();
        Self {
            name: ng.nodegroup_name().unwrap_or_default().to_string(),
            min: count(scaling.and_then(|s| s.min_size())),
            max: count(scaling.and_then(|s| s.max_size())),
            desired: count(scaling.and_then(|s| s.desired_size())),
            labels: ng.labels().cloned().unwrap_or_default(),
            subnets: ng.subnets().to_vec(),
            node_role: ng.node_role().map(str::to_string),
            instance_types: ng.instance_types().to_vec(),
        }
    }

    fn has_marker_label(&self) -> bool {
        self.labels
            .get(TURNDOWN_NODE_LABEL)
            .is_some_and(|v| v == TURNDOWN_NODE_LABEL_VALUE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNodegroup {
    pub name: String,
    pub node_role: String,
    pub subnets: Vec<String>,
    pub instance_type: String,
    pub labels: HashMap<String, String>,
}

/// The EKS API calls the adapter makes.
#[async_trait]
pub trait EksApi: Send + Sync {
    async fn list_nodegroups(&self) -> ProviderResult<Vec<EksNodegroup>>;

    async fn update_scaling(&self, name: &str, min: u32, max: u32, desired: u32) -> ProviderResult<()>;

    /// Create a one-node group. An existing group of that name is not an error.
    async fn create_nodegroup(&self, request: &NewNodegroup) -> ProviderResult<()>;
}

pub struct EksClient {
    client: aws_sdk_eks::Client,
    cluster: String,
}

impl EksClient {
    pub fn new(config: &aws_config::SdkConfig, cluster: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_eks::Client::new(config),
            cluster: cluster.into(),
        }
    }
}

fn scaling(min: u32, max: u32, desired: u32) -> NodegroupScalingConfig {
    NodegroupScalingConfig::builder()
        .min_size(min as i32)
        .max_size(max as i32)
        .desired_size(desired as i32)
        .build()
}

#[async_trait]
impl EksApi for EksClient {
    async fn list_nodegroups(&self) -> ProviderResult<Vec<EksNodegroup>> {
        let mut names = Vec::new();
        let mut next_token = None;
        loop {
            let out = self
                .client
                .list_nodegroups()
                .cluster_name(&self.cluster)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error(ProviderKind::Eks, "listing node groups", e))?;
            names.extend(out.nodegroups().iter().cloned());
            next_token = out.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        let mut groups = Vec::with_capacity(names.len());
        for name in names {
            let out = self
                .client
                .describe_nodegroup()
                .cluster_name(&self.cluster)
                .nodegroup_name(&name)
                .send()
                .await
                .map_err(|e| sdk_error(ProviderKind::Eks, &format!("describing node group {name}"), e))?;
            if let Some(ng) = out.nodegroup() {
                groups.push(EksNodegroup::from_sdk(ng));
            }
        }
        Ok(groups)
    }

    async fn update_scaling(&self, name: &str, min: u32, max: u32, desired: u32) -> ProviderResult<()> {
        self.client
            .update_nodegroup_config()
            .cluster_name(&self.cluster)
            .nodegroup_name(name)
            .scaling_config(scaling(min, max, desired))
            .send()
            .await
            .map_err(|e| sdk_error(ProviderKind::Eks, &format!("scaling node group {name}"), e))?;
        Ok(())
    }

    async fn create_nodegroup(&self, request: &NewNodegroup) -> ProviderResult<()> {
        let result = self
            .client
            .create_nodegroup()
            .cluster_name(&self.cluster)
            .nodegroup_name(&request.name)
            .node_role(&request.node_role)
            .set_subnets(Some(request.subnets.clone()))
            .instance_types(&request.instance_type)
            .set_labels(Some(request.labels.clone()))
            .scaling_config(scaling(1, 1, 1))
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_resource_in_use_exception()) => {
                debug!(nodegroup = %request.name, "node group already exists");
                Ok(())
            }
            Err(e) => Err(sdk_error(ProviderKind::Eks, "creating node group", e)),
        }
    }
}

pub struct EksProvider {
    api: Arc<dyn EksApi>,
    kube: Arc<dyn KubeClient>,
    snapshots: SizeSnapshots,
    settings: ProviderSettings,
}

impl EksProvider {
    pub fn new(api: Arc<dyn EksApi>, kube: Arc<dyn KubeClient>, settings: ProviderSettings) -> Self {
        let snapshots = settings.snapshots(kube.clone());
        Self {
            api,
            kube,
            snapshots,
            settings,
        }
    }

    fn is_singleton(&self, group: &EksNodegroup) -> bool {
        group.name == self.settings.singleton_pool || group.has_marker_label()
    }
}

#[async_trait]
impl ComputeProvider for EksProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Eks
    }

    async fn is_turndown_node_pool(&self) -> bool {
        host_is_singleton(self.kube.as_ref(), &self.settings.node_name).await
    }

    async fn create_singleton_node_pool(&self) -> ProviderResult<()> {
        let groups = self.api.list_nodegroups().await?;
        let pool = self.settings.singleton_pool.as_str();

        if groups.iter().any(|g| self.is_singleton(g)) {
            debug!(nodegroup = %pool, "singleton node group already exists");
        } else {
            let template = groups
                .iter()
                .find(|g| g.node_role.is_some() && !g.subnets.is_empty())
                .ok_or_else(|| {
                    ProviderError::Config("no node group to copy node role and subnets from".to_string())
                })?;
            let request = NewNodegroup {
                name: pool.to_string(),
                node_role: template.node_role.clone().unwrap_or_default(),
                subnets: template.subnets.clone(),
                instance_type: self.settings.aws_instance_type.clone(),
                labels: HashMap::from([(
                    TURNDOWN_NODE_LABEL.to_string(),
                    TURNDOWN_NODE_LABEL_VALUE.to_string(),
                )]),
            };
            self.api.create_nodegroup(&request).await?;
            info!(nodegroup = %pool, template = %template.name, "singleton node group created");
        }

        // EKS node names are host names, so match on the node group label.
        let selector = format!("{EKS_NODE_GROUP_LABEL}={pool}");
        let selector = selector.as_str();
        let kube = self.kube.as_ref();
        poll_until(
            &self.settings.poll,
            &format!("node of node group {pool} to register"),
            move || async move { kube.list_nodes(Some(selector)).await.map(|nodes| !nodes.is_empty()) },
        )
        .await
    }

    async fn node_pools(&self) -> ProviderResult<Vec<NodePool>> {
        let groups = self.api.list_nodegroups().await?;
        let nodes = self.kube.list_nodes(None).await?;

        Ok(groups
            .iter()
            .map(|g| {
                let node_count = nodes
                    .iter()
                    .filter(|n| node_label(n, EKS_NODE_GROUP_LABEL) == Some(g.name.as_str()))
                    .count() as u32;
                let mut pool = NodePool::new(&g.name, node_count, g.desired).with_autoscaling(g.min, g.max);
                pool.singleton = self.is_singleton(g);
                pool
            })
            .collect())
    }

    fn pool_id(&self, node: &Node) -> Option<String> {
        node_label(node, EKS_NODE_GROUP_LABEL).map(str::to_string)
    }

    async fn set_node_pool_sizes(&self, pools: &[NodePool], size: u32) -> ProviderResult<()> {
        for pool in pools {
            let range = pool.autoscaling.unwrap_or(AutoscalingRange {
                min: pool.desired,
                max: pool.desired,
            });
            let original = PoolSize {
                node_count: pool.desired,
                autoscaling: Some(range),
            };
            self.snapshots.record(&pool.id, original).await?;

            // EKS requires max >= 1 and min <= desired <= max.
            let (min, max) = (range.min.min(size), range.max.max(size).max(1));
            self.api
                .update_scaling(&pool.id, min, max, size)
                .await
                .inspect_err(|e| warn!(pool = %pool.id, size, error = %e, "node group resize failed"))?;
            info!(pool = %pool.id, size, min, max, "node group resize requested");
        }
        Ok(())
    }

    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> ProviderResult<()> {
        for pool in pools {
            let Some(original) = self.snapshots.get(&pool.id).await? else {
                debug!(pool = %pool.id, "no size snapshot, leaving node group as is");
                continue;
            };
            let range = original.autoscaling.unwrap_or(AutoscalingRange {
                min: original.node_count,
                max: original.node_count,
            });
            self.api
                .update_scaling(&pool.id, range.min, range.max.max(1), original.node_count)
                .await
                .inspect_err(|e| {
                    warn!(pool = %pool.id, size = original.node_count, error = %e, "node group restore failed")
                })?;
            self.snapshots.clear(&pool.id).await?;
            info!(pool = %pool.id, size = original.node_count, "node group size restored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::testing::{FakeKube, make_node};
    use crate::wait::PollPolicy;

    #[test]
    fn nodegroup_from_sdk_reads_scaling_and_placement() {
        let ng = Nodegroup::builder()
            .nodegroup_name("workers")
            .scaling_config(
                NodegroupScalingConfig::builder()
                    .min_size(1)
                    .max_size(5)
                    .desired_size(3)
                    .build(),
            )
            .subnets("subnet-a")
            .subnets("subnet-b")
            .node_role("arn:aws:iam::1:role/nodes")
            .instance_types("m5.large")
            .labels(TURNDOWN_NODE_LABEL, TURNDOWN_NODE_LABEL_VALUE)
            .build();

        let group = EksNodegroup::from_sdk(&ng);
        assert_eq!(group.name, "workers");
        assert_eq!((group.min, group.max, group.desired), (1, 5, 3));
        assert_eq!(group.subnets, vec!["subnet-a", "subnet-b"]);
        assert_eq!(group.node_role.as_deref(), Some("arn:aws:iam::1:role/nodes"));
        assert_eq!(group.instance_types, vec!["m5.large"]);
        assert!(group.has_marker_label());

        let bare = EksNodegroup::from_sdk(&Nodegroup::builder().nodegroup_name("empty").build());
        assert_eq!((bare.min, bare.max, bare.desired), (0, 0, 0));
        assert!(bare.subnets.is_empty());
        assert!(bare.labels.is_empty());
    }

    #[derive(Default)]
    struct FakeEks {
        groups: Mutex<Vec<EksNodegroup>>,
        created: Mutex<Vec<NewNodegroup>>,
        updates: Mutex<Vec<(String, u32, u32, u32)>>,
    }

    impl FakeEks {
        fn with_group(self, name: &str, min: u32, max: u32, desired: u32) -> Self {
            self.groups.lock().unwrap().push(EksNodegroup {
                name: name.to_string(),
                min,
                max,
                desired,
                subnets: vec!["subnet-a".into(), "subnet-b".into()],
                node_role: Some("arn:aws:iam::1:role/nodes".into()),
                instance_types: vec!["m5.large".into()],
                ..Default::default()
            });
            self
        }
    }

    #[async_trait]
    impl EksApi for FakeEks {
        async fn list_nodegroups(&self) -> ProviderResult<Vec<EksNodegroup>> {
            Ok(self.groups.lock().unwrap().clone())
        }

        async fn update_scaling(&self, name: &str, min: u32, max: u32, desired: u32) -> ProviderResult<()> {
            self.updates
                .lock()
                .unwrap()
                .push((name.to_string(), min, max, desired));
            if let Some(g) = self.groups.lock().unwrap().iter_mut().find(|g| g.name == name) {
                (g.min, g.max, g.desired) = (min, max, desired);
            }
            Ok(())
        }

        async fn create_nodegroup(&self, request: &NewNodegroup) -> ProviderResult<()> {
            self.created.lock().unwrap().push(request.clone());
            self.groups.lock().unwrap().push(EksNodegroup {
                name: request.name.clone(),
                min: 1,
                max: 1,
                desired: 1,
                labels: request.labels.clone(),
                ..Default::default()
            });
            Ok(())
        }
    }

    fn provider(api: Arc<FakeEks>, kube: Arc<FakeKube>) -> EksProvider {
        let settings = ProviderSettings {
            poll: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(5)),
            ..ProviderSettings::new("ip-10-0-0-1")
        };
        EksProvider::new(api, kube, settings)
    }

    #[tokio::test(start_paused = true)]
    async fn singleton_copies_role_and_subnets_once() {
        let api = Arc::new(FakeEks::default().with_group("workers", 1, 5, 3));
        let kube = Arc::new(FakeKube::new());
        kube.add_node(make_node(
            "ip-10-0-9-9",
            &[(EKS_NODE_GROUP_LABEL, "cluster-turndown")],
            Some("aws:///us-east-1a/i-0999"),
        ));
        let provider = provider(api.clone(), kube);

        provider.create_singleton_node_pool().await.unwrap();
        provider.create_singleton_node_pool().await.unwrap();

        let created = api.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].subnets, vec!["subnet-a", "subnet-b"]);
        assert_eq!(created[0].node_role, "arn:aws:iam::1:role/nodes");
        assert_eq!(created[0].instance_type, "t3.small");
        assert_eq!(
            created[0].labels.get(TURNDOWN_NODE_LABEL).map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    async fn shrink_lowers_min_and_restore_brings_it_back() {
        let api = Arc::new(FakeEks::default().with_group("workers", 2, 5, 3));
        let provider = provider(api.clone(), Arc::new(FakeKube::new()));

        let pools = provider.node_pools().await.unwrap();
        provider.set_node_pool_sizes(&pools, 0).await.unwrap();
        provider.reset_node_pool_sizes(&pools).await.unwrap();

        let updates = api.updates.lock().unwrap().clone();
        assert_eq!(
            updates,
            vec![
                ("workers".to_string(), 0, 5, 0),
                ("workers".to_string(), 2, 5, 3),
            ]
        );
    }

    #[tokio::test]
    async fn node_count_comes_from_labelled_nodes() {
        let api = Arc::new(FakeEks::default().with_group("workers", 1, 5, 3));
        let kube = Arc::new(FakeKube::new());
        kube.add_node(make_node("ip-1", &[(EKS_NODE_GROUP_LABEL, "workers")], None));
        kube.add_node(make_node("ip-2", &[(EKS_NODE_GROUP_LABEL, "other")], None));

        let provider = provider(api, kube.clone());
        let pools = provider.node_pools().await.unwrap();
        assert_eq!(pools[0].node_count, 1);
        assert_eq!(pools[0].desired, 3);

        let node = make_node("ip-1", &[(EKS_NODE_GROUP_LABEL, "workers")], None);
        assert_eq!(provider.pool_id(&node).as_deref(), Some("workers"));
    }
}
