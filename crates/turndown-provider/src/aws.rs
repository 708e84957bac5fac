//! Self-managed Kubernetes on AWS auto-scaling groups.
//!
//! Pools are the ASGs tagged `kubernetes.io/cluster/<cluster>`. Nodes map
//! to pools through the EC2 instance id in their provider id, resolved
//! against an index rebuilt on every pool listing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use aws_sdk_autoscaling::types::{
    AutoScalingGroup, Filter, LaunchTemplate, LaunchTemplateOverrides, LaunchTemplateSpecification,
    MixedInstancesPolicy,
};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use turndown_core::{AutoscalingRange, NodePool, PoolSize, ProviderKind, TURNDOWN_NODE_LABEL, TURNDOWN_NODE_LABEL_VALUE};

use crate::cluster::{KubeClient, aws_instance_id};
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{ComputeProvider, ProviderSettings, host_is_singleton};
use crate::sdk::{count, sdk_error};
use crate::snapshot::SizeSnapshots;
use crate::wait::poll_until;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchTemplateRef {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
}

impl LaunchTemplateRef {
    fn from_sdk(spec: &LaunchTemplateSpecification) -> Self {
        Self {
            id: spec.launch_template_id().map(str::to_string),
            name: spec.launch_template_name().map(str::to_string),
            version: spec.version().map(str::to_string),
        }
    }

    fn to_sdk(&self) -> LaunchTemplateSpecification {
        LaunchTemplateSpecification::builder()
            .set_launch_template_id(self.id.clone())
            .set_launch_template_name(self.name.clone())
            .set_version(self.version.clone())
            .build()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsgGroup {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    pub instance_ids: Vec<String>,
    pub launch_template: Option<LaunchTemplateRef>,
    /// Comma-separated subnet ids (`VPCZoneIdentifier`).
    pub subnets: Option<String>,
}

impl AsgGroup {
    fn from_sdk(group: &AutoScalingGroup) -> Self {
        let launch_template = group.launch_template().map(LaunchTemplateRef::from_sdk).or_else(|| {
            group
                .mixed_instances_policy()
                .and_then(|p| p.launch_template())
                .and_then(|t| t.launch_template_specification())
                .map(LaunchTemplateRef::from_sdk)
        });
        Self {
            name: group.auto_scaling_group_name().unwrap_or_default().to_string(),
            min: count(group.min_size()),
            max: count(group.max_size()),
            desired: count(group.desired_capacity()),
            instance_ids: group
                .instances()
                .iter()
                .filter_map(|i| i.instance_id())
                .map(str::to_string)
                .collect(),
            launch_template,
            subnets: group.vpc_zone_identifier().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroup {
    pub name: String,
    pub launch_template: LaunchTemplateRef,
    pub subnets: String,
    pub instance_type: String,
}

/// The Auto Scaling API calls the adapter makes.
#[async_trait]
pub trait AutoScalingApi: Send + Sync {
    /// Groups tagged as belonging to the cluster.
    async fn list_groups(&self) -> ProviderResult<Vec<AsgGroup>>;

    async fn find_group(&self, name: &str) -> ProviderResult<Option<AsgGroup>>;

    async fn update_group(&self, name: &str, min: u32, max: u32, desired: u32) -> ProviderResult<()>;

    /// Create a one-instance group. An existing group of that name is not an error.
    async fn create_group(&self, request: &NewGroup) -> ProviderResult<()>;
}

pub struct AsgClient {
    client: aws_sdk_autoscaling::Client,
    cluster: String,
}

impl AsgClient {
    pub fn new(config: &aws_config::SdkConfig, cluster: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_autoscaling::Client::new(config),
            cluster: cluster.into(),
        }
    }
}

#[async_trait]
impl AutoScalingApi for AsgClient {
    async fn list_groups(&self) -> ProviderResult<Vec<AsgGroup>> {
        let filter = Filter::builder()
            .name("tag-key")
            .values(format!("kubernetes.io/cluster/{}", self.cluster))
            .build();

        let mut groups = Vec::new();
        let mut next_token = None;
        loop {
            let out = self
                .client
                .describe_auto_scaling_groups()
                .filters(filter.clone())
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error(ProviderKind::Aws, "listing auto scaling groups", e))?;
            groups.extend(
                out.auto_scaling_groups()
                    .iter()
                    .map(AsgGroup::from_sdk),
            );
            next_token = out.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(groups)
    }

    async fn find_group(&self, name: &str) -> ProviderResult<Option<AsgGroup>> {
        let out = self
            .client
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(name)
            .send()
            .await
            .map_err(|e| sdk_error(ProviderKind::Aws, &format!("describing {name}"), e))?;
        Ok(out
            .auto_scaling_groups()
            .first()
            .map(AsgGroup::from_sdk))
    }

    async fn update_group(&self, name: &str, min: u32, max: u32, desired: u32) -> ProviderResult<()> {
        self.client
            .update_auto_scaling_group()
            .auto_scaling_group_name(name)
            .min_size(min as i32)
            .max_size(max as i32)
            .desired_capacity(desired as i32)
            .send()
            .await
            .map_err(|e| sdk_error(ProviderKind::Aws, &format!("resizing {name}"), e))?;
        Ok(())
    }

    async fn create_group(&self, request: &NewGroup) -> ProviderResult<()> {
        let policy = MixedInstancesPolicy::builder()
            .launch_template(
                LaunchTemplate::builder()
                    .launch_template_specification(request.launch_template.to_sdk())
                    .overrides(
                        LaunchTemplateOverrides::builder()
                            .instance_type(&request.instance_type)
                            .build(),
                    )
                    .build(),
            )
            .build();
        let result = self
            .client
            .create_auto_scaling_group()
            .auto_scaling_group_name(&request.name)
            .mixed_instances_policy(policy)
            .vpc_zone_identifier(&request.subnets)
            .min_size(1)
            .max_size(1)
            .desired_capacity(1)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_already_exists_fault()) => {
                debug!(group = %request.name, "auto scaling group already exists");
                Ok(())
            }
            Err(e) => Err(sdk_error(ProviderKind::Aws, "creating auto scaling group", e)),
        }
    }
}

pub struct AwsProvider {
    api: Arc<dyn AutoScalingApi>,
    kube: Arc<dyn KubeClient>,
    snapshots: SizeSnapshots,
    settings: ProviderSettings,
    /// EC2 instance id -> owning ASG name.
    instances: RwLock<HashMap<String, String>>,
}

impl AwsProvider {
    pub fn new(api: Arc<dyn AutoScalingApi>, kube: Arc<dyn KubeClient>, settings: ProviderSettings) -> Self {
        let snapshots = settings.snapshots(kube.clone());
        Self {
            api,
            kube,
            snapshots,
            settings,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Cluster groups plus the singleton, which carries no cluster tag.
    async fn groups(&self) -> ProviderResult<Vec<AsgGroup>> {
        let mut groups = self.api.list_groups().await?;
        if !groups.iter().any(|g| g.name == self.settings.singleton_pool) {
            if let Some(singleton) = self.api.find_group(&self.settings.singleton_pool).await? {
                groups.push(singleton);
            }
        }
        Ok(groups)
    }

    fn index(&self, groups: &[AsgGroup]) {
        let index = groups
            .iter()
            .flat_map(|g| g.instance_ids.iter().map(|id| (id.clone(), g.name.clone())))
            .collect();
        match self.instances.write() {
            Ok(mut guard) => *guard = index,
            Err(poisoned) => *poisoned.into_inner() = index,
        }
    }

    /// Name of the registered node backing the singleton group's instance.
    async fn singleton_node(&self) -> ProviderResult<Option<String>> {
        let Some(group) = self.api.find_group(&self.settings.singleton_pool).await? else {
            return Ok(None);
        };
        let nodes = self.kube.list_nodes(None).await?;
        Ok(nodes
            .iter()
            .find(|n| aws_instance_id(n).is_some_and(|id| group.instance_ids.iter().any(|i| i == id)))
            .map(|n| n.name_any()))
    }
}

#[async_trait]
impl ComputeProvider for AwsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    async fn is_turndown_node_pool(&self) -> bool {
        host_is_singleton(self.kube.as_ref(), &self.settings.node_name).await
    }

    async fn create_singleton_node_pool(&self) -> ProviderResult<()> {
        let pool = self.settings.singleton_pool.as_str();
        if self.api.find_group(pool).await?.is_some() {
            debug!(group = %pool, "singleton auto scaling group already exists");
        } else {
            let groups = self.api.list_groups().await?;
            let (template, launch_template, subnets) = groups
                .iter()
                .find_map(|g| Some((g, g.launch_template.clone()?, g.subnets.clone()?)))
                .ok_or_else(|| {
                    ProviderError::Config("no auto scaling group with a launch template to copy".to_string())
                })?;
            let request = NewGroup {
                name: pool.to_string(),
                launch_template,
                subnets,
                instance_type: self.settings.aws_instance_type.clone(),
            };
            self.api.create_group(&request).await?;
            info!(group = %pool, template = %template.name, "singleton auto scaling group created");
        }

        let this = self;
        poll_until(
            &self.settings.poll,
            &format!("instance of {pool} to register"),
            move || async move { this.singleton_node().await.map(|node| node.is_some()) },
        )
        .await?;

        if let Some(node) = self.singleton_node().await? {
            self.kube
                .label_node(&node, TURNDOWN_NODE_LABEL, TURNDOWN_NODE_LABEL_VALUE)
                .await?;
            info!(%node, "singleton node labelled");
        }
        Ok(())
    }

    async fn node_pools(&self) -> ProviderResult<Vec<NodePool>> {
        let groups = self.groups().await?;
        self.index(&groups);

        Ok(groups
            .iter()
            .map(|g| {
                let mut pool = NodePool::new(&g.name, g.instance_ids.len() as u32, g.desired)
                    .with_autoscaling(g.min, g.max);
                pool.singleton = g.name == self.settings.singleton_pool;
                pool
            })
            .collect())
    }

    fn pool_id(&self, node: &Node) -> Option<String> {
        let instance = aws_instance_id(node)?;
        let index = match self.instances.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        index.get(instance).cloned()
    }

    async fn set_node_pool_sizes(&self, pools: &[NodePool], size: u32) -> ProviderResult<()> {
        for pool in pools {
            let range = pool.autoscaling.unwrap_or(AutoscalingRange {
                min: pool.desired,
                max: pool.desired,
            });
            self.snapshots
                .record(
                    &pool.id,
                    PoolSize {
                        node_count: pool.desired,
                        autoscaling: Some(range),
                    },
                )
                .await?;

            let (min, max) = (range.min.min(size), range.max.max(size));
            self.api
                .update_group(&pool.id, min, max, size)
                .await
                .inspect_err(|e| warn!(pool = %pool.id, size, error = %e, "auto scaling group resize failed"))?;
            info!(pool = %pool.id, size, min, max, "auto scaling group resize requested");
        }
        Ok(())
    }

    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> ProviderResult<()> {
        for pool in pools {
            let Some(original) = self.snapshots.get(&pool.id).await? else {
                debug!(pool = %pool.id, "no size snapshot, leaving group as is");
                continue;
            };
            let range = original.autoscaling.unwrap_or(AutoscalingRange {
                min: original.node_count,
                max: original.node_count,
            });
            self.api
                .update_group(&pool.id, range.min, range.max, original.node_count)
                .await
                .inspect_err(|e| {
                    warn!(pool = %pool.id, size = original.node_count, error = %e, "auto scaling group restore failed")
                })?;
            self.snapshots.clear(&pool.id).await?;
            info!(pool = %pool.id, size = original.node_count, "auto scaling group size restored");
        }
        Ok(())
    }
}
