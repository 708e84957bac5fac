//! turndown-provider — cloud node pool adapters for cluster turndown.
//!
//! # Architecture
//!
//! [`ComputeProvider`] is the contract every cloud adapter implements:
//! list pools, resize them, restore them, and provision the singleton
//! pool that hosts the agent during a turndown. Adapters exist for GKE,
//! EKS managed node groups, and self-managed AWS auto-scaling groups;
//! [`Provider`] is the closed set of them, chosen once at startup by
//! [`detect`].
//!
//! Adapters talk to Kubernetes through the [`KubeClient`] trait and to
//! their cloud through a per-cloud API trait (`GkeApi`, `EksApi`,
//! `AutoScalingApi`), so all of them run against in-memory fakes in tests.
//!
//! Sizes are requests. Convergence is observed separately with
//! [`poll_until`], which bounds every wait with a [`PollPolicy`].

pub mod aws;
pub mod cluster;
pub mod detect;
pub mod eks;
pub mod error;
pub mod gke;
pub mod metadata;
pub mod provider;
mod sdk;
pub mod snapshot;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod wait;

pub use cluster::{KubeApiClient, KubeClient};
pub use detect::{detect, detect_from_node};
pub use error::{ProviderError, ProviderResult};
pub use metadata::MetadataClient;
pub use provider::{ComputeProvider, Provider, ProviderSettings};
pub use snapshot::SizeSnapshots;
pub use wait::{PollPolicy, poll_until, wait_until_node_created};

/// User-Agent sent on every cloud HTTP request.
pub fn user_agent() -> String {
    format!("cluster-turndown/{}", env!("CARGO_PKG_VERSION"))
}
