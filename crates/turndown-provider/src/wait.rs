//! Bounded polling against eventually-consistent cloud and cluster state.
//!
//! One primitive, [`poll_until`], backs every "wait for resize", "wait
//! for node registration" and "wait for singleton readiness" in the crate.

use std::future::Future;
use std::time::Duration;

use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cluster::KubeClient;
use crate::error::{ProviderError, ProviderResult};

/// Interval and overall timeout for a convergence poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Run `check` immediately and then every `policy.interval` until it
/// returns `Ok(true)`.
///
/// A failing check is logged and retried. Once `policy.timeout` has
/// elapsed without success the poll fails with [`ProviderError::Timeout`].
pub async fn poll_until<F, Fut>(policy: &PollPolicy, what: &str, mut check: F) -> ProviderResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<bool>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match check().await {
            Ok(true) => {
                debug!(
                    %what,
                    attempt,
                    elapsed_secs = started.elapsed().as_secs(),
                    "condition met"
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(%what, attempt, error = %e, "poll check failed, retrying"),
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            warn!(%what, attempt, elapsed_secs = elapsed.as_secs(), "poll timed out");
            return Err(ProviderError::Timeout {
                what: what.to_string(),
                elapsed,
            });
        }
        tokio::time::sleep(policy.interval.min(policy.timeout - elapsed)).await;
    }
}

/// Wait until a node labelled `label_key=label_value` whose name contains
/// `pool_name` has registered with the cluster.
pub async fn wait_until_node_created(
    kube: &dyn KubeClient,
    label_key: &str,
    label_value: &str,
    pool_name: &str,
    policy: &PollPolicy,
) -> ProviderResult<()> {
    let selector = format!("{label_key}={label_value}");
    let what = format!("node of pool {pool_name} to register");
    let selector = selector.as_str();
    poll_until(policy, &what, move || async move {
        let nodes = kube.list_nodes(Some(selector)).await?;
        Ok::<_, ProviderError>(nodes.iter().any(|n| n.name_any().contains(pool_name)))
    })
    .await
}
