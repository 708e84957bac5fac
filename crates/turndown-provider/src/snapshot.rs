//! Pre-turndown pool sizes, persisted in a ConfigMap.
//!
//! Pool objects are re-fetched from the cloud on every call and carry no
//! history, so the size a pool had before turndown is recorded here and
//! read back on turn-up. The whole snapshot is one JSON document under
//! [`SNAPSHOT_KEY`], keyed by pool id.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use turndown_core::PoolSize;

use crate::cluster::KubeClient;
use crate::error::{ProviderError, ProviderResult};

pub const SNAPSHOT_KEY: &str = "pool-sizes.json";

type Sizes = BTreeMap<String, PoolSize>;

pub struct SizeSnapshots {
    kube: Arc<dyn KubeClient>,
    namespace: String,
    name: String,
    // Serializes read-modify-write cycles from this process.
    lock: Mutex<()>,
}

impl SizeSnapshots {
    pub fn new(kube: Arc<dyn KubeClient>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kube,
            namespace: namespace.into(),
            name: name.into(),
            lock: Mutex::new(()),
        }
    }

    /// All recorded sizes. A missing ConfigMap or key means none.
    pub async fn load_all(&self) -> ProviderResult<Sizes> {
        let data = self.kube.get_config_map(&self.namespace, &self.name).await?;
        let Some(raw) = data.as_ref().and_then(|d| d.get(SNAPSHOT_KEY)) else {
            return Ok(Sizes::new());
        };
        match serde_json::from_str(raw) {
            Ok(sizes) => Ok(sizes),
            Err(e) => {
                warn!(config_map = %self.name, error = %e, "unparseable size snapshot, ignoring");
                Ok(Sizes::new())
            }
        }
    }

    pub async fn get(&self, pool_id: &str) -> ProviderResult<Option<PoolSize>> {
        Ok(self.load_all().await?.remove(pool_id))
    }

    /// Record `size` for `pool_id` unless a snapshot already exists.
    ///
    /// Returns true if this call wrote the snapshot. A resumed turndown
    /// must never replace the original size with the shrunk one.
    pub async fn record(&self, pool_id: &str, size: PoolSize) -> ProviderResult<bool> {
        let _guard = self.lock.lock().await;
        let mut sizes = self.load_all().await?;
        if sizes.contains_key(pool_id) {
            debug!(pool = %pool_id, "size snapshot already present");
            return Ok(false);
        }
        sizes.insert(pool_id.to_string(), size);
        self.store(&sizes).await?;
        info!(pool = %pool_id, node_count = size.node_count, "pool size recorded");
        Ok(true)
    }

    /// Drop the snapshot for `pool_id` after it has been restored.
    pub async fn clear(&self, pool_id: &str) -> ProviderResult<()> {
        let _guard = self.lock.lock().await;
        let mut sizes = self.load_all().await?;
        if sizes.remove(pool_id).is_some() {
            self.store(&sizes).await?;
            debug!(pool = %pool_id, "size snapshot cleared");
        }
        Ok(())
    }

    async fn store(&self, sizes: &Sizes) -> ProviderResult<()> {
        let json = serde_json::to_string(sizes).map_err(|e| ProviderError::Snapshot(e.to_string()))?;
        let data = BTreeMap::from([(SNAPSHOT_KEY.to_string(), json)]);
        self.kube
            .apply_config_map(&self.namespace, &self.name, &data)
            .await
    }
}
