//! GCE metadata server client.
//!
//! Used for GKE detection and for the project, cluster and OAuth token
//! the GKE adapter needs.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use turndown_core::ProviderKind;

use crate::error::{ProviderError, ProviderResult};
use crate::user_agent;

const DEFAULT_HOST: &str = "169.254.169.254";
const FLAVOR_HEADER: &str = "Metadata-Flavor";
const FLAVOR: &str = "Google";

#[derive(Debug, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

#[derive(Clone)]
pub struct MetadataClient {
    http: Client,
    base_url: String,
}

impl MetadataClient {
    /// Client for the metadata host named by `GCE_METADATA_HOST`, or the
    /// link-local default.
    pub fn from_env() -> ProviderResult<Self> {
        let host = std::env::var("GCE_METADATA_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        Self::with_base_url(format!("http://{host}/computeMetadata/v1"))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> ProviderResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent())
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Config(format!("metadata http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// True if a GCE metadata server answers with the Google flavor header.
    pub async fn on_gce(&self) -> bool {
        let probe = self
            .http
            .get(format!("{}/", self.base_url))
            .header(FLAVOR_HEADER, FLAVOR)
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match probe {
            Ok(resp) => resp
                .headers()
                .get(FLAVOR_HEADER)
                .is_some_and(|v| v.as_bytes() == FLAVOR.as_bytes()),
            Err(e) => {
                debug!(error = %e, "metadata server unreachable, not on GCE");
                false
            }
        }
    }

    /// Fetch a metadata value, e.g. `project/project-id`.
    pub async fn get(&self, path: &str) -> ProviderResult<String> {
        let resp = self
            .http
            .get(format!("{}/{path}", self.base_url))
            .header(FLAVOR_HEADER, FLAVOR)
            .send()
            .await
            .map_err(|e| ProviderError::api(ProviderKind::Gke, format!("metadata {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ProviderError::api(
                ProviderKind::Gke,
                format!("metadata {path}: HTTP {}", resp.status()),
            ));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::api(ProviderKind::Gke, format!("metadata {path}: {e}")))?;
        Ok(text.trim().to_string())
    }

    pub async fn project_id(&self) -> ProviderResult<String> {
        self.get("project/project-id").await
    }

    pub async fn cluster_name(&self) -> ProviderResult<String> {
        self.get("instance/attributes/cluster-name").await
    }

    pub async fn cluster_location(&self) -> ProviderResult<String> {
        self.get("instance/attributes/cluster-location").await
    }

    /// OAuth token for the node's default service account.
    pub async fn access_token(&self) -> ProviderResult<AccessToken> {
        let body = self.get("instance/service-accounts/default/token").await?;
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::api(ProviderKind::Gke, format!("token response: {e}")))
    }
}
