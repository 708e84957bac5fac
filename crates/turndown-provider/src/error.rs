//! Provider error types.

use std::time::Duration;

use thiserror::Error;
use turndown_core::ProviderKind;

/// Errors raised by compute providers and their Kubernetes collaborator.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("kubernetes api error: {0}")]
    Kube(String),

    #[error("{provider} api error: {message}")]
    Api {
        provider: ProviderKind,
        message: String,
    },

    #[error("timed out after {}s waiting for {what}", elapsed.as_secs())]
    Timeout { what: String, elapsed: Duration },

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("provider detection failed: {0}")]
    Detection(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("pool size snapshot error: {0}")]
    Snapshot(String),
}

impl ProviderError {
    pub fn api(provider: ProviderKind, message: impl std::fmt::Display) -> Self {
        Self::Api {
            provider,
            message: message.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<kube::Error> for ProviderError {
    fn from(e: kube::Error) -> Self {
        Self::Kube(e.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
