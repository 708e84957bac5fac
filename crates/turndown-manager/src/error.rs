use thiserror::Error;
use turndown_provider::ProviderError;
use turndown_state::StateError;

/// Which way a transition moves the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    TurnDown,
    TurnUp,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::TurnDown => f.write_str("turn down"),
            Transition::TurnUp => f.write_str("turn up"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The agent asked to be rescheduled onto the singleton pool; the
    /// turndown resumes once it runs there.
    #[error("agent on node {node} is relocating to the singleton pool")]
    RelocationPending { node: String },

    #[error("singleton node pool not found after creation")]
    NoSingletonNode,
}

impl StrategyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StrategyError::Provider(e) if e.is_timeout())
    }
}

pub type StrategyResult<T> = Result<T, StrategyError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("{transition} failed: {source}")]
    Transition {
        transition: Transition,
        #[source]
        source: StrategyError,
    },

    #[error("persisting turndown phase: {0}")]
    State(#[from] StateError),
}

impl ManagerError {
    pub fn is_relocation_pending(&self) -> bool {
        matches!(
            self,
            ManagerError::Transition {
                source: StrategyError::RelocationPending { .. },
                ..
            }
        )
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
