use thiserror::Error;
use turndown_manager::ManagerError;
use turndown_state::StateError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule range: {0}")]
    InvalidRange(String),

    #[error("no active schedule")]
    NoSchedule,

    #[error("schedule store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
