//! turndown-scheduler — when to turn the cluster down and back up.
//!
//! [`TurndownScheduler`] owns the single persisted [`Schedule`](turndown_state::Schedule).
//! Operators start and cancel windows through it; its loop compares the
//! clock against the window and calls the
//! [`TurndownManager`](turndown_manager::TurndownManager) when a boundary is
//! crossed. A restart resumes from the stored schedule and manager phase.

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{ScheduleRequest, TurndownScheduler};
