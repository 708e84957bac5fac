//! turndown-manager — the turndown state machine and its strategies.
//!
//! # Components
//!
//! - **`strategy`** — how to shrink and restore a cluster safely for a given
//!   provider (masterless or standard), chosen by [`strategy_for`]
//! - **`manager`** — [`TurndownManager`], which serializes transitions and
//!   persists the current [`TurndownPhase`](turndown_state::TurndownPhase)

pub mod error;
pub mod manager;
pub mod strategy;

pub use error::{ManagerError, ManagerResult, StrategyError, StrategyResult, Transition};
pub use manager::TurndownManager;
pub use strategy::{AgentHost, MasterlessStrategy, StandardStrategy, TurndownStrategy, strategy_for};
