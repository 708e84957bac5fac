//! turndown-state — persistent state for the turndown agent.
//!
//! Backed by [redb](https://docs.rs/redb). Holds exactly one record per
//! concern: the active turndown schedule, the manager's current phase,
//! and the shared service key. Every write is a single redb write
//! transaction, so a crash mid-write leaves the previous record intact.
//!
//! Records are JSON-serialized into `&[u8]` value columns. A record that
//! fails to deserialize is logged and treated as absent.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
