//! redb table definitions for the turndown state store.
//!
//! Each table holds a single well-known key; the value is a JSON document.

use redb::TableDefinition;

/// Every table maps a well-known `&str` key to a JSON document.
pub type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// The one active schedule, under [`SCHEDULE_KEY`].
pub const SCHEDULES: RecordTable = TableDefinition::new("schedules");

/// Manager phase, under [`PHASE_KEY`].
pub const TURNDOWN: RecordTable = TableDefinition::new("turndown");

/// Control-surface settings, under [`SERVICE_KEY`].
pub const SETTINGS: RecordTable = TableDefinition::new("settings");

pub const SCHEDULE_KEY: &str = "active";
pub const PHASE_KEY: &str = "phase";
pub const SERVICE_KEY: &str = "service_key";
