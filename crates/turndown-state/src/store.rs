//! StateStore — redb-backed persistence for the turndown agent.
//!
//! The store holds single-document records. Writes happen inside one
//! redb write transaction each; redb serializes write transactions, so
//! [`StateStore::update_schedule`] is an atomic compare-and-set.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        txn.open_table(TURNDOWN).map_err(map_err!(Table))?;
        txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Schedule ───────────────────────────────────────────────────

    /// Load the active schedule, if any.
    ///
    /// An unparseable record is logged and reported as no schedule.
    pub fn get_schedule(&self) -> StateResult<Option<Schedule>> {
        self.get_record(SCHEDULES, SCHEDULE_KEY)
    }

    /// Replace the active schedule (last write wins). Returns the stored record.
    pub fn put_schedule(&self, schedule: &Schedule) -> StateResult<Schedule> {
        self.update_schedule(|_| Some(schedule.clone()))?
            .ok_or_else(|| StateError::Write("schedule not stored".to_string()))
    }

    /// Atomically read-modify-write the schedule record.
    ///
    /// `f` sees the current record and returns the replacement, or `None`
    /// to leave it unchanged. The replacement's version is bumped past the
    /// current one. Returns the written record.
    pub fn update_schedule<F>(&self, f: F) -> StateResult<Option<Schedule>>
    where
        F: FnOnce(Option<&Schedule>) -> Option<Schedule>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let written;
        {
            let mut table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            let raw = table
                .get(SCHEDULE_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let current: Option<Schedule> = raw.and_then(|bytes| decode(SCHEDULE_KEY, &bytes));

            written = match f(current.as_ref()) {
                Some(mut next) => {
                    let floor = current.as_ref().map_or(1, |c| c.version + 1);
                    next.version = next.version.max(floor);
                    let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
                    table
                        .insert(SCHEDULE_KEY, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(next)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if let Some(s) = &written {
            debug!(schedule_id = %s.id, state = ?s.state, version = s.version, "schedule stored");
        }
        Ok(written)
    }

    // ── Turndown phase ─────────────────────────────────────────────

    /// Load the persisted manager phase. Missing or unreadable means Normal.
    pub fn get_phase(&self) -> StateResult<TurndownPhase> {
        Ok(self.get_record(TURNDOWN, PHASE_KEY)?.unwrap_or_default())
    }

    pub fn put_phase(&self, phase: TurndownPhase) -> StateResult<()> {
        self.put_record(TURNDOWN, PHASE_KEY, &phase)
    }

    // ── Settings ───────────────────────────────────────────────────

    pub fn get_service_key(&self) -> StateResult<Option<String>> {
        self.get_record(SETTINGS, SERVICE_KEY)
    }

    pub fn put_service_key(&self, key: &str) -> StateResult<()> {
        self.put_record(SETTINGS, SERVICE_KEY, &key)
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn get_record<T: DeserializeOwned>(
        &self,
        table: RecordTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(decode(key, guard.value())),
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(
        &self,
        table: RecordTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "record stored");
        Ok(())
    }

    #[cfg(test)]
    fn put_raw(&self, table: RecordTable, key: &str, raw: &[u8]) {
        let txn = self.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(table).unwrap();
            table.insert(key, raw).unwrap();
        }
        txn.commit().unwrap();
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(%key, error = %e, "unparseable record, treating as absent");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn test_schedule() -> Schedule {
        Schedule::new(now() + Duration::hours(1), now() + Duration::hours(9), Repeat::None, now())
    }

    #[test]
    fn schedule_get_empty_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_schedule().unwrap().is_none());
    }

    #[test]
    fn schedule_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.put_schedule(&test_schedule()).unwrap();
        assert_eq!(stored.version, 1);

        let retrieved = store.get_schedule().unwrap();
        assert_eq!(retrieved, Some(stored));
    }

    #[test]
    fn schedule_put_replaces_and_bumps_version() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.put_schedule(&test_schedule()).unwrap();
        let second = store.put_schedule(&test_schedule()).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.version, 2);
        assert_eq!(store.get_schedule().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn update_schedule_can_decline() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.put_schedule(&test_schedule()).unwrap();

        let written = store.update_schedule(|_| None).unwrap();
        assert!(written.is_none());
        assert_eq!(store.get_schedule().unwrap(), Some(stored));
    }

    #[test]
    fn update_schedule_compare_and_set() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_schedule(&test_schedule()).unwrap();

        let activated = store
            .update_schedule(|current| {
                let s = current?;
                (s.state == ScheduleState::Pending).then(|| s.with_state(ScheduleState::Active, now()))
            })
            .unwrap()
            .unwrap();
        assert_eq!(activated.state, ScheduleState::Active);
        assert_eq!(activated.version, 2);

        // A second Pending -> Active attempt no longer matches.
        let again = store
            .update_schedule(|current| {
                let s = current?;
                (s.state == ScheduleState::Pending).then(|| s.with_state(ScheduleState::Active, now()))
            })
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn unparseable_schedule_is_treated_as_absent() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_raw(SCHEDULES, SCHEDULE_KEY, b"{not json");
        assert!(store.get_schedule().unwrap().is_none());

        // And it can be overwritten.
        store.put_schedule(&test_schedule()).unwrap();
        assert!(store.get_schedule().unwrap().is_some());
    }

    #[test]
    fn phase_defaults_to_normal() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.get_phase().unwrap(), TurndownPhase::Normal);

        store.put_phase(TurndownPhase::TurningDown).unwrap();
        assert_eq!(store.get_phase().unwrap(), TurndownPhase::TurningDown);
    }

    #[test]
    fn service_key_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_service_key().unwrap().is_none());
        store.put_service_key("s3cret").unwrap();
        assert_eq!(store.get_service_key().unwrap().as_deref(), Some("s3cret"));
    }

    #[test]
    fn reopen_reproduces_schedule_and_phase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turndown.redb");

        let stored = {
            let store = StateStore::open(&path).unwrap();
            let s = store.put_schedule(&test_schedule()).unwrap();
            let s = store
                .update_schedule(|_| Some(s.with_state(ScheduleState::Active, now())))
                .unwrap()
                .unwrap();
            store.put_phase(TurndownPhase::TurnedDown).unwrap();
            s
        };

        let store = StateStore::open(&path).unwrap();
        let reloaded = store.get_schedule().unwrap().unwrap();
        assert_eq!(reloaded.start, stored.start);
        assert_eq!(reloaded.end, stored.end);
        assert_eq!(reloaded.state, ScheduleState::Active);
        assert_eq!(reloaded, stored);
        assert_eq!(store.get_phase().unwrap(), TurndownPhase::TurnedDown);
    }
}
