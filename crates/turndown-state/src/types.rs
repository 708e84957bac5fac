//! Persisted domain types: the turndown schedule and the manager phase.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a [`Schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// Waiting for the start boundary.
    Pending,
    /// Start boundary crossed; the cluster is (being) turned down.
    Active,
    /// End boundary crossed; the cluster was turned back up.
    Completed,
    /// Cancelled by an operator.
    Cancelled,
}

impl ScheduleState {
    /// Pending and Active schedules still have boundaries to fire.
    pub fn is_live(&self) -> bool {
        matches!(self, ScheduleState::Pending | ScheduleState::Active)
    }
}

/// How a schedule recurs once its window ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    #[default]
    None,
    Daily,
    Weekly,
}

impl Repeat {
    fn period(&self) -> Option<Duration> {
        match self {
            Repeat::None => None,
            Repeat::Daily => Some(Duration::days(1)),
            Repeat::Weekly => Some(Duration::weeks(1)),
        }
    }
}

/// The single persisted turndown intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub repeat: Repeat,
    pub state: ScheduleState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl Schedule {
    /// Create a pending schedule. The caller validates the range.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, repeat: Repeat, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            start,
            end,
            repeat,
            state: ScheduleState::Pending,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Copy of this schedule in `state`, stamped at `now`.
    pub fn with_state(&self, state: ScheduleState, now: DateTime<Utc>) -> Self {
        Self {
            state,
            updated_at: now,
            ..self.clone()
        }
    }

    /// The next window of a repeating schedule whose end lies after `now`.
    ///
    /// Returns `None` for one-shot schedules.
    pub fn next_window(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let period = self.repeat.period()?;
        let (mut start, mut end) = (self.start + period, self.end + period);
        if end <= now {
            // Skip whole periods missed while the agent was down.
            let behind = (now - end).num_seconds() / period.num_seconds() + 1;
            start += period * behind as i32;
            end += period * behind as i32;
        }
        Some((start, end))
    }

    /// Where this schedule goes after its end boundary fires.
    pub fn after_end(&self, now: DateTime<Utc>) -> Self {
        match self.next_window(now) {
            Some((start, end)) => Self {
                start,
                end,
                state: ScheduleState::Pending,
                updated_at: now,
                ..self.clone()
            },
            None => self.with_state(ScheduleState::Completed, now),
        }
    }
}

/// Phase of the turndown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurndownPhase {
    #[default]
    Normal,
    TurningDown,
    TurnedDown,
    TurningUp,
}

impl std::fmt::Display for TurndownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurndownPhase::Normal => "normal",
            TurndownPhase::TurningDown => "turning_down",
            TurndownPhase::TurnedDown => "turned_down",
            TurndownPhase::TurningUp => "turning_up",
        };
        f.write_str(s)
    }
}
