//! TurndownScheduler — turns the persisted schedule into manager calls.
//!
//! The schedule record is the single source of intent. Each boundary is
//! fired by a compare-and-set on the record's state (Pending → Active at
//! the start, Active → Completed at the end), so a boundary fires once no
//! matter how many passes observe it. Boundaries are inclusive. Start and
//! cancel requests take the same lock as an evaluation pass, so a pass
//! never acts on a schedule that is being replaced.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use turndown_manager::TurndownManager;
use turndown_state::{Repeat, Schedule, ScheduleState, StateStore, TurndownPhase};

use crate::error::{SchedulerError, SchedulerResult};

/// A request to turn the cluster down between `start` and `end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub repeat: Repeat,
}

impl ScheduleRequest {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            repeat: Repeat::None,
        }
    }

    /// A window of `duration` starting at `start`.
    pub fn for_duration(start: DateTime<Utc>, duration: chrono::Duration) -> SchedulerResult<Self> {
        let end = start
            .checked_add_signed(duration)
            .ok_or_else(|| SchedulerError::InvalidRange(format!("duration {duration} is out of range")))?;
        Ok(Self::new(start, end))
    }

    pub fn repeating(mut self, repeat: Repeat) -> Self {
        self.repeat = repeat;
        self
    }

    fn validate(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        if self.end <= self.start {
            return Err(SchedulerError::InvalidRange(format!(
                "end {} is not after start {}",
                self.end, self.start
            )));
        }
        if self.end <= now {
            return Err(SchedulerError::InvalidRange(format!(
                "window ending {} is already over",
                self.end
            )));
        }
        Ok(())
    }
}

pub struct TurndownScheduler {
    store: StateStore,
    manager: Arc<TurndownManager>,
    /// Serializes evaluation passes with start and cancel requests.
    eval: Mutex<()>,
}

impl TurndownScheduler {
    pub fn new(store: StateStore, manager: Arc<TurndownManager>) -> Self {
        Self {
            store,
            manager,
            eval: Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &Arc<TurndownManager> {
        &self.manager
    }

    /// The stored schedule, including a finished or cancelled one.
    pub fn current_schedule(&self) -> SchedulerResult<Option<Schedule>> {
        Ok(self.store.get_schedule()?)
    }

    /// Persist a new schedule, replacing any existing one.
    ///
    /// A replaced Active schedule is turned up first. If the window has
    /// already started, the turndown is left to a background evaluation
    /// pass and this call returns without waiting for it.
    pub async fn start_schedule(
        self: &Arc<Self>,
        request: ScheduleRequest,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Schedule> {
        request.validate(now)?;
        let _pass = self.eval.lock().await;

        if let Some(existing) = self.store.get_schedule()? {
            if existing.state == ScheduleState::Active {
                info!(schedule_id = %existing.id, "replacing active schedule, turning cluster up first");
                self.manager.turn_up().await?;
            }
        }

        let mut schedule = Schedule::new(request.start, request.end, request.repeat, now);
        let started = request.start <= now;
        if started {
            schedule.state = ScheduleState::Active;
        }
        let schedule = self.store.put_schedule(&schedule)?;
        info!(
            schedule_id = %schedule.id,
            start = %schedule.start,
            end = %schedule.end,
            repeat = ?schedule.repeat,
            state = ?schedule.state,
            "schedule stored"
        );

        if started {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = scheduler.tick(now).await {
                    error!(error = %e, "turndown for started window failed, will retry");
                }
            });
        }
        Ok(schedule)
    }

    /// Cancel the live schedule, turning the cluster up if it was Active.
    pub async fn cancel_schedule(&self, now: DateTime<Utc>) -> SchedulerResult<Schedule> {
        let _pass = self.eval.lock().await;
        let mut previous = None;
        let cancelled = self
            .store
            .update_schedule(|current| {
                let current = current.filter(|s| s.state.is_live())?;
                previous = Some(current.state);
                Some(current.with_state(ScheduleState::Cancelled, now))
            })?
            .ok_or(SchedulerError::NoSchedule)?;
        info!(schedule_id = %cancelled.id, was = ?previous, "schedule cancelled");

        if previous == Some(ScheduleState::Active) {
            self.manager.turn_up().await?;
        }
        Ok(cancelled)
    }

    /// Evaluate the schedule against `now` and fire any crossed boundary.
    pub async fn tick(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let _pass = self.eval.lock().await;

        let Some(schedule) = self.store.get_schedule()? else {
            return self.restore_if_needed().await;
        };

        match schedule.state {
            ScheduleState::Pending if now >= schedule.end => {
                warn!(schedule_id = %schedule.id, "window passed while the agent was down, skipping it");
                self.advance(&schedule, schedule.after_end(now));
                self.restore_if_needed().await
            }
            ScheduleState::Pending if now >= schedule.start => {
                if self.advance(&schedule, schedule.with_state(ScheduleState::Active, now)) {
                    info!(schedule_id = %schedule.id, "start boundary reached, turning cluster down");
                    self.manager.turn_down().await?;
                }
                Ok(())
            }
            ScheduleState::Active if now >= schedule.end => {
                if self.advance(&schedule, schedule.after_end(now)) {
                    info!(schedule_id = %schedule.id, "end boundary reached, turning cluster up");
                    self.manager.turn_up().await?;
                }
                Ok(())
            }
            ScheduleState::Active => {
                // Inside the window. Resume an interrupted turndown only.
                match self.manager.phase() {
                    TurndownPhase::TurnedDown => Ok(()),
                    phase => {
                        info!(schedule_id = %schedule.id, %phase, "resuming turndown inside active window");
                        self.manager.turn_down().await?;
                        Ok(())
                    }
                }
            }
            ScheduleState::Pending | ScheduleState::Completed | ScheduleState::Cancelled => {
                self.restore_if_needed().await
            }
        }
    }

    /// Compare-and-set the schedule from `expected` to `next`.
    ///
    /// Returns false if the record changed since `expected` was read.
    fn advance(&self, expected: &Schedule, next: Schedule) -> bool {
        let result = self.store.update_schedule(|current| {
            let current = current?;
            (current.id == expected.id && current.version == expected.version).then_some(next)
        });
        match result {
            Ok(Some(written)) => {
                debug!(schedule_id = %written.id, state = ?written.state, version = written.version, "schedule advanced");
                true
            }
            Ok(None) => {
                debug!(schedule_id = %expected.id, "schedule changed concurrently, skipping boundary");
                false
            }
            Err(e) => {
                error!(schedule_id = %expected.id, error = %e, "failed to persist schedule transition");
                false
            }
        }
    }

    /// Outside any active window the cluster belongs in Normal.
    async fn restore_if_needed(&self) -> SchedulerResult<()> {
        let phase = self.manager.phase();
        if phase != TurndownPhase::Normal {
            info!(%phase, "no active window, turning cluster up");
            self.manager.turn_up().await?;
        }
        Ok(())
    }

    /// Run the evaluation loop until `shutdown` changes.
    ///
    /// The first pass runs immediately so a restart picks up where the
    /// previous process stopped.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "turndown scheduler started");

        if let Err(e) = self.tick(Utc::now()).await {
            error!(error = %e, "recovery pass failed");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "schedule evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("turndown scheduler shutting down");
                    break;
                }
            }
        }
    }
}
