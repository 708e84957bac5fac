//! TurndownManager — the turndown state machine.
//!
//! Phases move Normal → TurningDown → TurnedDown on `turn_down` and
//! TurnedDown → TurningUp → Normal on `turn_up`. One transition runs at a
//! time: a call for the opposite direction waits behind the one in flight,
//! a call for the same direction returns immediately. A failed transition
//! leaves the phase at TurningDown/TurningUp so the next call resumes it.
//!
//! The phase is persisted on every change and reloaded at construction.

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use turndown_state::{StateStore, TurndownPhase};

use crate::error::{ManagerError, ManagerResult, Transition};
use crate::strategy::{AgentHost, TurndownStrategy};

pub struct TurndownManager {
    strategy: Arc<dyn TurndownStrategy>,
    store: StateStore,
    host: AgentHost,
    phase: RwLock<TurndownPhase>,
    /// Direction of the transition currently running, if any.
    in_flight: Mutex<Option<Transition>>,
    /// Held for the whole of a transition.
    guard: AsyncMutex<()>,
}

impl TurndownManager {
    pub fn new(strategy: Arc<dyn TurndownStrategy>, store: StateStore, host: AgentHost) -> ManagerResult<Self> {
        let phase = store.get_phase()?;
        info!(%phase, node = %host.node_name, strategy = strategy.name(), "turndown manager ready");
        Ok(Self {
            strategy,
            store,
            host,
            phase: RwLock::new(phase),
            in_flight: Mutex::new(None),
            guard: AsyncMutex::new(()),
        })
    }

    pub fn phase(&self) -> TurndownPhase {
        *self.phase.read().expect("phase lock")
    }

    /// The node this agent runs on.
    pub fn node_name(&self) -> &str {
        &self.host.node_name
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Scale the cluster down. A no-op when already turned down.
    pub async fn turn_down(&self) -> ManagerResult<()> {
        self.transition(Transition::TurnDown).await
    }

    /// Scale the cluster back up. A no-op when already normal.
    pub async fn turn_up(&self) -> ManagerResult<()> {
        self.transition(Transition::TurnUp).await
    }

    async fn transition(&self, transition: Transition) -> ManagerResult<()> {
        let (working, done) = match transition {
            Transition::TurnDown => (TurndownPhase::TurningDown, TurndownPhase::TurnedDown),
            Transition::TurnUp => (TurndownPhase::TurningUp, TurndownPhase::Normal),
        };

        if *self.in_flight.lock().expect("in-flight lock") == Some(transition) {
            debug!(%transition, "transition already in flight");
            return Ok(());
        }

        let _guard = self.guard.lock().await;
        if self.phase() == done {
            debug!(%transition, phase = %done, "already in target phase");
            return Ok(());
        }

        *self.in_flight.lock().expect("in-flight lock") = Some(transition);
        let result = self.drive(transition, working, done).await;
        *self.in_flight.lock().expect("in-flight lock") = None;
        result
    }

    async fn drive(&self, transition: Transition, working: TurndownPhase, done: TurndownPhase) -> ManagerResult<()> {
        self.set_phase(working)?;

        let outcome = match transition {
            Transition::TurnDown => self.strategy.turn_down(&self.host).await,
            Transition::TurnUp => self.strategy.turn_up(&self.host).await,
        };

        match outcome {
            Ok(()) => self.set_phase(done),
            Err(source) => {
                warn!(%transition, phase = %working, error = %source, "transition failed, phase kept");
                Err(ManagerError::Transition { transition, source })
            }
        }
    }

    fn set_phase(&self, next: TurndownPhase) -> ManagerResult<()> {
        let previous = self.phase();
        if previous == next {
            return Ok(());
        }
        self.store.put_phase(next)?;
        *self.phase.write().expect("phase lock") = next;
        info!(from = %previous, to = %next, "turndown phase changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use turndown_core::{NodePool, ProviderKind};
    use turndown_provider::testing::{FakeKube, FakeProvider};
    use turndown_provider::PollPolicy;

    use crate::strategy::strategy_for;

    fn host() -> AgentHost {
        AgentHost {
            node_name: "worker-1".to_string(),
            namespace: "turndown".to_string(),
            deployment: "cluster-turndown".to_string(),
        }
    }

    fn setup(kind: ProviderKind) -> (Arc<FakeProvider>, StateStore, TurndownManager) {
        let provider = Arc::new(
            FakeProvider::new(kind)
                .with_pool(NodePool::new("workers", 3, 3))
                .with_pool(NodePool::new("batch", 2, 2)),
        );
        let poll = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(60));
        let strategy = strategy_for(provider.clone(), Arc::new(FakeKube::new()), poll);
        let store = StateStore::open_in_memory().unwrap();
        let manager = TurndownManager::new(strategy, store.clone(), host()).unwrap();
        (provider, store, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn turn_down_then_up() {
        let (provider, store, manager) = setup(ProviderKind::Gke);
        assert_eq!(manager.phase(), TurndownPhase::Normal);

        manager.turn_down().await.unwrap();
        assert_eq!(manager.phase(), TurndownPhase::TurnedDown);
        assert_eq!(store.get_phase().unwrap(), TurndownPhase::TurnedDown);
        assert_eq!(provider.set_calls(), vec![(vec!["workers".to_string(), "batch".to_string()], 0)]);

        manager.turn_up().await.unwrap();
        assert_eq!(manager.phase(), TurndownPhase::Normal);
        assert_eq!(provider.reset_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_calls_are_no_ops() {
        let (provider, _store, manager) = setup(ProviderKind::Gke);

        manager.turn_up().await.unwrap();
        assert!(provider.reset_calls().is_empty());

        manager.turn_down().await.unwrap();
        manager.turn_down().await.unwrap();
        manager.turn_down().await.unwrap();
        assert_eq!(provider.set_calls().len(), 1);
        assert_eq!(provider.singleton_creations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_phase_in_progress_and_retry_resumes() {
        let (provider, store, manager) = setup(ProviderKind::Gke);
        provider.set_stuck(true);

        let err = manager.turn_down().await.unwrap_err();
        match &err {
            ManagerError::Transition { transition, source } => {
                assert_eq!(*transition, Transition::TurnDown);
                assert!(source.is_timeout());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(manager.phase(), TurndownPhase::TurningDown);
        assert_eq!(store.get_phase().unwrap(), TurndownPhase::TurningDown);

        // The nodes finally drain; the retry finishes without resizing again.
        provider.set_stuck(false);
        provider.converge();
        manager.turn_down().await.unwrap();
        assert_eq!(manager.phase(), TurndownPhase::TurnedDown);
        assert_eq!(provider.set_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_resize_is_annotated_with_transition() {
        let (provider, _store, manager) = setup(ProviderKind::Gke);
        manager.turn_down().await.unwrap();
        provider.set_fail_resize(true);

        let err = manager.turn_up().await.unwrap_err();
        assert!(err.to_string().contains("turn up"));
        assert!(!err.is_relocation_pending());
        assert_eq!(manager.phase(), TurndownPhase::TurningUp);

        provider.set_fail_resize(false);
        manager.turn_up().await.unwrap();
        assert_eq!(manager.phase(), TurndownPhase::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn relocation_pending_keeps_turning_down() {
        let (provider, _store, manager) = setup(ProviderKind::Aws);

        let err = manager.turn_down().await.unwrap_err();
        assert!(err.is_relocation_pending());
        assert_eq!(manager.phase(), TurndownPhase::TurningDown);

        provider.set_on_singleton(true);
        manager.turn_down().await.unwrap();
        assert_eq!(manager.phase(), TurndownPhase::TurnedDown);
    }

    #[tokio::test(start_paused = true)]
    async fn phase_is_reloaded_from_store() {
        let (provider, store, manager) = setup(ProviderKind::Gke);
        manager.turn_down().await.unwrap();
        drop(manager);

        let poll = PollPolicy::default();
        let strategy = strategy_for(provider, Arc::new(FakeKube::new()), poll);
        let restarted = TurndownManager::new(strategy, store, host()).unwrap();
        assert_eq!(restarted.phase(), TurndownPhase::TurnedDown);
    }

    #[tokio::test(start_paused = true)]
    async fn opposite_direction_queues_behind_in_flight_transition() {
        let (provider, _store, manager) = setup(ProviderKind::Gke);
        let manager = Arc::new(manager);
        // Resizes are accepted but nodes stay until converge() runs.
        provider.set_stuck(true);

        let down = tokio::spawn({
            let manager = manager.clone();
            async move { manager.turn_down().await }
        });
        // Let the turndown start polling.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(manager.phase(), TurndownPhase::TurningDown);

        // Same direction while in flight: immediate no-op.
        manager.turn_down().await.unwrap();

        let up = tokio::spawn({
            let manager = manager.clone();
            async move { manager.turn_up().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.phase(), TurndownPhase::TurningDown);

        provider.set_stuck(false);
        provider.converge();
        down.await.unwrap().unwrap();
        up.await.unwrap().unwrap();

        assert_eq!(manager.phase(), TurndownPhase::Normal);
        assert_eq!(provider.set_calls().len(), 1);
        assert_eq!(provider.reset_calls().len(), 1);
    }
}
