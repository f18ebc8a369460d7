pub mod battle;
pub mod hub;
pub mod state_machine;
pub mod timer;

use std::{future::Future, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::battle_store::BattleStore,
    error::ServiceError,
    state::{battle::UserId, hub::BroadcastHub, timer::RoundTimerScheduler},
};

pub type SharedState = Arc<AppState>;

#[derive(Clone)]
/// Handle used to push frames to one identified WebSocket connection.
pub struct SessionConnection {
    pub connection_id: Uuid,
    pub tx: mpsc::UnboundedSender<Message>,
}

/// Central application state: storage handle, battle topics, round timers and live sockets.
pub struct AppState {
    battle_store: RwLock<Option<Arc<dyn BattleStore>>>,
    degraded: watch::Sender<bool>,
    hub: BroadcastHub,
    timers: RoundTimerScheduler,
    sessions: DashMap<(Uuid, UserId), SessionConnection>,
    gates: DashMap<Uuid, Arc<Mutex<()>>>,
    config: Arc<AppConfig>,
    transition_timeout: Option<Duration>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig) -> SharedState {
        Arc::new(Self::build(config, None))
    }

    /// Construct a state with `store` already installed.
    pub fn with_store(config: AppConfig, store: Arc<dyn BattleStore>) -> SharedState {
        Arc::new(Self::build(config, Some(store)))
    }

    fn build(config: AppConfig, store: Option<Arc<dyn BattleStore>>) -> Self {
        let (degraded_tx, _rx) = watch::channel(store.is_none());
        Self {
            battle_store: RwLock::new(store),
            degraded: degraded_tx,
            hub: BroadcastHub::new(config.hub_capacity),
            timers: RoundTimerScheduler::new(config.tick_interval()),
            sessions: DashMap::new(),
            gates: DashMap::new(),
            transition_timeout: config.transition_timeout(),
            config: Arc::new(config),
        }
    }

    /// Obtain a handle to the current battle store, if one is installed.
    pub async fn battle_store(&self) -> Option<Arc<dyn BattleStore>> {
        let guard = self.battle_store.read().await;
        guard.as_ref().cloned()
    }

    /// Current battle store or [`ServiceError::Degraded`].
    pub async fn require_battle_store(&self) -> Result<Arc<dyn BattleStore>, ServiceError> {
        self.battle_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new battle store implementation and leave degraded mode.
    pub async fn install_battle_store(&self, store: Arc<dyn BattleStore>) {
        {
            let mut guard = self.battle_store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current battle store and enter degraded mode.
    pub async fn clear_battle_store(&self) {
        {
            let mut guard = self.battle_store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub async fn is_degraded(&self) -> bool {
        let guard = self.battle_store.read().await;
        guard.is_none()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn timers(&self) -> &RoundTimerScheduler {
        &self.timers
    }

    /// Identified sockets keyed by the battle they joined and their user.
    pub fn sessions(&self) -> &DashMap<(Uuid, UserId), SessionConnection> {
        &self.sessions
    }

    pub fn config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    /// Run `work` as the only transition in flight for `battle_id`.
    ///
    /// Transitions on different battles never wait on each other. The work is
    /// bounded by the configured transition timeout.
    pub async fn run_transition<F, Fut, T>(&self, battle_id: Uuid, work: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let gate = self.battle_gate(battle_id);
        let _guard = gate.lock().await;

        match self.transition_timeout {
            Some(limit) => match timeout(limit, work()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(%battle_id, limit_ms = limit.as_millis() as u64, "battle transition timed out");
                    Err(ServiceError::Timeout)
                }
            },
            None => work().await,
        }
    }

    /// Drop the topic and transition gate of `battle_id` once nobody uses them.
    ///
    /// The gate is only removed while no transition holds or awaits it, so a
    /// later transition starts from a fresh gate without overlapping an old one.
    pub fn release_idle_battle(&self, battle_id: Uuid) -> bool {
        if !self.hub.prune(battle_id) {
            return false;
        }
        self.gates
            .remove_if(&battle_id, |_, gate| Arc::strong_count(gate) == 1);
        true
    }

    /// Release per-battle resources once a battle is gone.
    pub fn forget_battle(&self, battle_id: Uuid) {
        self.timers.stop(battle_id);
        self.hub.close(battle_id);
        self.gates.remove(&battle_id);
        self.sessions.retain(|(joined, _), _| *joined != battle_id);
    }

    fn battle_gate(&self, battle_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(
            self.gates
                .entry(battle_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Update and broadcast the degraded flag when the value changes.
    fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::dao::battle_store::memory::MemoryBattleStore;

    #[tokio::test]
    async fn degraded_until_a_store_is_installed() {
        let state = AppState::new(AppConfig::default());
        let mut watcher = state.degraded_watcher();
        assert!(state.is_degraded().await);
        assert!(matches!(
            state.require_battle_store().await,
            Err(ServiceError::Degraded)
        ));

        state
            .install_battle_store(Arc::new(MemoryBattleStore::new()))
            .await;
        watcher.changed().await.unwrap();
        assert!(!*watcher.borrow());
        assert!(!state.is_degraded().await);
    }

    #[tokio::test]
    async fn transitions_on_one_battle_are_serialised() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryBattleStore::new()));
        let battle = Uuid::new_v4();
        let counter = Arc::new(AtomicU32::new(0));

        let tasks = (0..8).map(|_| {
            let state = Arc::clone(&state);
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                state
                    .run_transition(battle, || async {
                        let seen = counter.load(Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        counter.store(seen + 1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            })
        });
        for task in tasks.collect::<Vec<_>>() {
            task.await.unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_transitions_time_out() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryBattleStore::new()));
        let outcome: Result<(), ServiceError> = state
            .run_transition(Uuid::new_v4(), || std::future::pending())
            .await;
        assert!(matches!(outcome, Err(ServiceError::Timeout)));
    }

    #[tokio::test]
    async fn idle_battles_release_their_topic_and_gate() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryBattleStore::new()));
        let battle = Uuid::new_v4();
        state.run_transition(battle, || async { Ok(()) }).await.unwrap();
        let receiver = state.hub().subscribe(battle);
        assert_eq!(state.gates.len(), 1);

        assert!(!state.release_idle_battle(battle));
        assert_eq!(state.gates.len(), 1);

        drop(receiver);
        assert!(state.release_idle_battle(battle));
        assert!(state.gates.is_empty());
        assert_eq!(state.hub().subscriber_count(battle), 0);
    }

    #[tokio::test]
    async fn held_gates_survive_release() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryBattleStore::new()));
        let battle = Uuid::new_v4();
        drop(state.hub().subscribe(battle));
        let gate = state.battle_gate(battle);
        let _guard = gate.lock().await;

        assert!(state.release_idle_battle(battle));
        assert_eq!(state.gates.len(), 1);
    }
}
