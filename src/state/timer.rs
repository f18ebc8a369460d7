//! Per-battle round countdowns.
//!
//! The scheduler owns one [`TimerHandle`] per battle with an active round and
//! drives it from a dedicated Tokio task. Starting a countdown for a battle that
//! already has one replaces it, so at most one handle exists per battle.
//!
//! Every countdown carries a timer id. The id stays current from `start` until
//! the next `start` or `stop` for the same battle, including while the final
//! tick and the timeout callback run after the handle was torn down. Listeners
//! check [`RoundTimerScheduler::is_current`] to drop callbacks of a countdown
//! that has been superseded.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServiceError;

/// Callbacks fired by a running countdown.
pub trait RoundTimerListener: Send + Sync {
    /// Called once per elapsed period with the seconds left, down to and including zero.
    fn on_tick(
        &self,
        battle_id: Uuid,
        timer_id: Uuid,
        remaining: u32,
    ) -> BoxFuture<'static, Result<(), ServiceError>>;
    /// Called at most once per countdown, after the final tick.
    fn on_timeout(&self, battle_id: Uuid, timer_id: Uuid)
    -> BoxFuture<'static, Result<(), ServiceError>>;
}

/// Engine-internal countdown state for one battle.
struct TimerHandle {
    id: Uuid,
    remaining: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

/// Registry of round countdowns keyed by battle id.
pub struct RoundTimerScheduler {
    timers: Arc<DashMap<Uuid, TimerHandle>>,
    /// Id of the latest countdown started and not stopped, per battle.
    current: DashMap<Uuid, Uuid>,
    period: Duration,
}

impl RoundTimerScheduler {
    /// Build a scheduler ticking every `period` (one second in production).
    pub fn new(period: Duration) -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            current: DashMap::new(),
            period,
        }
    }

    /// Start counting down `duration_secs` for `battle_id`.
    ///
    /// A zero duration fires `on_timeout` in place and creates no handle.
    /// Returns the id of the new countdown.
    pub async fn start(
        &self,
        battle_id: Uuid,
        duration_secs: u32,
        listener: Arc<dyn RoundTimerListener>,
    ) -> Uuid {
        self.stop(battle_id);

        let id = Uuid::new_v4();
        self.current.insert(battle_id, id);
        if duration_secs == 0 {
            if let Err(err) = listener.on_timeout(battle_id, id).await {
                warn!(%battle_id, error = %err, "round timeout callback failed");
            }
            self.current.remove_if(&battle_id, |_, current| *current == id);
            return id;
        }

        let remaining = Arc::new(AtomicU32::new(duration_secs));
        let task = tokio::spawn(run_countdown(
            Arc::clone(&self.timers),
            battle_id,
            id,
            self.period,
            Arc::clone(&remaining),
            listener,
        ));

        // The task cannot remove its own entry before the first period elapses,
        // so the insert below always happens first.
        self.timers.insert(
            battle_id,
            TimerHandle {
                id,
                remaining,
                task,
            },
        );
        info!(%battle_id, duration_secs, "round timer started");
        id
    }

    /// Stop and forget the countdown for `battle_id`, if any.
    ///
    /// Callbacks of that countdown still in flight stop being current.
    pub fn stop(&self, battle_id: Uuid) {
        self.current.remove(&battle_id);
        if let Some((_, handle)) = self.timers.remove(&battle_id) {
            handle.task.abort();
            debug!(%battle_id, timer_id = %handle.id, "round timer stopped");
        }
    }

    /// Whether a countdown exists for `battle_id`.
    pub fn is_active(&self, battle_id: Uuid) -> bool {
        self.timers.contains_key(&battle_id)
    }

    /// Seconds left on the countdown for `battle_id`.
    pub fn remaining(&self, battle_id: Uuid) -> Option<u32> {
        self.timers
            .get(&battle_id)
            .map(|handle| handle.remaining.load(Ordering::SeqCst))
    }

    /// Whether `timer_id` is still the countdown in charge of `battle_id`.
    pub fn is_current(&self, battle_id: Uuid, timer_id: Uuid) -> bool {
        self.current
            .get(&battle_id)
            .is_some_and(|current| *current == timer_id)
    }

    /// Number of battles with a running countdown.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for RoundTimerScheduler {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.task.abort();
        }
    }
}

/// Clears the processing flag even if the callback future is dropped mid-flight.
struct ProcessingGuard(Arc<AtomicBool>);

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn run_countdown(
    timers: Arc<DashMap<Uuid, TimerHandle>>,
    battle_id: Uuid,
    id: Uuid,
    period: Duration,
    remaining: Arc<AtomicU32>,
    listener: Arc<dyn RoundTimerListener>,
) {
    let processing = Arc::new(AtomicBool::new(false));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%battle_id, "previous tick still processing; skipping");
            continue;
        }
        let guard = ProcessingGuard(Arc::clone(&processing));

        let left = remaining.load(Ordering::SeqCst).saturating_sub(1);
        remaining.store(left, Ordering::SeqCst);

        if left > 0 {
            if let Err(err) = listener.on_tick(battle_id, id, left).await {
                warn!(%battle_id, remaining = left, error = %err, "round tick callback failed");
            }
            drop(guard);
            continue;
        }

        // Tear the handle down before notifying so a concurrent start/stop
        // never sees a finished countdown.
        timers.remove_if(&battle_id, |_, handle| handle.id == id);
        info!(%battle_id, "round timer elapsed");

        if let Err(err) = listener.on_tick(battle_id, id, 0).await {
            warn!(%battle_id, remaining = 0, error = %err, "round tick callback failed");
        }
        if let Err(err) = listener.on_timeout(battle_id, id).await {
            warn!(%battle_id, error = %err, "round timeout callback failed");
        }
        drop(guard);
        return;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ticks: Mutex<Vec<u32>>,
        timeouts: AtomicU32,
        fail_ticks: bool,
    }

    impl RoundTimerListener for Recorder {
        fn on_tick(
            &self,
            _battle_id: Uuid,
            _timer_id: Uuid,
            remaining: u32,
        ) -> BoxFuture<'static, Result<(), ServiceError>> {
            self.ticks.lock().unwrap().push(remaining);
            let fail = self.fail_ticks;
            Box::pin(async move {
                if fail {
                    Err(ServiceError::InvalidState("tick write failed".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn on_timeout(
            &self,
            _battle_id: Uuid,
            _timer_id: Uuid,
        ) -> BoxFuture<'static, Result<(), ServiceError>> {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn scheduler() -> RoundTimerScheduler {
        RoundTimerScheduler::new(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn counts_down_to_zero_and_times_out_once() {
        let scheduler = scheduler();
        let recorder = Arc::new(Recorder::default());
        let battle_id = Uuid::new_v4();

        scheduler.start(battle_id, 5, recorder.clone()).await;
        assert!(scheduler.is_active(battle_id));

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(*recorder.ticks.lock().unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_active(battle_id));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_times_out_without_handle() {
        let scheduler = scheduler();
        let recorder = Arc::new(Recorder::default());
        let battle_id = Uuid::new_v4();

        scheduler.start(battle_id, 0, recorder.clone()).await;

        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);
        assert!(recorder.ticks.lock().unwrap().is_empty());
        assert!(!scheduler.is_active(battle_id));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_ticks_and_timeout() {
        let scheduler = scheduler();
        let recorder = Arc::new(Recorder::default());
        let battle_id = Uuid::new_v4();

        scheduler.start(battle_id, 60, recorder.clone()).await;
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(scheduler.remaining(battle_id), Some(45));

        scheduler.stop(battle_id);
        scheduler.stop(battle_id);
        let seen = recorder.ticks.lock().unwrap().len();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(recorder.ticks.lock().unwrap().len(), seen);
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_active(battle_id));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_keeps_a_single_handle() {
        let scheduler = scheduler();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let battle_id = Uuid::new_v4();

        scheduler.start(battle_id, 3, first.clone()).await;
        scheduler.start(battle_id, 3, second.clone()).await;
        assert_eq!(scheduler.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(first.ticks.lock().unwrap().is_empty());
        assert_eq!(first.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(*second.ticks.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(second.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_id_stays_current_until_replaced_or_stopped() {
        let scheduler = scheduler();
        let battle_id = Uuid::new_v4();

        let first = scheduler.start(battle_id, 1, Arc::new(Recorder::default())).await;
        assert!(scheduler.is_current(battle_id, first));

        // Torn down by its final tick, but nobody replaced it yet.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!scheduler.is_active(battle_id));
        assert!(scheduler.is_current(battle_id, first));

        let second = scheduler.start(battle_id, 30, Arc::new(Recorder::default())).await;
        assert!(!scheduler.is_current(battle_id, first));
        assert!(scheduler.is_current(battle_id, second));

        scheduler.stop(battle_id);
        assert!(!scheduler.is_current(battle_id, second));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_tick_does_not_kill_the_loop() {
        let scheduler = scheduler();
        let recorder = Arc::new(Recorder {
            fail_ticks: true,
            ..Recorder::default()
        });
        let battle_id = Uuid::new_v4();

        scheduler.start(battle_id, 3, recorder.clone()).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*recorder.ticks.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn battles_are_independent() {
        let scheduler = scheduler();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let (battle_a, battle_b) = (Uuid::new_v4(), Uuid::new_v4());

        scheduler.start(battle_a, 2, a.clone()).await;
        scheduler.start(battle_b, 10, b.clone()).await;
        assert_eq!(scheduler.active_count(), 2);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(!scheduler.is_active(battle_a));
        assert!(scheduler.is_active(battle_b));
        assert_eq!(scheduler.remaining(battle_b), Some(7));
    }
}
