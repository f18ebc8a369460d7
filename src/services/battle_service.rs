//! Battle lifecycle orchestration.
//!
//! Every mutating operation runs under the battle's transition gate:
//! load the record, compute the next one with [`state_machine::apply`],
//! persist it, and only then broadcast. A failed write never reaches the hub.

use std::{
    sync::{Arc, Weak},
    time::SystemTime,
};

use futures::future::BoxFuture;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::battle_store::BattleStore,
    dto::battle::CreateBattleRequest,
    error::ServiceError,
    services::{
        access_control::{hash_password, resolve_controller, verify_join_password},
        broadcast_events,
        vote_service::{FinalTally, pick_winner},
    },
    state::{
        AppState, SharedState,
        battle::{
            Battle, BattleConfig, Participant, Phase, Role, Round, RoundUpdate, UserId, Visibility,
        },
        state_machine::{self, BattleEvent, Transition},
        timer::RoundTimerListener,
    },
};

/// Who is closing a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundCloser {
    Controller(UserId),
    /// A countdown of this round reached zero.
    Timeout { round_id: Uuid, timer_id: Uuid },
}

/// Result of a join request.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub battle: Battle,
    pub participant: Participant,
    /// False when the user was already a participant.
    pub created: bool,
}

/// Battle state right after `finish`, with the final standings.
#[derive(Debug, Clone)]
pub struct FinishOutcome {
    pub battle: Battle,
    pub tally: FinalTally,
}

/// Schedule a new battle; `created_by` becomes its moderator.
pub async fn create_battle(
    state: &SharedState,
    created_by: UserId,
    request: CreateBattleRequest,
) -> Result<Battle, ServiceError> {
    request.validate()?;
    let store = state.require_battle_store().await?;

    let password_hash = match (request.visibility, request.password.as_deref()) {
        (Visibility::Private, Some(password)) => Some(hash_password(password)?),
        (Visibility::Private, None) => {
            return Err(ServiceError::InvalidInput(
                "private battles require a password".into(),
            ));
        }
        (Visibility::Public, _) => None,
    };

    let battle = Battle::new(
        BattleConfig {
            title: request.title.trim().to_owned(),
            mode: request.mode,
            max_rounds: request.max_rounds,
            round_duration_secs: request.round_duration_seconds,
            visibility: request.visibility,
            password_hash,
        },
        created_by,
    );
    store.create_battle(battle.clone()).await?;
    store
        .insert_participant(Participant::new(
            battle.id,
            created_by,
            request.username,
            Role::Moderator,
        ))
        .await?;

    info!(battle_id = %battle.id, created_by, mode = ?battle.mode, "battle created");
    Ok(battle)
}

/// Current persisted state of a battle.
pub async fn snapshot(state: &SharedState, battle_id: Uuid) -> Result<Battle, ServiceError> {
    let store = state.require_battle_store().await?;
    load_battle(&store, battle_id).await
}

/// Participants of a battle ordered by role then user.
pub async fn participants(
    state: &SharedState,
    battle_id: Uuid,
) -> Result<Vec<Participant>, ServiceError> {
    let store = state.require_battle_store().await?;
    load_battle(&store, battle_id).await?;
    Ok(store.list_participants(battle_id).await?)
}

/// Take the battle live. Starting a running battle returns it untouched.
pub async fn start(state: &SharedState, battle_id: Uuid, caller: UserId) -> Result<Battle, ServiceError> {
    let store = state.require_battle_store().await?;
    state
        .run_transition(battle_id, || start_locked(state, &store, battle_id, caller))
        .await
}

async fn start_locked(
    state: &SharedState,
    store: &Arc<dyn BattleStore>,
    battle_id: Uuid,
    caller: UserId,
) -> Result<Battle, ServiceError> {
    resolve_controller(store, battle_id, caller).await?;
    let battle = load_battle(store, battle_id).await?;

    match state_machine::apply(&battle, BattleEvent::Start, SystemTime::now())? {
        Transition::Unchanged => {
            debug!(%battle_id, "battle already running");
            Ok(battle)
        }
        Transition::Applied(next) => {
            store.save_battle(next.clone()).await?;
            info!(%battle_id, "battle started");
            broadcast_events::broadcast_state(state, &next);
            broadcast_events::broadcast_started(state, &next);
            Ok(next)
        }
    }
}

/// Open a round and start its countdown.
///
/// `round_number` defaults to the battle's current round and `duration_secs`
/// to the configured round length.
pub async fn start_round(
    state: &SharedState,
    battle_id: Uuid,
    caller: UserId,
    round_number: Option<u32>,
    duration_secs: Option<u32>,
) -> Result<Battle, ServiceError> {
    if duration_secs == Some(0) {
        return Err(ServiceError::InvalidInput(
            "round duration must be at least one second".into(),
        ));
    }
    let store = state.require_battle_store().await?;
    state
        .run_transition(battle_id, || {
            start_round_locked(state, &store, battle_id, caller, round_number, duration_secs)
        })
        .await
}

async fn start_round_locked(
    state: &SharedState,
    store: &Arc<dyn BattleStore>,
    battle_id: Uuid,
    caller: UserId,
    round_number: Option<u32>,
    duration_secs: Option<u32>,
) -> Result<Battle, ServiceError> {
    resolve_controller(store, battle_id, caller).await?;
    let battle = load_battle(store, battle_id).await?;

    let round_number = state_machine::plan_round(&battle, round_number)?;
    let round = store
        .upsert_round(battle_id, round_number, RoundUpdate::default())
        .await?;
    let duration_secs = duration_secs.unwrap_or(battle.round_duration_secs).max(1);

    let event = BattleEvent::RoundStarted {
        round_number,
        round_id: round.id,
        duration_secs,
    };
    let next = applied(&battle, event)?;

    state.timers().stop(battle_id);
    store.save_battle(next.clone()).await?;
    info!(%battle_id, round_number, round_id = %round.id, duration_secs, "round started");
    broadcast_events::broadcast_state(state, &next);
    broadcast_events::broadcast_round_started(state, &next, &round);

    let clock = Arc::new(RoundClock {
        state: Arc::downgrade(state),
        round_id: round.id,
    });
    state.timers().start(battle_id, duration_secs, clock).await;
    Ok(next)
}

/// Pass the floor to the other competitor.
pub async fn next_turn(
    state: &SharedState,
    battle_id: Uuid,
    caller: UserId,
) -> Result<Battle, ServiceError> {
    let store = state.require_battle_store().await?;
    state
        .run_transition(battle_id, || next_turn_locked(state, &store, battle_id, caller))
        .await
}

async fn next_turn_locked(
    state: &SharedState,
    store: &Arc<dyn BattleStore>,
    battle_id: Uuid,
    caller: UserId,
) -> Result<Battle, ServiceError> {
    resolve_controller(store, battle_id, caller).await?;
    let battle = load_battle(store, battle_id).await?;
    let next = applied(&battle, BattleEvent::TurnPassed)?;

    store.save_battle(next.clone()).await?;
    debug!(%battle_id, turn = ?next.current_turn, "turn passed");
    broadcast_events::broadcast_state(state, &next);
    broadcast_events::broadcast_turn_changed(state, &next);
    Ok(next)
}

/// Close the running round on behalf of the moderator.
pub async fn end_round(
    state: &SharedState,
    battle_id: Uuid,
    caller: UserId,
) -> Result<Battle, ServiceError> {
    let store = state.require_battle_store().await?;
    state
        .run_transition(battle_id, || {
            end_round_locked(state, &store, battle_id, RoundCloser::Controller(caller))
        })
        .await
}

/// Close `round_id` because the countdown `timer_id` ran out.
///
/// Does nothing when that round is no longer running or when the countdown
/// has been stopped or replaced by a later start.
async fn end_round_on_timeout(
    state: &SharedState,
    battle_id: Uuid,
    round_id: Uuid,
    timer_id: Uuid,
) -> Result<Battle, ServiceError> {
    let store = state.require_battle_store().await?;
    let closer = RoundCloser::Timeout { round_id, timer_id };
    state
        .run_transition(battle_id, || end_round_locked(state, &store, battle_id, closer))
        .await
}

async fn end_round_locked(
    state: &SharedState,
    store: &Arc<dyn BattleStore>,
    battle_id: Uuid,
    closer: RoundCloser,
) -> Result<Battle, ServiceError> {
    if let RoundCloser::Controller(caller) = closer {
        resolve_controller(store, battle_id, caller).await?;
    }
    let battle = load_battle(store, battle_id).await?;

    if let RoundCloser::Timeout { round_id, timer_id } = closer {
        if !state.timers().is_current(battle_id, timer_id)
            || battle.round_state != Phase::Running
            || battle.active_round_id != Some(round_id)
        {
            debug!(%battle_id, %round_id, %timer_id, "ignoring timeout of a superseded countdown");
            return Ok(battle);
        }
    }

    let ended_round = battle.current_round;
    match state_machine::apply(&battle, BattleEvent::RoundEnded, SystemTime::now())? {
        Transition::Unchanged => Ok(battle),
        Transition::Applied(next) => {
            state.timers().stop(battle_id);
            store.save_battle(next.clone()).await?;
            let auto = matches!(closer, RoundCloser::Timeout { .. });
            info!(%battle_id, round_number = ended_round, auto, "round ended");
            broadcast_events::broadcast_state(state, &next);
            broadcast_events::broadcast_round_ended(state, &next, ended_round, auto);
            Ok(next)
        }
    }
}

/// Close the battle, settle scores and announce the winner.
pub async fn finish(
    state: &SharedState,
    battle_id: Uuid,
    caller: UserId,
) -> Result<FinishOutcome, ServiceError> {
    let store = state.require_battle_store().await?;
    let outcome = state
        .run_transition(battle_id, || finish_locked(state, &store, battle_id, caller))
        .await?;
    if state.release_idle_battle(battle_id) {
        debug!(%battle_id, "no spectators left on finished battle");
    }
    Ok(outcome)
}

async fn finish_locked(
    state: &SharedState,
    store: &Arc<dyn BattleStore>,
    battle_id: Uuid,
    caller: UserId,
) -> Result<FinishOutcome, ServiceError> {
    resolve_controller(store, battle_id, caller).await?;
    let battle = load_battle(store, battle_id).await?;
    let next = applied(&battle, BattleEvent::Finish)?;

    state.timers().stop(battle_id);
    store.save_battle(next.clone()).await?;

    let totals = store.sum_votes(battle_id, None).await?;
    let winner_id = pick_winner(&totals);
    for mut participant in store.list_participants(battle_id).await? {
        let score = totals
            .iter()
            .find(|entry| entry.target_user_id == participant.user_id)
            .map_or(0, |entry| entry.total);
        let is_winner = winner_id == Some(participant.user_id);
        if participant.score != score || participant.is_winner != is_winner {
            participant.score = score;
            participant.is_winner = is_winner;
            store.save_participant(participant).await?;
        }
    }

    info!(%battle_id, winner_id = ?winner_id, "battle finished");
    broadcast_events::broadcast_state(state, &next);
    broadcast_events::broadcast_finished(state, battle_id, winner_id, totals.clone());
    Ok(FinishOutcome {
        battle: next,
        tally: FinalTally { winner_id, totals },
    })
}

/// Attach a backing track to a round, creating the round record if needed.
pub async fn select_beat(
    state: &SharedState,
    battle_id: Uuid,
    caller: UserId,
    round_number: u32,
    beat_url: String,
) -> Result<Round, ServiceError> {
    let store = state.require_battle_store().await?;
    state
        .run_transition(battle_id, || async {
            resolve_controller(&store, battle_id, caller).await?;
            let battle = load_battle(&store, battle_id).await?;
            if round_number == 0 || round_number > battle.max_rounds {
                return Err(ServiceError::InvalidInput(format!(
                    "round {round_number} is out of range (1..={})",
                    battle.max_rounds
                )));
            }

            let round = store
                .upsert_round(
                    battle_id,
                    round_number,
                    RoundUpdate {
                        beat_url: Some(beat_url.clone()),
                        ..RoundUpdate::default()
                    },
                )
                .await?;
            info!(%battle_id, round_number, "beat selected");
            broadcast_events::broadcast_beat_selected(state, battle_id, round_number, &beat_url);
            Ok(round)
        })
        .await
}

/// Join a battle as `role` (viewer by default).
///
/// Users who already joined get their existing seat back. Newcomers to a
/// private battle must present the password.
pub async fn join(
    state: &SharedState,
    battle_id: Uuid,
    user_id: UserId,
    username: String,
    role: Option<Role>,
    password: Option<&str>,
) -> Result<JoinOutcome, ServiceError> {
    let store = state.require_battle_store().await?;
    let battle = load_battle(&store, battle_id).await?;

    if let Some(participant) = store.find_participant(battle_id, user_id).await? {
        return Ok(JoinOutcome {
            battle,
            participant,
            created: false,
        });
    }

    if battle.visibility == Visibility::Private {
        let password = password.ok_or_else(|| {
            ServiceError::Unauthorized("this battle requires a password".into())
        })?;
        verify_join_password(&battle, password)?;
    }

    let role = role.unwrap_or(Role::Viewer);
    state
        .run_transition(battle_id, || async {
            let battle = load_battle(&store, battle_id).await?;
            if role.is_exclusive() && battle.battle_state != Phase::Pending {
                return Err(ServiceError::InvalidState(format!(
                    "role `{}` cannot be assigned once the battle has started",
                    role.as_str()
                )));
            }

            let mut participant = Participant::new(battle_id, user_id, username, role);
            participant.slot_number = match role {
                Role::Mc1 => Some(1),
                Role::Mc2 => Some(2),
                Role::Moderator | Role::Viewer => None,
            };
            store.insert_participant(participant.clone()).await?;

            info!(%battle_id, user_id, role = role.as_str(), "participant joined");
            broadcast_events::broadcast_participant_joined(state, &participant);
            Ok(JoinOutcome {
                battle,
                participant,
                created: true,
            })
        })
        .await
}

/// Delete a battle with everything attached to it. Allowed to its creator and moderator.
pub async fn delete_battle(
    state: &SharedState,
    battle_id: Uuid,
    caller: UserId,
) -> Result<(), ServiceError> {
    let store = state.require_battle_store().await?;
    state
        .run_transition(battle_id, || async {
            let battle = load_battle(&store, battle_id).await?;
            if battle.created_by != caller {
                resolve_controller(&store, battle_id, caller).await?;
            }
            state.timers().stop(battle_id);
            store.delete_battle(battle_id).await?;
            Ok(())
        })
        .await?;

    state.forget_battle(battle_id);
    info!(%battle_id, caller, "battle deleted");
    Ok(())
}

/// Persist and broadcast the seconds left on the running round.
async fn record_tick(
    state: &SharedState,
    battle_id: Uuid,
    round_id: Uuid,
    timer_id: Uuid,
    remaining: u32,
) -> Result<(), ServiceError> {
    let store = state.require_battle_store().await?;
    state
        .run_transition(battle_id, || async {
            let Some(mut battle) = store.find_battle(battle_id).await? else {
                return Ok(());
            };
            if !state.timers().is_current(battle_id, timer_id)
                || battle.round_state != Phase::Running
                || battle.active_round_id != Some(round_id)
                || remaining >= battle.round_time_remaining
            {
                debug!(%battle_id, %round_id, remaining, "dropping stale tick");
                return Ok(());
            }

            battle.round_time_remaining = remaining;
            battle.updated_at = SystemTime::now();
            store.save_battle(battle).await?;
            broadcast_events::broadcast_round_tick(state, battle_id, remaining);
            Ok(())
        })
        .await
}

/// Countdown callbacks of one round, bound to the round they were started for.
struct RoundClock {
    state: Weak<AppState>,
    round_id: Uuid,
}

impl RoundTimerListener for RoundClock {
    fn on_tick(
        &self,
        battle_id: Uuid,
        timer_id: Uuid,
        remaining: u32,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        let state = self.state.clone();
        let round_id = self.round_id;
        Box::pin(async move {
            let Some(state) = state.upgrade() else {
                return Ok(());
            };
            record_tick(&state, battle_id, round_id, timer_id, remaining).await
        })
    }

    fn on_timeout(
        &self,
        battle_id: Uuid,
        timer_id: Uuid,
    ) -> BoxFuture<'static, Result<(), ServiceError>> {
        let state = self.state.clone();
        let round_id = self.round_id;
        Box::pin(async move {
            let Some(state) = state.upgrade() else {
                return Ok(());
            };
            end_round_on_timeout(&state, battle_id, round_id, timer_id).await?;
            Ok(())
        })
    }
}

async fn load_battle(store: &Arc<dyn BattleStore>, battle_id: Uuid) -> Result<Battle, ServiceError> {
    store
        .find_battle(battle_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("battle `{battle_id}` not found")))
}

fn applied(battle: &Battle, event: BattleEvent) -> Result<Battle, ServiceError> {
    match state_machine::apply(battle, event, SystemTime::now())? {
        Transition::Applied(next) => Ok(next),
        Transition::Unchanged => Ok(battle.clone()),
    }
}
