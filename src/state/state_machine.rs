//! Pure transition table for the battle and round lifecycle.
//!
//! Nothing in here performs I/O: callers load the battle, ask for the next
//! record, persist it and only then broadcast it.

use std::time::SystemTime;

use thiserror::Error;
use uuid::Uuid;

use crate::state::battle::{Battle, BattleStatus, Phase, Turn};

/// Events that can be applied to a battle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleEvent {
    /// Controller starts the battle.
    Start,
    /// A round begins; the round record has already been upserted.
    RoundStarted {
        /// Round number being played.
        round_number: u32,
        /// Identifier of the upserted round record.
        round_id: Uuid,
        /// Countdown length in seconds.
        duration_secs: u32,
    },
    /// The floor passes to the other competitor.
    TurnPassed,
    /// The running round ends, manually or on timeout.
    RoundEnded,
    /// Controller closes the battle.
    Finish,
}

/// Why an event cannot be applied to the battle as it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The battle has not been started.
    #[error("start battle first")]
    NotStarted,
    /// The battle is already over.
    #[error("battle already finished")]
    AlreadyFinished,
    /// A round is in progress.
    #[error("round already running")]
    RoundAlreadyRunning,
    /// No round is in progress.
    #[error("no round is running")]
    RoundNotRunning,
    /// Requested round number is outside `1..=max_rounds`.
    #[error("round {requested} is out of range (1..={max})")]
    RoundOutOfRange {
        /// Requested round number.
        requested: u32,
        /// Configured round count.
        max: u32,
    },
}

/// Error returned when an event cannot be applied from the current phases.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} while battle {battle_state:?} / round {round_state:?}: {reason}")]
pub struct InvalidTransition {
    /// Battle phase at the time of the attempt.
    pub battle_state: Phase,
    /// Round phase at the time of the attempt.
    pub round_state: Phase,
    /// Rejected event.
    pub event: BattleEvent,
    /// Reason for the rejection.
    pub reason: Rejection,
}

/// Outcome of a valid event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The record changed and must be persisted then broadcast.
    Applied(Battle),
    /// The event is idempotent in the current phase; nothing to write.
    Unchanged,
}

/// Resolve and validate the round a `RoundStarted` event would target, before
/// the round record is upserted.
pub fn plan_round(battle: &Battle, requested: Option<u32>) -> Result<u32, InvalidTransition> {
    let round_number = requested.unwrap_or(battle.current_round);
    let planned = BattleEvent::RoundStarted {
        round_number,
        round_id: Uuid::nil(),
        duration_secs: battle.round_duration_secs,
    };
    check_round_start(battle, round_number).map_err(|reason| reject(battle, planned, reason))?;
    Ok(round_number)
}

/// Compute the next battle record for `event`.
pub fn apply(
    battle: &Battle,
    event: BattleEvent,
    now: SystemTime,
) -> Result<Transition, InvalidTransition> {
    let mut next = battle.clone();

    match (battle.battle_state, battle.round_state, event) {
        (Phase::Finished, _, BattleEvent::Start) => {
            return Err(reject(battle, event, Rejection::AlreadyFinished));
        }
        (Phase::Running, _, BattleEvent::Start) => return Ok(Transition::Unchanged),
        (Phase::Pending, _, BattleEvent::Start) => {
            next.status = BattleStatus::Live;
            next.battle_state = Phase::Running;
            next.started_at.get_or_insert(now);
            next.current_round = 1;
            next.current_turn = Some(Turn::Mc1);
            next.round_time_remaining = battle.round_duration_secs;
        }
        (
            _,
            _,
            BattleEvent::RoundStarted {
                round_number,
                round_id,
                duration_secs,
            },
        ) => {
            check_round_start(battle, round_number).map_err(|reason| reject(battle, event, reason))?;
            next.round_state = Phase::Running;
            next.current_round = round_number;
            next.current_turn = Some(Turn::Mc1);
            next.round_time_remaining = duration_secs;
            next.round_started_at = Some(now);
            next.active_round_id = Some(round_id);
        }
        (_, Phase::Running, BattleEvent::TurnPassed) => {
            next.current_turn = Some(Turn::alternate(battle.current_turn));
        }
        (_, _, BattleEvent::TurnPassed) => {
            return Err(reject(battle, event, Rejection::RoundNotRunning));
        }
        (_, Phase::Finished, BattleEvent::RoundEnded) => return Ok(Transition::Unchanged),
        (Phase::Running, _, BattleEvent::RoundEnded) => {
            next.round_state = Phase::Finished;
            next.current_turn = None;
            next.round_time_remaining = 0;
            if battle.current_round < battle.max_rounds {
                next.current_round = battle.current_round + 1;
            }
        }
        (_, _, BattleEvent::RoundEnded) => {
            return Err(reject(battle, event, Rejection::NotStarted));
        }
        (Phase::Finished, _, BattleEvent::Finish) => {
            return Err(reject(battle, event, Rejection::AlreadyFinished));
        }
        (_, _, BattleEvent::Finish) => {
            next.status = BattleStatus::Finished;
            next.battle_state = Phase::Finished;
            next.round_state = Phase::Finished;
            next.current_turn = None;
            next.round_time_remaining = 0;
            next.ended_at = Some(now);
        }
    }

    next.updated_at = now;
    Ok(Transition::Applied(next))
}

fn check_round_start(battle: &Battle, round_number: u32) -> Result<(), Rejection> {
    if battle.battle_state != Phase::Running {
        return Err(Rejection::NotStarted);
    }
    if battle.round_state == Phase::Running {
        return Err(Rejection::RoundAlreadyRunning);
    }
    if round_number == 0 || round_number > battle.max_rounds {
        return Err(Rejection::RoundOutOfRange {
            requested: round_number,
            max: battle.max_rounds,
        });
    }
    Ok(())
}

fn reject(battle: &Battle, event: BattleEvent, reason: Rejection) -> InvalidTransition {
    InvalidTransition {
        battle_state: battle.battle_state,
        round_state: battle.round_state,
        event,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state::battle::{BattleConfig, BattleMode, Visibility};

    fn battle(max_rounds: u32, duration: u32) -> Battle {
        Battle::new(
            BattleConfig {
                title: "friday night".into(),
                mode: BattleMode::OneVsOne,
                max_rounds,
                round_duration_secs: duration,
                visibility: Visibility::Public,
                password_hash: None,
            },
            1,
        )
    }

    fn applied(battle: &Battle, event: BattleEvent) -> Battle {
        match apply(battle, event, SystemTime::now()).unwrap() {
            Transition::Applied(next) => next,
            Transition::Unchanged => panic!("expected {event:?} to change the battle"),
        }
    }

    fn round_started(round_number: u32, duration_secs: u32) -> BattleEvent {
        BattleEvent::RoundStarted {
            round_number,
            round_id: Uuid::new_v4(),
            duration_secs,
        }
    }

    #[test]
    fn start_initialises_live_state() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        assert_eq!(b.battle_state, Phase::Running);
        assert_eq!(b.status, BattleStatus::Live);
        assert_eq!(b.current_round, 1);
        assert_eq!(b.current_turn, Some(Turn::Mc1));
        assert_eq!(b.round_time_remaining, 60);
        assert!(b.started_at.is_some());
    }

    #[test]
    fn start_is_idempotent_while_running() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        let later = SystemTime::now() + Duration::from_secs(30);
        assert_eq!(apply(&b, BattleEvent::Start, later).unwrap(), Transition::Unchanged);
    }

    #[test]
    fn start_rejected_once_finished() {
        let b = applied(&battle(3, 60), BattleEvent::Finish);
        let err = apply(&b, BattleEvent::Start, SystemTime::now()).unwrap_err();
        assert_eq!(err.reason, Rejection::AlreadyFinished);
    }

    #[test]
    fn round_requires_running_battle() {
        let err = plan_round(&battle(3, 60), None).unwrap_err();
        assert_eq!(err.reason, Rejection::NotStarted);
        assert_eq!(err.reason.to_string(), "start battle first");
    }

    #[test]
    fn round_cannot_start_twice() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        let b = applied(&b, round_started(1, 60));
        assert_eq!(
            plan_round(&b, None).unwrap_err().reason,
            Rejection::RoundAlreadyRunning
        );
    }

    #[test]
    fn round_number_must_be_in_range() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        assert_eq!(plan_round(&b, None).unwrap(), 1);
        assert_eq!(plan_round(&b, Some(3)).unwrap(), 3);
        assert!(matches!(
            plan_round(&b, Some(4)).unwrap_err().reason,
            Rejection::RoundOutOfRange { requested: 4, max: 3 }
        ));
    }

    #[test]
    fn round_start_sets_clock_and_turn() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        let round_id = Uuid::new_v4();
        let b = applied(
            &b,
            BattleEvent::RoundStarted {
                round_number: 2,
                round_id,
                duration_secs: 30,
            },
        );
        assert_eq!(b.round_state, Phase::Running);
        assert_eq!(b.current_round, 2);
        assert_eq!(b.round_time_remaining, 30);
        assert_eq!(b.active_round_id, Some(round_id));
        assert!(b.round_started_at.is_some());
    }

    #[test]
    fn turns_alternate_without_skips() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        let mut b = applied(&b, round_started(1, 60));
        let mut turns = Vec::new();
        for _ in 0..4 {
            b = applied(&b, BattleEvent::TurnPassed);
            turns.push(b.current_turn);
        }
        assert_eq!(
            turns,
            vec![Some(Turn::Mc2), Some(Turn::Mc1), Some(Turn::Mc2), Some(Turn::Mc1)]
        );
    }

    #[test]
    fn turn_requires_running_round() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        let err = apply(&b, BattleEvent::TurnPassed, SystemTime::now()).unwrap_err();
        assert_eq!(err.reason, Rejection::RoundNotRunning);
    }

    #[test]
    fn round_end_advances_and_clamps() {
        let b = applied(&battle(2, 60), BattleEvent::Start);
        let b = applied(&b, round_started(1, 60));
        let b = applied(&b, BattleEvent::RoundEnded);
        assert_eq!(b.round_state, Phase::Finished);
        assert_eq!(b.current_turn, None);
        assert_eq!(b.round_time_remaining, 0);
        assert_eq!(b.current_round, 2);

        let b = applied(&b, round_started(2, 60));
        let b = applied(&b, BattleEvent::RoundEnded);
        assert_eq!(b.current_round, 2);
    }

    #[test]
    fn round_end_is_noop_when_already_finished() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        let b = applied(&b, round_started(1, 60));
        let b = applied(&b, BattleEvent::RoundEnded);
        assert_eq!(
            apply(&b, BattleEvent::RoundEnded, SystemTime::now()).unwrap(),
            Transition::Unchanged
        );
    }

    #[test]
    fn finish_closes_everything_once() {
        let b = applied(&battle(3, 60), BattleEvent::Start);
        let b = applied(&b, round_started(1, 60));
        let b = applied(&b, BattleEvent::Finish);
        assert_eq!(b.status, BattleStatus::Finished);
        assert_eq!(b.battle_state, Phase::Finished);
        assert_eq!(b.round_state, Phase::Finished);
        assert_eq!(b.current_turn, None);
        assert_eq!(b.round_time_remaining, 0);
        assert!(b.ended_at.is_some());

        let err = apply(&b, BattleEvent::Finish, SystemTime::now()).unwrap_err();
        assert_eq!(err.reason, Rejection::AlreadyFinished);
    }
}
