//! Audience ballots and tallies.

use std::time::SystemTime;

use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{ServiceError, VoteRejection},
    services::{
        access_control::{VoteEligibility, resolve_vote_eligibility},
        broadcast_events,
    },
    state::{
        SharedState,
        battle::{UserId, Vote, VoteTotal},
    },
};

/// Acknowledgement of an accepted ballot, with the round's tally right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteReceipt {
    pub vote_id: Uuid,
    pub round_id: Uuid,
    pub target_user_id: UserId,
    pub votes: Vec<VoteTotal>,
}

/// Battle-wide standings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalTally {
    pub winner_id: Option<UserId>,
    pub totals: Vec<VoteTotal>,
}

/// Record one ballot from `voter_id` for `target_user_id` in `round_id`.
///
/// `round_id` defaults to the battle's active round. The round check and the
/// insert run under the battle transition gate, so a ballot never lands after
/// the round it targets has ended. Repeat ballots are arbitrated by the
/// store's unique insert.
pub async fn cast_vote(
    state: &SharedState,
    battle_id: Uuid,
    round_id: Option<Uuid>,
    voter_id: UserId,
    target_user_id: UserId,
) -> Result<VoteReceipt, ServiceError> {
    let store = state.require_battle_store().await?;
    state
        .run_transition(battle_id, || async {
            let battle = store
                .find_battle(battle_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("battle `{battle_id}` not found")))?;
            let round_id = round_id
                .or(battle.active_round_id)
                .ok_or(ServiceError::VoteRejected(VoteRejection::NoActiveRound))?;

            match resolve_vote_eligibility(&store, &battle, round_id, voter_id).await? {
                VoteEligibility::Allowed => {}
                VoteEligibility::AlreadyVoted => {
                    return Err(ServiceError::VoteRejected(VoteRejection::AlreadyVoted));
                }
                VoteEligibility::NoActiveRound => {
                    return Err(ServiceError::VoteRejected(VoteRejection::NoActiveRound));
                }
            }

            let vote = Vote {
                id: Uuid::new_v4(),
                battle_id,
                round_id,
                voter_id,
                target_user_id,
                score: 1,
                cast_at: SystemTime::now(),
            };
            let vote_id = vote.id;

            match store.insert_vote(vote).await {
                Ok(()) => {}
                Err(err) if err.is_conflict() => {
                    debug!(%battle_id, %round_id, voter_id, "duplicate ballot refused by store");
                    return Err(ServiceError::VoteRejected(VoteRejection::AlreadyVoted));
                }
                Err(err) => return Err(err.into()),
            }

            let votes = store.sum_votes(battle_id, Some(round_id)).await?;
            info!(%battle_id, %round_id, voter_id, target_user_id, "vote cast");
            broadcast_events::broadcast_vote_cast(state, battle_id, round_id, votes.clone());

            Ok(VoteReceipt {
                vote_id,
                round_id,
                target_user_id,
                votes,
            })
        })
        .await
}

/// Per-target totals of one round, ordered by target id.
pub async fn tally(
    state: &SharedState,
    battle_id: Uuid,
    round_id: Uuid,
) -> Result<Vec<VoteTotal>, ServiceError> {
    let store = state.require_battle_store().await?;
    Ok(store.sum_votes(battle_id, Some(round_id)).await?)
}

/// Totals across every round and the resulting winner.
pub async fn final_tally(state: &SharedState, battle_id: Uuid) -> Result<FinalTally, ServiceError> {
    let store = state.require_battle_store().await?;
    let totals = store.sum_votes(battle_id, None).await?;
    Ok(FinalTally {
        winner_id: pick_winner(&totals),
        totals,
    })
}

/// Highest total wins; ties go to the lowest user id. No ballots, no winner.
pub fn pick_winner(totals: &[VoteTotal]) -> Option<UserId> {
    totals
        .iter()
        .min_by_key(|entry| (std::cmp::Reverse(entry.total), entry.target_user_id))
        .map(|entry| entry.target_user_id)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::battle_store::memory::MemoryBattleStore,
        state::{
            AppState,
            battle::{Battle, BattleConfig, BattleMode, Phase, Visibility},
        },
    };

    fn total(target_user_id: UserId, total: i64) -> VoteTotal {
        VoteTotal {
            target_user_id,
            total,
        }
    }

    async fn live_round(state: &SharedState) -> (Uuid, Uuid) {
        let mut battle = Battle::new(
            BattleConfig {
                title: "cypher".into(),
                mode: BattleMode::OneVsOne,
                max_rounds: 5,
                round_duration_secs: 60,
                visibility: Visibility::Public,
                password_hash: None,
            },
            1,
        );
        let round_id = Uuid::new_v4();
        battle.battle_state = Phase::Running;
        battle.round_state = Phase::Running;
        battle.current_round = 5;
        battle.active_round_id = Some(round_id);
        let battle_id = battle.id;
        state
            .require_battle_store()
            .await
            .unwrap()
            .create_battle(battle)
            .await
            .unwrap();
        (battle_id, round_id)
    }

    fn state() -> SharedState {
        AppState::with_store(AppConfig::default(), Arc::new(MemoryBattleStore::new()))
    }

    #[test]
    fn winner_has_the_highest_total() {
        assert_eq!(pick_winner(&[total(10, 2), total(11, 5), total(12, 1)]), Some(11));
    }

    #[test]
    fn ties_go_to_the_lowest_user_id() {
        assert_eq!(pick_winner(&[total(12, 3), total(10, 3), total(11, 1)]), Some(10));
    }

    #[test]
    fn no_ballots_no_winner() {
        assert_eq!(pick_winner(&[]), None);
    }

    #[tokio::test]
    async fn round_tally_and_repeat_ballot() {
        let state = state();
        let (battle_id, round_id) = live_round(&state).await;
        let mut rx = state.hub().subscribe(battle_id);

        cast_vote(&state, battle_id, Some(round_id), 1, 10).await.unwrap();
        let receipt = cast_vote(&state, battle_id, None, 2, 11).await.unwrap();
        assert_eq!(receipt.round_id, round_id);
        assert_eq!(
            tally(&state, battle_id, round_id).await.unwrap(),
            vec![total(10, 1), total(11, 1)]
        );

        let err = cast_vote(&state, battle_id, Some(round_id), 1, 11)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::VoteRejected(VoteRejection::AlreadyVoted)
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, broadcast_events::EVENT_VOTE_CAST);
        let second = rx.recv().await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(&second.data).unwrap();
        assert_eq!(payload["votes"].as_array().unwrap().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ballots_for_another_round_are_refused() {
        let state = state();
        let (battle_id, _) = live_round(&state).await;
        let err = cast_vote(&state, battle_id, Some(Uuid::new_v4()), 1, 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::VoteRejected(VoteRejection::NoActiveRound)
        ));
    }

    #[tokio::test]
    async fn concurrent_repeat_ballots_count_once() {
        let state = state();
        let (battle_id, round_id) = live_round(&state).await;

        let attempts = (0..16).map(|_| {
            let state = Arc::clone(&state);
            tokio::spawn(async move { cast_vote(&state, battle_id, Some(round_id), 7, 10).await })
        });
        let mut accepted = 0;
        for attempt in attempts.collect::<Vec<_>>() {
            match attempt.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(err) => assert!(matches!(
                    err,
                    ServiceError::VoteRejected(VoteRejection::AlreadyVoted)
                )),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(
            final_tally(&state, battle_id).await.unwrap(),
            FinalTally {
                winner_id: Some(10),
                totals: vec![total(10, 1)],
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ballots_wait_for_a_round_ending_in_flight() {
        let state = state();
        let (battle_id, round_id) = live_round(&state).await;

        let closing = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let store = state.require_battle_store().await?;
                state
                    .run_transition(battle_id, || async {
                        let mut battle = store.find_battle(battle_id).await?.unwrap();
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        battle.round_state = Phase::Finished;
                        store.save_battle(battle).await?;
                        Ok::<_, ServiceError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let err = cast_vote(&state, battle_id, Some(round_id), 1, 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::VoteRejected(VoteRejection::NoActiveRound)
        ));
        closing.await.unwrap().unwrap();
        assert!(tally(&state, battle_id, round_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_battle_is_not_found() {
        let state = state();
        let err = cast_vote(&state, Uuid::new_v4(), None, 1, 2).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn degraded_mode_refuses_ballots() {
        let state = AppState::new(AppConfig::default());
        let err = cast_vote(&state, Uuid::new_v4(), None, 1, 2).await.unwrap_err();
        assert!(matches!(err, ServiceError::Degraded));
    }
}
