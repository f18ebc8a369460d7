//! Process-local [`BattleStore`] backed by concurrent maps. Used when no
//! database is configured and by the test-suite.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use uuid::Uuid;

use super::BattleStore;
use crate::dao::storage::{StorageError, StorageResult};
use crate::state::battle::{Battle, Participant, Role, Round, RoundUpdate, UserId, Vote, VoteTotal};

#[derive(Clone, Default)]
pub struct MemoryBattleStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    battles: DashMap<Uuid, Battle>,
    rounds: DashMap<(Uuid, u32), Round>,
    participants: DashMap<(Uuid, UserId), Participant>,
    role_slots: DashMap<(Uuid, Role), UserId>,
    votes: DashMap<(Uuid, Uuid, UserId), Vote>,
}

impl MemoryBattleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryInner {
    fn create_battle(&self, battle: Battle) -> StorageResult<()> {
        match self.battles.entry(battle.id) {
            Entry::Occupied(_) => Err(StorageError::conflict(format!(
                "battle `{}` already exists",
                battle.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(battle);
                Ok(())
            }
        }
    }

    fn save_battle(&self, battle: Battle) {
        self.battles.insert(battle.id, battle);
    }

    fn delete_battle(&self, id: Uuid) -> bool {
        let removed = self.battles.remove(&id).is_some();
        self.rounds.retain(|(battle_id, _), _| *battle_id != id);
        self.participants.retain(|(battle_id, _), _| *battle_id != id);
        self.role_slots.retain(|(battle_id, _), _| *battle_id != id);
        self.votes.retain(|(battle_id, _, _), _| *battle_id != id);
        removed
    }

    fn upsert_round(&self, battle_id: Uuid, round_number: u32, update: RoundUpdate) -> Round {
        let mut round = self
            .rounds
            .entry((battle_id, round_number))
            .or_insert_with(|| Round {
                id: Uuid::new_v4(),
                battle_id,
                round_number,
                theme: None,
                beat_url: None,
            });
        if let Some(theme) = update.theme {
            round.theme = Some(theme);
        }
        if let Some(beat_url) = update.beat_url {
            round.beat_url = Some(beat_url);
        }
        round.clone()
    }

    fn insert_vote(&self, vote: Vote) -> StorageResult<()> {
        match self
            .votes
            .entry((vote.battle_id, vote.round_id, vote.voter_id))
        {
            Entry::Occupied(_) => Err(StorageError::conflict(format!(
                "user `{}` already voted in round `{}`",
                vote.voter_id, vote.round_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(vote);
                Ok(())
            }
        }
    }

    fn sum_votes(&self, battle_id: Uuid, round_id: Option<Uuid>) -> Vec<VoteTotal> {
        let mut totals: IndexMap<UserId, i64> = IndexMap::new();
        for entry in self.votes.iter() {
            let vote = entry.value();
            if vote.battle_id != battle_id || round_id.is_some_and(|id| id != vote.round_id) {
                continue;
            }
            *totals.entry(vote.target_user_id).or_default() += vote.score;
        }
        totals.sort_keys();
        totals
            .into_iter()
            .map(|(target_user_id, total)| VoteTotal {
                target_user_id,
                total,
            })
            .collect()
    }

    fn insert_participant(&self, participant: Participant) -> StorageResult<()> {
        let battle_id = participant.battle_id;
        let user_id = participant.user_id;
        let role = participant.role;

        if role.is_exclusive() {
            match self.role_slots.entry((battle_id, role)) {
                Entry::Occupied(_) => {
                    return Err(StorageError::conflict(format!(
                        "role `{}` is already taken",
                        role.as_str()
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(user_id);
                }
            }
        }

        match self.participants.entry((battle_id, user_id)) {
            Entry::Occupied(_) => {
                if role.is_exclusive() {
                    self.role_slots
                        .remove_if(&(battle_id, role), |_, holder| *holder == user_id);
                }
                Err(StorageError::conflict(format!(
                    "user `{user_id}` already joined battle `{battle_id}`"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(participant);
                Ok(())
            }
        }
    }

    fn list_participants(&self, battle_id: Uuid) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self
            .participants
            .iter()
            .filter(|entry| entry.key().0 == battle_id)
            .map(|entry| entry.value().clone())
            .collect();
        participants.sort_by_key(|participant| (participant.role, participant.user_id));
        participants
    }
}

impl BattleStore for MemoryBattleStore {
    fn create_battle(&self, battle: Battle) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.create_battle(battle) })
    }

    fn find_battle(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<Battle>>> {
        let found = self.inner.battles.get(&id).map(|entry| entry.clone());
        Box::pin(async move { Ok(found) })
    }

    fn save_battle(&self, battle: Battle) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.inner.save_battle(battle);
            Ok(())
        })
    }

    fn delete_battle(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.delete_battle(id)) })
    }

    fn upsert_round(
        &self,
        battle_id: Uuid,
        round_number: u32,
        update: RoundUpdate,
    ) -> BoxFuture<'static, StorageResult<Round>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.upsert_round(battle_id, round_number, update)) })
    }

    fn insert_vote(&self, vote: Vote) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.insert_vote(vote) })
    }

    fn find_vote(
        &self,
        battle_id: Uuid,
        round_id: Uuid,
        voter_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<Vote>>> {
        let found = self
            .inner
            .votes
            .get(&(battle_id, round_id, voter_id))
            .map(|entry| entry.clone());
        Box::pin(async move { Ok(found) })
    }

    fn sum_votes(
        &self,
        battle_id: Uuid,
        round_id: Option<Uuid>,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteTotal>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.sum_votes(battle_id, round_id)) })
    }

    fn find_participant(
        &self,
        battle_id: Uuid,
        user_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<Participant>>> {
        let found = self
            .inner
            .participants
            .get(&(battle_id, user_id))
            .map(|entry| entry.clone());
        Box::pin(async move { Ok(found) })
    }

    fn insert_participant(&self, participant: Participant) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.insert_participant(participant) })
    }

    fn save_participant(&self, participant: Participant) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .inner
                .participants
                .insert((participant.battle_id, participant.user_id), participant);
            Ok(())
        })
    }

    fn list_participants(&self, battle_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<Participant>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.inner.list_participants(battle_id)) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::state::battle::{BattleConfig, BattleMode, Visibility};

    fn vote(battle_id: Uuid, round_id: Uuid, voter_id: UserId, target_user_id: UserId) -> Vote {
        Vote {
            id: Uuid::new_v4(),
            battle_id,
            round_id,
            voter_id,
            target_user_id,
            score: 1,
            cast_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn second_vote_in_same_round_conflicts() {
        let store = MemoryBattleStore::new();
        let (battle, round) = (Uuid::new_v4(), Uuid::new_v4());

        store.insert_vote(vote(battle, round, 1, 10)).await.unwrap();
        let err = store.insert_vote(vote(battle, round, 1, 11)).await.unwrap_err();
        assert!(err.is_conflict());

        store.insert_vote(vote(battle, Uuid::new_v4(), 1, 11)).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_duplicate_votes_admit_exactly_one() {
        let store = MemoryBattleStore::new();
        let (battle, round) = (Uuid::new_v4(), Uuid::new_v4());

        let attempts = (0..16).map(|_| store.insert_vote(vote(battle, round, 7, 10)));
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            store.sum_votes(battle, Some(round)).await.unwrap(),
            vec![VoteTotal {
                target_user_id: 10,
                total: 1
            }]
        );
    }

    #[tokio::test]
    async fn sums_per_round_and_per_battle() {
        let store = MemoryBattleStore::new();
        let (battle, r1, r2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.insert_vote(vote(battle, r1, 1, 10)).await.unwrap();
        store.insert_vote(vote(battle, r1, 2, 11)).await.unwrap();
        store.insert_vote(vote(battle, r2, 1, 10)).await.unwrap();

        let round_one = store.sum_votes(battle, Some(r1)).await.unwrap();
        assert_eq!(round_one.len(), 2);

        let all = store.sum_votes(battle, None).await.unwrap();
        assert_eq!(
            all,
            vec![
                VoteTotal { target_user_id: 10, total: 2 },
                VoteTotal { target_user_id: 11, total: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn exclusive_roles_hold_a_single_participant() {
        let store = MemoryBattleStore::new();
        let battle = Uuid::new_v4();

        store
            .insert_participant(Participant::new(battle, 1, "ana".into(), Role::Mc1))
            .await
            .unwrap();
        let err = store
            .insert_participant(Participant::new(battle, 2, "bo".into(), Role::Mc1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        store
            .insert_participant(Participant::new(battle, 2, "bo".into(), Role::Viewer))
            .await
            .unwrap();
        store
            .insert_participant(Participant::new(battle, 3, "cy".into(), Role::Viewer))
            .await
            .unwrap();
        assert_eq!(store.list_participants(battle).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejoining_user_does_not_leak_a_role_slot() {
        let store = MemoryBattleStore::new();
        let battle = Uuid::new_v4();
        store
            .insert_participant(Participant::new(battle, 1, "ana".into(), Role::Viewer))
            .await
            .unwrap();
        assert!(
            store
                .insert_participant(Participant::new(battle, 1, "ana".into(), Role::Mc2))
                .await
                .is_err()
        );
        store
            .insert_participant(Participant::new(battle, 2, "bo".into(), Role::Mc2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rounds_upsert_in_place_and_delete_cascades() {
        let store = MemoryBattleStore::new();
        let battle = Battle::new(
            BattleConfig {
                title: "cascade".into(),
                mode: BattleMode::OpenMic,
                max_rounds: 2,
                round_duration_secs: 30,
                visibility: Visibility::Public,
                password_hash: None,
            },
            1,
        );
        let id = battle.id;
        store.create_battle(battle).await.unwrap();

        let first = store.upsert_round(id, 1, RoundUpdate::default()).await.unwrap();
        let again = store
            .upsert_round(
                id,
                1,
                RoundUpdate {
                    beat_url: Some("https://beats.example/1.mp3".into()),
                    ..RoundUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.beat_url.as_deref(), Some("https://beats.example/1.mp3"));

        store.insert_vote(vote(id, first.id, 1, 2)).await.unwrap();
        assert!(store.delete_battle(id).await.unwrap());
        assert!(store.find_battle(id).await.unwrap().is_none());
        assert!(!store.inner.rounds.contains_key(&(id, 1)));
        assert!(store.sum_votes(id, None).await.unwrap().is_empty());
        assert!(!store.delete_battle(id).await.unwrap());
    }
}
