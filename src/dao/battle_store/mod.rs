pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::storage::StorageResult;
use crate::state::battle::{Battle, Participant, Round, RoundUpdate, UserId, Vote, VoteTotal};

/// Abstraction over the persistence layer for battles and their child records.
///
/// Uniqueness rules (one vote per voter and round, one participant per user,
/// one holder per exclusive role) are enforced by the insert operations
/// themselves and reported as [`StorageError::Conflict`](crate::dao::storage::StorageError::Conflict).
pub trait BattleStore: Send + Sync {
    fn create_battle(&self, battle: Battle) -> BoxFuture<'static, StorageResult<()>>;
    fn find_battle(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<Battle>>>;
    fn save_battle(&self, battle: Battle) -> BoxFuture<'static, StorageResult<()>>;
    /// Delete a battle with its rounds, participants and votes.
    fn delete_battle(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>>;

    fn upsert_round(
        &self,
        battle_id: Uuid,
        round_number: u32,
        update: RoundUpdate,
    ) -> BoxFuture<'static, StorageResult<Round>>;
    fn insert_vote(&self, vote: Vote) -> BoxFuture<'static, StorageResult<()>>;
    fn find_vote(
        &self,
        battle_id: Uuid,
        round_id: Uuid,
        voter_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<Vote>>>;
    /// Sum ballots per target, for one round or for the whole battle.
    fn sum_votes(
        &self,
        battle_id: Uuid,
        round_id: Option<Uuid>,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteTotal>>>;

    fn find_participant(
        &self,
        battle_id: Uuid,
        user_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<Participant>>>;
    fn insert_participant(&self, participant: Participant) -> BoxFuture<'static, StorageResult<()>>;
    fn save_participant(&self, participant: Participant) -> BoxFuture<'static, StorageResult<()>>;
    fn list_participants(&self, battle_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<Participant>>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
