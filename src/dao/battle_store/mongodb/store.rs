use std::sync::Arc;

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{Bson, Document, doc},
    options::{IndexOptions, ReturnDocument},
};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{
    connection::{MongoConfig, establish_connection},
    error::{MongoDaoError, MongoResult},
    models::{
        BATTLES, BattleDocument, PARTICIPANTS, ParticipantDocument, ROUNDS, RoundDocument, VOTES,
        VoteDocument, participant_key,
    },
};
use crate::dao::{battle_store::BattleStore, storage::StorageResult};
use crate::state::battle::{Battle, Participant, Round, RoundUpdate, UserId, Vote, VoteTotal};

/// [`BattleStore`] persisting to MongoDB. Uniqueness rules are backed by
/// unique indexes so concurrent writers are arbitrated by the server.
#[derive(Clone)]
pub struct MongoBattleStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn database(&self) -> Database {
        self.state.read().await.database.clone()
    }

    async fn ping(&self) -> MongoResult<()> {
        self.database()
            .await
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) = establish_connection(&self.config).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }

    async fn battles(&self) -> Collection<BattleDocument> {
        self.database().await.collection(BATTLES)
    }

    async fn rounds(&self) -> Collection<RoundDocument> {
        self.database().await.collection(ROUNDS)
    }

    async fn participants(&self) -> Collection<ParticipantDocument> {
        self.database().await.collection(PARTICIPANTS)
    }

    async fn votes(&self) -> Collection<VoteDocument> {
        self.database().await.collection(VOTES)
    }
}

impl MongoBattleStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) = establish_connection(&config).await?;
        info!(database = %config.database_name, "connected to MongoDB");

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.inner.database().await;
        let unique = |name: &str| {
            IndexOptions::builder()
                .name(Some(name.to_owned()))
                .unique(Some(true))
                .build()
        };

        let indexes: [(&'static str, &'static str, IndexModel); 4] = [
            (
                VOTES,
                "one_vote_per_round",
                IndexModel::builder()
                    .keys(doc! { "battle_id": 1, "round_id": 1, "voter_id": 1 })
                    .options(unique("one_vote_per_round"))
                    .build(),
            ),
            (
                ROUNDS,
                "round_number",
                IndexModel::builder()
                    .keys(doc! { "battle_id": 1, "round_number": 1 })
                    .options(unique("round_number"))
                    .build(),
            ),
            (
                PARTICIPANTS,
                "exclusive_role",
                IndexModel::builder()
                    .keys(doc! { "battle_id": 1, "exclusive_role": 1 })
                    .options(
                        IndexOptions::builder()
                            .name(Some("exclusive_role".to_owned()))
                            .unique(Some(true))
                            .partial_filter_expression(Some(
                                doc! { "exclusive_role": { "$type": "string" } },
                            ))
                            .build(),
                    )
                    .build(),
            ),
            (
                PARTICIPANTS,
                "battle_members",
                IndexModel::builder()
                    .keys(doc! { "battle_id": 1, "user_id": 1 })
                    .options(
                        IndexOptions::builder()
                            .name(Some("battle_members".to_owned()))
                            .build(),
                    )
                    .build(),
            ),
        ];

        for (collection, index, model) in indexes {
            database
                .collection::<Document>(collection)
                .create_index(model)
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection,
                    index,
                    source,
                })?;
        }
        Ok(())
    }

    async fn create_battle(&self, battle: Battle) -> MongoResult<()> {
        let id = battle.id;
        self.inner
            .battles()
            .await
            .insert_one(BattleDocument::from(battle))
            .await
            .map_err(|source| {
                MongoDaoError::write(BATTLES, source, || format!("battle `{id}` already exists"))
            })?;
        Ok(())
    }

    async fn find_battle(&self, id: Uuid) -> MongoResult<Option<Battle>> {
        self.inner
            .battles()
            .await
            .find_one(doc! { "_id": id.to_string() })
            .await
            .map_err(|source| MongoDaoError::Read {
                collection: BATTLES,
                source,
            })?
            .map(Battle::try_from)
            .transpose()
    }

    async fn save_battle(&self, battle: Battle) -> MongoResult<()> {
        let filter = doc! { "_id": battle.id.to_string() };
        self.inner
            .battles()
            .await
            .replace_one(filter, BattleDocument::from(battle))
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Write {
                collection: BATTLES,
                source,
            })?;
        Ok(())
    }

    async fn delete_battle(&self, id: Uuid) -> MongoResult<bool> {
        let battle_id = id.to_string();
        let database = self.inner.database().await;
        for collection in [VOTES, PARTICIPANTS, ROUNDS] {
            database
                .collection::<Document>(collection)
                .delete_many(doc! { "battle_id": &battle_id })
                .await
                .map_err(|source| MongoDaoError::Write { collection, source })?;
        }
        let result = database
            .collection::<Document>(BATTLES)
            .delete_one(doc! { "_id": &battle_id })
            .await
            .map_err(|source| MongoDaoError::Write {
                collection: BATTLES,
                source,
            })?;
        Ok(result.deleted_count > 0)
    }

    async fn upsert_round(
        &self,
        battle_id: Uuid,
        round_number: u32,
        update: RoundUpdate,
    ) -> MongoResult<Round> {
        let mut set = Document::new();
        if let Some(theme) = update.theme {
            set.insert("theme", theme);
        }
        if let Some(beat_url) = update.beat_url {
            set.insert("beat_url", beat_url);
        }
        let mut changes = doc! {
            "$setOnInsert": { "_id": Uuid::new_v4().to_string() },
        };
        if !set.is_empty() {
            changes.insert("$set", set);
        }

        let filter = doc! { "battle_id": battle_id.to_string(), "round_number": round_number };
        let document = self
            .inner
            .rounds()
            .await
            .find_one_and_update(filter, changes)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| {
                MongoDaoError::write(ROUNDS, source, || {
                    format!("round {round_number} of battle `{battle_id}` was created concurrently")
                })
            })?
            .ok_or_else(|| MongoDaoError::Malformed {
                collection: ROUNDS,
                detail: "upsert returned no document".to_owned(),
            })?;
        Round::try_from(document)
    }

    async fn insert_vote(&self, vote: Vote) -> MongoResult<()> {
        let (voter_id, round_id) = (vote.voter_id, vote.round_id);
        self.inner
            .votes()
            .await
            .insert_one(VoteDocument::from(vote))
            .await
            .map_err(|source| {
                MongoDaoError::write(VOTES, source, || {
                    format!("user `{voter_id}` already voted in round `{round_id}`")
                })
            })?;
        Ok(())
    }

    async fn find_vote(
        &self,
        battle_id: Uuid,
        round_id: Uuid,
        voter_id: UserId,
    ) -> MongoResult<Option<Vote>> {
        self.inner
            .votes()
            .await
            .find_one(doc! {
                "battle_id": battle_id.to_string(),
                "round_id": round_id.to_string(),
                "voter_id": voter_id,
            })
            .await
            .map_err(|source| MongoDaoError::Read {
                collection: VOTES,
                source,
            })?
            .map(Vote::try_from)
            .transpose()
    }

    async fn sum_votes(&self, battle_id: Uuid, round_id: Option<Uuid>) -> MongoResult<Vec<VoteTotal>> {
        let mut filter = doc! { "battle_id": battle_id.to_string() };
        if let Some(round_id) = round_id {
            filter.insert("round_id", round_id.to_string());
        }
        let pipeline = [
            doc! { "$match": filter },
            doc! { "$group": { "_id": "$target_user_id", "total": { "$sum": "$score" } } },
            doc! { "$sort": { "_id": 1 } },
        ];

        let rows: Vec<Document> = self
            .inner
            .votes()
            .await
            .aggregate(pipeline)
            .await
            .map_err(|source| MongoDaoError::Read {
                collection: VOTES,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Read {
                collection: VOTES,
                source,
            })?;

        rows.iter()
            .map(|row| {
                Ok(VoteTotal {
                    target_user_id: integer_field(row, "_id")?,
                    total: integer_field(row, "total")?,
                })
            })
            .collect()
    }

    async fn find_participant(
        &self,
        battle_id: Uuid,
        user_id: UserId,
    ) -> MongoResult<Option<Participant>> {
        self.inner
            .participants()
            .await
            .find_one(doc! { "_id": participant_key(battle_id, user_id) })
            .await
            .map_err(|source| MongoDaoError::Read {
                collection: PARTICIPANTS,
                source,
            })?
            .map(Participant::try_from)
            .transpose()
    }

    async fn insert_participant(&self, participant: Participant) -> MongoResult<()> {
        let (user_id, role) = (participant.user_id, participant.role);
        self.inner
            .participants()
            .await
            .insert_one(ParticipantDocument::from(participant))
            .await
            .map_err(|source| {
                MongoDaoError::write(PARTICIPANTS, source, || {
                    if role.is_exclusive() {
                        format!("role `{}` is already taken", role.as_str())
                    } else {
                        format!("user `{user_id}` already joined")
                    }
                })
            })?;
        Ok(())
    }

    async fn save_participant(&self, participant: Participant) -> MongoResult<()> {
        let filter = doc! { "_id": participant_key(participant.battle_id, participant.user_id) };
        self.inner
            .participants()
            .await
            .replace_one(filter, ParticipantDocument::from(participant))
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Write {
                collection: PARTICIPANTS,
                source,
            })?;
        Ok(())
    }

    async fn list_participants(&self, battle_id: Uuid) -> MongoResult<Vec<Participant>> {
        let documents: Vec<ParticipantDocument> = self
            .inner
            .participants()
            .await
            .find(doc! { "battle_id": battle_id.to_string() })
            .await
            .map_err(|source| MongoDaoError::Read {
                collection: PARTICIPANTS,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Read {
                collection: PARTICIPANTS,
                source,
            })?;

        let mut participants = documents
            .into_iter()
            .map(Participant::try_from)
            .collect::<MongoResult<Vec<_>>>()?;
        participants.sort_by_key(|participant| (participant.role, participant.user_id));
        Ok(participants)
    }
}

fn integer_field(row: &Document, key: &str) -> MongoResult<i64> {
    match row.get(key) {
        Some(Bson::Int64(value)) => Ok(*value),
        Some(Bson::Int32(value)) => Ok(i64::from(*value)),
        other => Err(MongoDaoError::Malformed {
            collection: VOTES,
            detail: format!("expected integer `{key}`, found {other:?}"),
        }),
    }
}

impl BattleStore for MongoBattleStore {
    fn create_battle(&self, battle: Battle) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.create_battle(battle).await.map_err(Into::into) })
    }

    fn find_battle(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<Battle>>> {
        let store = self.clone();
        Box::pin(async move { store.find_battle(id).await.map_err(Into::into) })
    }

    fn save_battle(&self, battle: Battle) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_battle(battle).await.map_err(Into::into) })
    }

    fn delete_battle(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.delete_battle(id).await.map_err(Into::into) })
    }

    fn upsert_round(
        &self,
        battle_id: Uuid,
        round_number: u32,
        update: RoundUpdate,
    ) -> BoxFuture<'static, StorageResult<Round>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .upsert_round(battle_id, round_number, update)
                .await
                .map_err(Into::into)
        })
    }

    fn insert_vote(&self, vote: Vote) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert_vote(vote).await.map_err(Into::into) })
    }

    fn find_vote(
        &self,
        battle_id: Uuid,
        round_id: Uuid,
        voter_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<Vote>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_vote(battle_id, round_id, voter_id)
                .await
                .map_err(Into::into)
        })
    }

    fn sum_votes(
        &self,
        battle_id: Uuid,
        round_id: Option<Uuid>,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteTotal>>> {
        let store = self.clone();
        Box::pin(async move { store.sum_votes(battle_id, round_id).await.map_err(Into::into) })
    }

    fn find_participant(
        &self,
        battle_id: Uuid,
        user_id: UserId,
    ) -> BoxFuture<'static, StorageResult<Option<Participant>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_participant(battle_id, user_id)
                .await
                .map_err(Into::into)
        })
    }

    fn insert_participant(&self, participant: Participant) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert_participant(participant).await.map_err(Into::into) })
    }

    fn save_participant(&self, participant: Participant) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_participant(participant).await.map_err(Into::into) })
    }

    fn list_participants(&self, battle_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<Participant>>> {
        let store = self.clone();
        Box::pin(async move { store.list_participants(battle_id).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
