use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{MongoDaoError, MongoResult};
use crate::state::battle::{
    Battle, BattleMode, BattleStatus, Participant, Phase, Role, Round, Turn, UserId, Visibility,
    Vote,
};

pub const BATTLES: &str = "battles";
pub const ROUNDS: &str = "rounds";
pub const PARTICIPANTS: &str = "participants";
pub const VOTES: &str = "votes";

/// Parse a string identifier read back from `collection`.
pub fn parse_id(collection: &'static str, raw: &str) -> MongoResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| MongoDaoError::Malformed {
        collection,
        detail: format!("invalid id `{raw}`: {err}"),
    })
}

/// Participants are keyed by battle and user so a user can hold a single seat.
pub fn participant_key(battle_id: Uuid, user_id: UserId) -> String {
    format!("{battle_id}:{user_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleDocument {
    #[serde(rename = "_id")]
    id: String,
    title: String,
    mode: BattleMode,
    max_rounds: u32,
    round_duration_secs: u32,
    visibility: Visibility,
    password_hash: Option<String>,
    status: BattleStatus,
    battle_state: Phase,
    round_state: Phase,
    current_round: u32,
    current_turn: Option<Turn>,
    round_time_remaining: u32,
    active_round_id: Option<String>,
    round_started_at: Option<DateTime>,
    started_at: Option<DateTime>,
    ended_at: Option<DateTime>,
    created_by: UserId,
    created_at: DateTime,
    updated_at: DateTime,
}

impl From<Battle> for BattleDocument {
    fn from(value: Battle) -> Self {
        Self {
            id: value.id.to_string(),
            title: value.title,
            mode: value.mode,
            max_rounds: value.max_rounds,
            round_duration_secs: value.round_duration_secs,
            visibility: value.visibility,
            password_hash: value.password_hash,
            status: value.status,
            battle_state: value.battle_state,
            round_state: value.round_state,
            current_round: value.current_round,
            current_turn: value.current_turn,
            round_time_remaining: value.round_time_remaining,
            active_round_id: value.active_round_id.map(|id| id.to_string()),
            round_started_at: value.round_started_at.map(DateTime::from_system_time),
            started_at: value.started_at.map(DateTime::from_system_time),
            ended_at: value.ended_at.map(DateTime::from_system_time),
            created_by: value.created_by,
            created_at: DateTime::from_system_time(value.created_at),
            updated_at: DateTime::from_system_time(value.updated_at),
        }
    }
}

impl TryFrom<BattleDocument> for Battle {
    type Error = MongoDaoError;

    fn try_from(value: BattleDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(BATTLES, &value.id)?,
            title: value.title,
            mode: value.mode,
            max_rounds: value.max_rounds,
            round_duration_secs: value.round_duration_secs,
            visibility: value.visibility,
            password_hash: value.password_hash,
            status: value.status,
            battle_state: value.battle_state,
            round_state: value.round_state,
            current_round: value.current_round,
            current_turn: value.current_turn,
            round_time_remaining: value.round_time_remaining,
            active_round_id: value
                .active_round_id
                .as_deref()
                .map(|raw| parse_id(BATTLES, raw))
                .transpose()?,
            round_started_at: value.round_started_at.map(DateTime::to_system_time),
            started_at: value.started_at.map(DateTime::to_system_time),
            ended_at: value.ended_at.map(DateTime::to_system_time),
            created_by: value.created_by,
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub battle_id: String,
    pub round_number: u32,
    pub theme: Option<String>,
    pub beat_url: Option<String>,
}

impl TryFrom<RoundDocument> for Round {
    type Error = MongoDaoError;

    fn try_from(value: RoundDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(ROUNDS, &value.id)?,
            battle_id: parse_id(ROUNDS, &value.battle_id)?,
            round_number: value.round_number,
            theme: value.theme,
            beat_url: value.beat_url,
        })
    }
}

/// `exclusive_role` is only set for seats that at most one user may hold; a
/// partial unique index on it enforces the single holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantDocument {
    #[serde(rename = "_id")]
    id: String,
    battle_id: String,
    user_id: UserId,
    username: String,
    role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exclusive_role: Option<Role>,
    slot_number: Option<u32>,
    is_winner: bool,
    score: i64,
    joined_at: DateTime,
}

impl From<Participant> for ParticipantDocument {
    fn from(value: Participant) -> Self {
        Self {
            id: participant_key(value.battle_id, value.user_id),
            battle_id: value.battle_id.to_string(),
            user_id: value.user_id,
            username: value.username,
            role: value.role,
            exclusive_role: value.role.is_exclusive().then_some(value.role),
            slot_number: value.slot_number,
            is_winner: value.is_winner,
            score: value.score,
            joined_at: DateTime::from_system_time(value.joined_at),
        }
    }
}

impl TryFrom<ParticipantDocument> for Participant {
    type Error = MongoDaoError;

    fn try_from(value: ParticipantDocument) -> MongoResult<Self> {
        Ok(Self {
            battle_id: parse_id(PARTICIPANTS, &value.battle_id)?,
            user_id: value.user_id,
            username: value.username,
            role: value.role,
            slot_number: value.slot_number,
            is_winner: value.is_winner,
            score: value.score,
            joined_at: value.joined_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteDocument {
    #[serde(rename = "_id")]
    id: String,
    battle_id: String,
    round_id: String,
    voter_id: UserId,
    target_user_id: UserId,
    score: i64,
    cast_at: DateTime,
}

impl From<Vote> for VoteDocument {
    fn from(value: Vote) -> Self {
        Self {
            id: value.id.to_string(),
            battle_id: value.battle_id.to_string(),
            round_id: value.round_id.to_string(),
            voter_id: value.voter_id,
            target_user_id: value.target_user_id,
            score: value.score,
            cast_at: DateTime::from_system_time(value.cast_at),
        }
    }
}

impl TryFrom<VoteDocument> for Vote {
    type Error = MongoDaoError;

    fn try_from(value: VoteDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(VOTES, &value.id)?,
            battle_id: parse_id(VOTES, &value.battle_id)?,
            round_id: parse_id(VOTES, &value.round_id)?,
            voter_id: value.voter_id,
            target_user_id: value.target_user_id,
            score: value.score,
            cast_at: value.cast_at.to_system_time(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exclusive_roles_claim_the_seat_index() {
        let battle = Uuid::new_v4();
        let mc: ParticipantDocument = Participant::new(battle, 7, "mc".into(), Role::Mc1).into();
        let viewer: ParticipantDocument =
            Participant::new(battle, 8, "viewer".into(), Role::Viewer).into();
        assert_eq!(mc.exclusive_role, Some(Role::Mc1));
        assert_eq!(viewer.exclusive_role, None);
        assert_eq!(mc.id, format!("{battle}:7"));
    }

    #[test]
    fn malformed_ids_are_reported() {
        let err = parse_id(VOTES, "not-a-uuid").unwrap_err();
        assert!(matches!(err, MongoDaoError::Malformed { collection: VOTES, .. }));
    }
}
