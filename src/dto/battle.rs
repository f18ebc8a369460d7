use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    dto::{format_system_time, validation::validate_not_blank},
    state::battle::{
        Battle, BattleMode, BattleStatus, Participant, Phase, Role, Turn, UserId, Visibility,
        VoteTotal,
    },
};

/// Payload used to schedule a new battle. The caller becomes its moderator.
#[derive(Debug, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_private_password"))]
pub struct CreateBattleRequest {
    #[validate(length(min = 1, max = 120), custom(function = "validate_not_blank"))]
    pub title: String,
    pub mode: BattleMode,
    #[validate(range(min = 1, max = 50))]
    pub max_rounds: u32,
    #[validate(range(min = 1, max = 3600))]
    pub round_duration_seconds: u32,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    /// Required for private battles, ignored for public ones.
    #[serde(default)]
    #[validate(length(min = 4, max = 128))]
    pub password: Option<String>,
    /// Display name of the creating moderator.
    #[validate(length(min = 1, max = 64))]
    pub username: String,
}

fn default_visibility() -> Visibility {
    Visibility::Public
}

fn validate_private_password(request: &CreateBattleRequest) -> Result<(), ValidationError> {
    if request.visibility == Visibility::Private && request.password.is_none() {
        let mut err = ValidationError::new("password_required");
        err.message = Some("Private battles require a password".into());
        return Err(err);
    }
    Ok(())
}

/// Full current state of a battle, as pushed on `battle.state` and returned by `GET /battles/{id}`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BattleSnapshot {
    pub id: Uuid,
    pub title: String,
    pub mode: BattleMode,
    pub max_rounds: u32,
    pub round_duration_seconds: u32,
    pub visibility: Visibility,
    pub status: BattleStatus,
    pub battle_state: Phase,
    pub round_state: Phase,
    pub current_round: u32,
    /// `null` between rounds.
    #[serialize_always]
    pub current_turn: Option<Turn>,
    pub round_time_remaining: u32,
    pub active_round_id: Option<Uuid>,
    pub round_started_at: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub created_by: UserId,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Battle> for BattleSnapshot {
    fn from(battle: &Battle) -> Self {
        Self {
            id: battle.id,
            title: battle.title.clone(),
            mode: battle.mode,
            max_rounds: battle.max_rounds,
            round_duration_seconds: battle.round_duration_secs,
            visibility: battle.visibility,
            status: battle.status,
            battle_state: battle.battle_state,
            round_state: battle.round_state,
            current_round: battle.current_round,
            current_turn: battle.current_turn,
            round_time_remaining: battle.round_time_remaining,
            active_round_id: battle.active_round_id,
            round_started_at: battle.round_started_at.map(format_system_time),
            started_at: battle.started_at.map(format_system_time),
            ended_at: battle.ended_at.map(format_system_time),
            created_by: battle.created_by,
            created_at: format_system_time(battle.created_at),
            updated_at: format_system_time(battle.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    pub slot_number: Option<u32>,
    pub is_winner: bool,
    pub score: i64,
}

impl From<Participant> for ParticipantSummary {
    fn from(participant: Participant) -> Self {
        Self {
            user_id: participant.user_id,
            username: participant.username,
            role: participant.role,
            slot_number: participant.slot_number,
            is_winner: participant.is_winner,
            score: participant.score,
        }
    }
}

/// Query accepted by `GET /battles/{id}/tally`.
#[derive(Debug, Deserialize, IntoParams)]
pub struct TallyQuery {
    /// Round to tally; defaults to the active round.
    pub round_id: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TallyResponse {
    pub round_id: Uuid,
    pub votes: Vec<VoteTotal>,
}

/// Battle-wide standings.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultsResponse {
    pub battle_id: Uuid,
    pub winner_id: Option<UserId>,
    pub totals: Vec<VoteTotal>,
    pub participants: Vec<ParticipantSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::battle::BattleConfig;

    fn request(visibility: Visibility, password: Option<&str>) -> CreateBattleRequest {
        CreateBattleRequest {
            title: "Friday cypher".into(),
            mode: BattleMode::OneVsOne,
            max_rounds: 3,
            round_duration_seconds: 60,
            visibility,
            password: password.map(str::to_owned),
            username: "host".into(),
        }
    }

    #[test]
    fn private_battles_need_a_password() {
        assert!(request(Visibility::Private, None).validate().is_err());
        assert!(request(Visibility::Private, Some("secret123")).validate().is_ok());
        assert!(request(Visibility::Public, None).validate().is_ok());
    }

    #[test]
    fn bounds_are_checked() {
        let mut invalid = request(Visibility::Public, None);
        invalid.max_rounds = 0;
        assert!(invalid.validate().is_err());

        let mut blank = request(Visibility::Public, None);
        blank.title = "   ".into();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn snapshot_hides_the_password_and_keeps_null_turn() {
        let battle = Battle::new(
            BattleConfig {
                title: "t".into(),
                mode: BattleMode::OneVsOne,
                max_rounds: 3,
                round_duration_secs: 60,
                visibility: Visibility::Private,
                password_hash: Some("$argon2id$...".into()),
            },
            9,
        );
        let json = serde_json::to_value(BattleSnapshot::from(&battle)).unwrap();
        assert!(json.get("passwordHash").is_none());
        assert!(json.get("startedAt").is_none());
        assert!(json["currentTurn"].is_null());
        assert_eq!(json["roundDurationSeconds"], 60);
        assert_eq!(json["createdBy"], 9);
    }
}
