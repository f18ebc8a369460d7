use serde::Serialize;
use serde_with::skip_serializing_none;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::ErrorKind,
    services::access_control::MediaGrant,
    state::battle::{Role, Turn, UserId, VoteTotal},
};

#[derive(Clone, Debug)]
/// Named payload fanned out on a battle topic or sent to a single connection.
pub struct ServerEvent {
    pub event: String,
    pub data: String,
}

impl ServerEvent {
    /// Wrap an already serialised JSON payload.
    pub fn new(event: impl Into<String>, data: String) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Convenience wrapper that serialises `payload` into the data field.
    pub fn json<T>(event: impl Into<String>, payload: &T) -> serde_json::Result<Self>
    where
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }

    /// WebSocket text frame: `{"event": <name>, "data": <payload>}`.
    pub fn to_envelope(&self) -> String {
        let name = serde_json::Value::String(self.event.clone());
        format!(r#"{{"event":{name},"data":{}}}"#, self.data)
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast when the battle goes live.
pub struct BattleStartedEvent {
    pub battle_id: Uuid,
    pub started_at: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast when a round countdown begins.
pub struct RoundStartedEvent {
    pub battle_id: Uuid,
    pub round_id: Uuid,
    pub round_number: u32,
    pub duration: u32,
    pub theme: Option<String>,
    pub beat_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast when the floor passes to the other competitor.
pub struct TurnChangedEvent {
    pub battle_id: Uuid,
    pub current_turn: Option<Turn>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast once per elapsed second of a running round.
pub struct RoundTickEvent {
    pub battle_id: Uuid,
    pub round_time_remaining: u32,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast when a round ends, manually or on timeout.
pub struct RoundEndedEvent {
    pub battle_id: Uuid,
    pub round_number: u32,
    pub next_round: u32,
    pub auto: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast when the battle is closed with its final standings.
pub struct BattleFinishedEvent {
    pub battle_id: Uuid,
    pub winner_id: Option<UserId>,
    pub totals: Vec<VoteTotal>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast after each accepted ballot with the round's running tally.
pub struct VoteCastEvent {
    pub battle_id: Uuid,
    pub round_id: Uuid,
    pub votes: Vec<VoteTotal>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BeatSelectedEvent {
    pub round_number: u32,
    pub beat_url: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoinedEvent {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Chat line relayed to the battle topic. Not persisted.
pub struct ChatMessageEvent {
    pub id: Uuid,
    pub user_id: UserId,
    pub username: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Direct reply to a connection that joined a battle.
pub struct JoinedEvent {
    pub battle_id: Uuid,
    pub role: Role,
    pub media: MediaGrant,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundEvent {
    pub battle_id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandAcceptedEvent {
    pub command: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Direct reply to a refused command; other subscribers never see it.
pub struct CommandRejectedEvent {
    pub command: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wraps_payload_verbatim() {
        let event = ServerEvent::json(
            "battle.round.tick",
            &RoundTickEvent {
                battle_id: Uuid::nil(),
                round_time_remaining: 4,
            },
        )
        .unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&event.to_envelope()).unwrap();
        assert_eq!(envelope["event"], "battle.round.tick");
        assert_eq!(envelope["data"]["roundTimeRemaining"], 4);
    }

    #[test]
    fn envelope_escapes_event_names() {
        let event = ServerEvent::new("odd\"name", "null".to_string());
        let envelope: serde_json::Value = serde_json::from_str(&event.to_envelope()).unwrap();
        assert_eq!(envelope["event"], "odd\"name");
    }

    #[test]
    fn optional_round_fields_are_omitted() {
        let payload = serde_json::to_value(RoundStartedEvent {
            battle_id: Uuid::nil(),
            round_id: Uuid::nil(),
            round_number: 1,
            duration: 60,
            theme: None,
            beat_url: None,
        })
        .unwrap();
        assert!(payload.get("beatUrl").is_none());
        assert_eq!(payload["duration"], 60);
    }
}
