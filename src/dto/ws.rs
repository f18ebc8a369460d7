use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::{
    dto::validation::{validate_beat_url, validate_not_blank},
    state::battle::{Role, UserId},
};

/// Commands accepted from WebSocket clients, tagged by `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum InboundCommand {
    /// Must be the first frame of every connection.
    #[serde(rename = "identify")]
    Identify { user_id: UserId, username: String },
    #[serde(rename = "battle.join")]
    Join {
        battle_id: Uuid,
        #[serde(default)]
        role: Option<Role>,
    },
    #[serde(rename = "battle.join.private")]
    JoinPrivate {
        battle_id: Uuid,
        password: String,
        #[serde(default)]
        role: Option<Role>,
    },
    #[serde(rename = "battle.start")]
    Start,
    #[serde(rename = "battle.round.start")]
    StartRound {
        #[serde(default)]
        round_number: Option<u32>,
        #[serde(default)]
        duration: Option<u32>,
    },
    #[serde(rename = "battle.turn.next")]
    NextTurn,
    #[serde(rename = "battle.round.end")]
    EndRound,
    #[serde(rename = "battle.finish")]
    Finish,
    #[serde(rename = "battle.vote")]
    Vote {
        target_user_id: UserId,
        /// Defaults to the active round.
        #[serde(default)]
        round_id: Option<Uuid>,
    },
    #[serde(rename = "battle.beat.select")]
    SelectBeat { round_number: u32, beat_url: String },
    #[serde(rename = "battle.device.control")]
    DeviceControl {
        target_user_id: UserId,
        device: Device,
        action: DeviceAction,
    },
    #[serde(rename = "battle.chat.send")]
    SendChat { message: String },
}

/// Why an inbound frame was refused before reaching a service.
#[derive(Debug, Error)]
pub enum InboundError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("validation failed: {0}")]
    Invalid(#[from] ValidationErrors),
}

impl InboundCommand {
    /// Parse and validate a text frame.
    pub fn from_json_str(text: &str) -> Result<Self, InboundError> {
        let command: Self = serde_json::from_str(text)?;
        command.validate()?;
        Ok(command)
    }

    /// Wire name echoed back in `command.accepted` / `command.rejected`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::Join { .. } => "battle.join",
            Self::JoinPrivate { .. } => "battle.join.private",
            Self::Start => "battle.start",
            Self::StartRound { .. } => "battle.round.start",
            Self::NextTurn => "battle.turn.next",
            Self::EndRound => "battle.round.end",
            Self::Finish => "battle.finish",
            Self::Vote { .. } => "battle.vote",
            Self::SelectBeat { .. } => "battle.beat.select",
            Self::DeviceControl { .. } => "battle.device.control",
            Self::SendChat { .. } => "battle.chat.send",
        }
    }
}

impl Validate for InboundCommand {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        match self {
            Self::Identify { username, .. } => {
                if let Err(e) = validate_not_blank(username) {
                    errors.add("username", e);
                }
            }
            Self::StartRound {
                round_number,
                duration,
            } => {
                if *round_number == Some(0) {
                    errors.add("roundNumber", validator::ValidationError::new("range"));
                }
                if *duration == Some(0) {
                    errors.add("duration", validator::ValidationError::new("range"));
                }
            }
            Self::SelectBeat {
                round_number,
                beat_url,
            } => {
                if *round_number == 0 {
                    errors.add("roundNumber", validator::ValidationError::new("range"));
                }
                if let Err(e) = validate_beat_url(beat_url) {
                    errors.add("beatUrl", e);
                }
            }
            Self::SendChat { message } => {
                if let Err(e) = validate_not_blank(message) {
                    errors.add("message", e);
                }
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Camera,
    Microphone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    Enable,
    Disable,
}

/// Device order relayed to a single participant's connection.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceControlMessage {
    pub battle_id: Uuid,
    pub from_user_id: UserId,
    pub device: Device,
    pub action: DeviceAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_commands() {
        let command =
            InboundCommand::from_json_str(r#"{"type":"battle.vote","targetUserId":10}"#).unwrap();
        assert!(matches!(
            command,
            InboundCommand::Vote {
                target_user_id: 10,
                round_id: None
            }
        ));

        let command = InboundCommand::from_json_str(
            r#"{"type":"battle.device.control","targetUserId":3,"device":"microphone","action":"disable"}"#,
        )
        .unwrap();
        assert_eq!(command.name(), "battle.device.control");
    }

    #[test]
    fn unit_commands_need_only_the_tag() {
        let command = InboundCommand::from_json_str(r#"{"type":"battle.turn.next"}"#).unwrap();
        assert!(matches!(command, InboundCommand::NextTurn));
    }

    #[test]
    fn rejects_unknown_and_invalid_commands() {
        assert!(matches!(
            InboundCommand::from_json_str(r#"{"type":"battle.explode"}"#),
            Err(InboundError::Malformed(_))
        ));
        assert!(matches!(
            InboundCommand::from_json_str(r#"{"type":"battle.round.start","duration":0}"#),
            Err(InboundError::Invalid(_))
        ));
        assert!(matches!(
            InboundCommand::from_json_str(
                r#"{"type":"battle.beat.select","roundNumber":1,"beatUrl":"not a url"}"#
            ),
            Err(InboundError::Invalid(_))
        ));
    }
}
