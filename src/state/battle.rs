use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Identifier handed over by the external identity provider.
pub type UserId = i64;

/// Competition format of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum BattleMode {
    /// Two MCs facing each other.
    #[serde(rename = "1v1")]
    OneVsOne,
    /// Two pairs of MCs.
    #[serde(rename = "2v2")]
    TwoVsTwo,
    /// Open stage, anyone holding an MC slot can perform.
    #[serde(rename = "openmic")]
    OpenMic,
}

/// Whether joining a battle requires a password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Anyone can join.
    Public,
    /// Joining requires the battle password.
    Private,
}

/// Coarse lifecycle status visible in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BattleStatus {
    /// Created, not started yet.
    Scheduled,
    /// Started and not finished.
    Live,
    /// Finished normally.
    Finished,
    /// Called off before completion.
    Cancelled,
}

/// Orchestration phase, shared by the battle and its current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Not started.
    Pending,
    /// In progress.
    Running,
    /// Over.
    Finished,
}

/// Which of the two primary competitors holds the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Turn {
    /// First MC.
    Mc1,
    /// Second MC.
    Mc2,
}

impl Turn {
    /// Next turn in the mc1/mc2 cycle. Anything that is not a turn restarts at mc1.
    pub fn alternate(current: Option<Turn>) -> Turn {
        match current {
            Some(Turn::Mc1) => Turn::Mc2,
            Some(Turn::Mc2) | None => Turn::Mc1,
        }
    }
}

/// Role a user holds inside one battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// First MC slot.
    Mc1,
    /// Second MC slot.
    Mc2,
    /// Controller of the battle.
    Moderator,
    /// Audience member.
    Viewer,
}

impl Role {
    /// Roles that at most one participant per battle may hold.
    pub fn is_exclusive(self) -> bool {
        !matches!(self, Role::Viewer)
    }

    /// Stable lowercase name, used as storage key.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Mc1 => "mc1",
            Role::Mc2 => "mc2",
            Role::Moderator => "moderator",
            Role::Viewer => "viewer",
        }
    }
}

/// Immutable configuration supplied when a battle is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BattleConfig {
    /// Human readable title.
    pub title: String,
    /// Competition format.
    pub mode: BattleMode,
    /// Number of rounds, at least one.
    pub max_rounds: u32,
    /// Default length of a round in seconds, at least one.
    pub round_duration_secs: u32,
    /// Public or private.
    pub visibility: Visibility,
    /// Argon2 PHC string, present for private battles.
    pub password_hash: Option<String>,
}

/// One live competition instance, the single shared mutable record per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Battle {
    /// Primary key.
    pub id: Uuid,
    /// Human readable title.
    pub title: String,
    /// Competition format.
    pub mode: BattleMode,
    /// Number of rounds.
    pub max_rounds: u32,
    /// Default round length in seconds.
    pub round_duration_secs: u32,
    /// Public or private.
    pub visibility: Visibility,
    /// Argon2 PHC string for private battles.
    pub password_hash: Option<String>,
    /// Coarse persisted status.
    pub status: BattleStatus,
    /// Battle level orchestration phase.
    pub battle_state: Phase,
    /// Phase of the current round.
    pub round_state: Phase,
    /// 1-based current round number.
    pub current_round: u32,
    /// Competitor holding the floor, `None` outside a running round.
    pub current_turn: Option<Turn>,
    /// Seconds left in the running round.
    pub round_time_remaining: u32,
    /// Round record votes are currently accepted for.
    pub active_round_id: Option<Uuid>,
    /// When the current round started.
    pub round_started_at: Option<SystemTime>,
    /// When the battle was first started.
    pub started_at: Option<SystemTime>,
    /// When the battle finished.
    pub ended_at: Option<SystemTime>,
    /// User that created the battle.
    pub created_by: UserId,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Last write timestamp.
    pub updated_at: SystemTime,
}

impl Battle {
    /// Build a fresh scheduled battle.
    pub fn new(config: BattleConfig, created_by: UserId) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::new_v4(),
            title: config.title,
            mode: config.mode,
            max_rounds: config.max_rounds,
            round_duration_secs: config.round_duration_secs,
            visibility: config.visibility,
            password_hash: config.password_hash,
            status: BattleStatus::Scheduled,
            battle_state: Phase::Pending,
            round_state: Phase::Pending,
            current_round: 1,
            current_turn: None,
            round_time_remaining: config.round_duration_secs,
            active_round_id: None,
            round_started_at: None,
            started_at: None,
            ended_at: None,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when votes can currently be accepted for `round_id`.
    pub fn accepts_votes_for(&self, round_id: Uuid) -> bool {
        self.round_state == Phase::Running && self.active_round_id == Some(round_id)
    }
}

/// One numbered round of a battle; exists as an anchor for votes and beats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    /// Primary key.
    pub id: Uuid,
    /// Owning battle.
    pub battle_id: Uuid,
    /// Unique within the battle.
    pub round_number: u32,
    /// Optional theme announced for the round.
    pub theme: Option<String>,
    /// Optional backing track.
    pub beat_url: Option<String>,
}

/// Fields applied when upserting a round; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundUpdate {
    /// New theme.
    pub theme: Option<String>,
    /// New beat URL.
    pub beat_url: Option<String>,
}

/// Binding of a user to a role inside one battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Owning battle.
    pub battle_id: Uuid,
    /// External user identifier.
    pub user_id: UserId,
    /// Display name captured at join time.
    pub username: String,
    /// Role inside the battle.
    pub role: Role,
    /// Optional slot for team formats.
    pub slot_number: Option<u32>,
    /// Set when the battle finishes.
    pub is_winner: bool,
    /// Total votes received, set when the battle finishes.
    pub score: i64,
    /// Join timestamp.
    pub joined_at: SystemTime,
}

impl Participant {
    /// New participant with empty terminal fields.
    pub fn new(battle_id: Uuid, user_id: UserId, username: String, role: Role) -> Self {
        Self {
            battle_id,
            user_id,
            username,
            role,
            slot_number: None,
            is_winner: false,
            score: 0,
            joined_at: SystemTime::now(),
        }
    }
}

/// One immutable audience ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Primary key.
    pub id: Uuid,
    /// Battle voted in.
    pub battle_id: Uuid,
    /// Round voted in.
    pub round_id: Uuid,
    /// Who voted.
    pub voter_id: UserId,
    /// Who received the vote.
    pub target_user_id: UserId,
    /// Weight of the ballot.
    pub score: i64,
    /// Cast timestamp.
    pub cast_at: SystemTime,
}

/// Summed votes for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VoteTotal {
    /// Who received the votes.
    pub target_user_id: UserId,
    /// Sum of the ballots.
    pub total: i64,
}
