//! Who may drive a battle, who may vote, and who may publish media.

use std::sync::Arc;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::battle_store::BattleStore,
    error::ServiceError,
    state::battle::{Battle, Participant, Role, UserId, Visibility},
};

/// Outcome of the ballot pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteEligibility {
    Allowed,
    AlreadyVoted,
    NoActiveRound,
}

/// Media rights handed to the external transport for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MediaGrant {
    pub can_publish: bool,
    pub can_subscribe: bool,
}

/// Load the participant issuing a control command, failing unless they moderate the battle.
pub async fn resolve_controller(
    store: &Arc<dyn BattleStore>,
    battle_id: Uuid,
    user_id: UserId,
) -> Result<Participant, ServiceError> {
    let participant = store
        .find_participant(battle_id, user_id)
        .await?
        .ok_or_else(|| {
            ServiceError::Unauthorized(format!("user `{user_id}` is not part of this battle"))
        })?;

    if participant.role != Role::Moderator {
        debug!(%battle_id, user_id, role = participant.role.as_str(), "control command denied");
        return Err(ServiceError::Unauthorized(
            "only the moderator can control the battle".into(),
        ));
    }
    Ok(participant)
}

/// Check whether `voter_id` may cast a ballot for `round_id`.
///
/// This only short-circuits obvious repeats; the unique insert remains the
/// authority on duplicates.
pub async fn resolve_vote_eligibility(
    store: &Arc<dyn BattleStore>,
    battle: &Battle,
    round_id: Uuid,
    voter_id: UserId,
) -> Result<VoteEligibility, ServiceError> {
    if !battle.accepts_votes_for(round_id) {
        return Ok(VoteEligibility::NoActiveRound);
    }
    if store
        .find_vote(battle.id, round_id, voter_id)
        .await?
        .is_some()
    {
        return Ok(VoteEligibility::AlreadyVoted);
    }
    Ok(VoteEligibility::Allowed)
}

/// Private battles admit a newcomer only with the right password.
pub fn verify_join_password(battle: &Battle, password: &str) -> Result<(), ServiceError> {
    if battle.visibility != Visibility::Private {
        return Ok(());
    }
    let Some(stored) = battle.password_hash.as_deref() else {
        warn!(battle_id = %battle.id, "private battle has no password hash");
        return Err(ServiceError::Unauthorized("invalid password".into()));
    };
    let parsed = PasswordHash::new(stored).map_err(|err| {
        warn!(battle_id = %battle.id, error = %err, "stored password hash is unreadable");
        ServiceError::Unauthorized("invalid password".into())
    })?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| ServiceError::Unauthorized("invalid password".into()))
}

/// Hash a join password into an Argon2 PHC string.
pub fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|err| ServiceError::InvalidInput(format!("cannot derive salt: {err}")))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ServiceError::InvalidInput(format!("cannot hash password: {err}")))
}

/// Competitors and the moderator publish; everyone subscribes.
pub fn media_grant(role: Role) -> MediaGrant {
    MediaGrant {
        can_publish: matches!(role, Role::Mc1 | Role::Mc2 | Role::Moderator),
        can_subscribe: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::battle_store::memory::MemoryBattleStore;
    use crate::state::battle::{BattleConfig, BattleMode, Phase, Vote};

    fn battle(visibility: Visibility, password_hash: Option<String>) -> Battle {
        Battle::new(
            BattleConfig {
                title: "cypher".into(),
                mode: BattleMode::OneVsOne,
                max_rounds: 3,
                round_duration_secs: 60,
                visibility,
                password_hash,
            },
            1,
        )
    }

    #[test]
    fn password_round_trip() {
        let hash = hash_password("secret123").unwrap();
        assert!(hash.starts_with("$argon2"));
        let private = battle(Visibility::Private, Some(hash));
        assert!(verify_join_password(&private, "secret123").is_ok());
        assert!(matches!(
            verify_join_password(&private, "wrong"),
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[test]
    fn public_battles_need_no_password() {
        assert!(verify_join_password(&battle(Visibility::Public, None), "").is_ok());
    }

    #[test]
    fn only_performers_publish() {
        assert!(media_grant(Role::Mc1).can_publish);
        assert!(media_grant(Role::Moderator).can_publish);
        let viewer = media_grant(Role::Viewer);
        assert!(!viewer.can_publish);
        assert!(viewer.can_subscribe);
    }

    #[tokio::test]
    async fn controller_must_be_the_moderator() {
        let store: Arc<dyn BattleStore> = Arc::new(MemoryBattleStore::new());
        let b = battle(Visibility::Public, None);
        store
            .insert_participant(Participant::new(b.id, 1, "mod".into(), Role::Moderator))
            .await
            .unwrap();
        store
            .insert_participant(Participant::new(b.id, 2, "mc".into(), Role::Mc1))
            .await
            .unwrap();

        assert!(resolve_controller(&store, b.id, 1).await.is_ok());
        assert!(matches!(
            resolve_controller(&store, b.id, 2).await,
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(matches!(
            resolve_controller(&store, b.id, 3).await,
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn eligibility_follows_round_and_ballots() {
        let store: Arc<dyn BattleStore> = Arc::new(MemoryBattleStore::new());
        let mut b = battle(Visibility::Public, None);
        let round_id = Uuid::new_v4();
        assert_eq!(
            resolve_vote_eligibility(&store, &b, round_id, 5).await.unwrap(),
            VoteEligibility::NoActiveRound
        );

        b.battle_state = Phase::Running;
        b.round_state = Phase::Running;
        b.active_round_id = Some(round_id);
        assert_eq!(
            resolve_vote_eligibility(&store, &b, round_id, 5).await.unwrap(),
            VoteEligibility::Allowed
        );

        store
            .insert_vote(Vote {
                id: Uuid::new_v4(),
                battle_id: b.id,
                round_id,
                voter_id: 5,
                target_user_id: 10,
                score: 1,
                cast_at: std::time::SystemTime::now(),
            })
            .await
            .unwrap();
        assert_eq!(
            resolve_vote_eligibility(&store, &b, round_id, 5).await.unwrap(),
            VoteEligibility::AlreadyVoted
        );
    }
}
