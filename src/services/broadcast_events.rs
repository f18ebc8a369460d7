use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    dto::{
        battle::BattleSnapshot,
        format_system_time,
        sse::{
            BattleFinishedEvent, BattleStartedEvent, BeatSelectedEvent, ChatMessageEvent,
            ParticipantJoinedEvent, RoundEndedEvent, RoundStartedEvent, RoundTickEvent,
            ServerEvent, TurnChangedEvent, VoteCastEvent,
        },
    },
    state::{
        SharedState,
        battle::{Battle, Participant, Round, UserId, VoteTotal},
    },
};

pub const EVENT_STATE: &str = "battle.state";
pub const EVENT_STARTED: &str = "battle.started";
pub const EVENT_ROUND_STARTED: &str = "battle.round.started";
pub const EVENT_TURN_CHANGED: &str = "battle.turn.changed";
pub const EVENT_ROUND_TICK: &str = "battle.round.tick";
pub const EVENT_ROUND_ENDED: &str = "battle.round.ended";
pub const EVENT_FINISHED: &str = "battle.finished";
pub const EVENT_VOTE_CAST: &str = "battle.vote.cast";
pub const EVENT_BEAT_SELECTED: &str = "battle.beat.selected";
pub const EVENT_PARTICIPANT_JOINED: &str = "battle.participant.joined";
pub const EVENT_CHAT_MESSAGE: &str = "battle.chat.message";

/// Build the `battle.state` event for `battle`.
pub fn state_event(battle: &Battle) -> Option<ServerEvent> {
    build_event(EVENT_STATE, &BattleSnapshot::from(battle))
}

/// Broadcast the full current state of a battle.
pub fn broadcast_state(state: &SharedState, battle: &Battle) {
    if let Some(event) = state_event(battle) {
        publish(state, battle.id, event);
    }
}

pub fn broadcast_started(state: &SharedState, battle: &Battle) {
    let payload = BattleStartedEvent {
        battle_id: battle.id,
        started_at: battle.started_at.map(format_system_time),
    };
    send_battle_event(state, battle.id, EVENT_STARTED, &payload);
}

pub fn broadcast_round_started(state: &SharedState, battle: &Battle, round: &Round) {
    let payload = RoundStartedEvent {
        battle_id: battle.id,
        round_id: round.id,
        round_number: round.round_number,
        duration: battle.round_time_remaining,
        theme: round.theme.clone(),
        beat_url: round.beat_url.clone(),
    };
    send_battle_event(state, battle.id, EVENT_ROUND_STARTED, &payload);
}

pub fn broadcast_turn_changed(state: &SharedState, battle: &Battle) {
    let payload = TurnChangedEvent {
        battle_id: battle.id,
        current_turn: battle.current_turn,
    };
    send_battle_event(state, battle.id, EVENT_TURN_CHANGED, &payload);
}

pub fn broadcast_round_tick(state: &SharedState, battle_id: Uuid, remaining: u32) {
    let payload = RoundTickEvent {
        battle_id,
        round_time_remaining: remaining,
    };
    send_battle_event(state, battle_id, EVENT_ROUND_TICK, &payload);
}

/// `ended_round` is the round that just closed; the battle already points at the next one.
pub fn broadcast_round_ended(state: &SharedState, battle: &Battle, ended_round: u32, auto: bool) {
    let payload = RoundEndedEvent {
        battle_id: battle.id,
        round_number: ended_round,
        next_round: battle.current_round,
        auto,
    };
    send_battle_event(state, battle.id, EVENT_ROUND_ENDED, &payload);
}

pub fn broadcast_finished(
    state: &SharedState,
    battle_id: Uuid,
    winner_id: Option<UserId>,
    totals: Vec<VoteTotal>,
) {
    let payload = BattleFinishedEvent {
        battle_id,
        winner_id,
        totals,
    };
    send_battle_event(state, battle_id, EVENT_FINISHED, &payload);
}

/// Broadcast the running tally of a round after an accepted ballot.
pub fn broadcast_vote_cast(state: &SharedState, battle_id: Uuid, round_id: Uuid, votes: Vec<VoteTotal>) {
    let payload = VoteCastEvent {
        battle_id,
        round_id,
        votes,
    };
    send_battle_event(state, battle_id, EVENT_VOTE_CAST, &payload);
}

pub fn broadcast_beat_selected(state: &SharedState, battle_id: Uuid, round_number: u32, beat_url: &str) {
    let payload = BeatSelectedEvent {
        round_number,
        beat_url: beat_url.to_owned(),
    };
    send_battle_event(state, battle_id, EVENT_BEAT_SELECTED, &payload);
}

pub fn broadcast_participant_joined(state: &SharedState, participant: &Participant) {
    let payload = ParticipantJoinedEvent {
        user_id: participant.user_id,
        username: participant.username.clone(),
        role: participant.role,
    };
    send_battle_event(state, participant.battle_id, EVENT_PARTICIPANT_JOINED, &payload);
}

pub fn broadcast_chat_message(state: &SharedState, battle_id: Uuid, message: &ChatMessageEvent) {
    send_battle_event(state, battle_id, EVENT_CHAT_MESSAGE, message);
}

/// Serialise `payload` under `event`, logging instead of failing.
pub fn build_event<T: Serialize>(event: &str, payload: &T) -> Option<ServerEvent> {
    match ServerEvent::json(event, payload) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(event, error = %err, "failed to serialize server event");
            None
        }
    }
}

fn send_battle_event<T: Serialize>(state: &SharedState, battle_id: Uuid, event: &str, payload: &T) {
    if let Some(message) = build_event(event, payload) {
        publish(state, battle_id, message);
    }
}

fn publish(state: &SharedState, battle_id: Uuid, message: ServerEvent) {
    let event = message.event.clone();
    let receivers = state.hub().publish(battle_id, message);
    debug!(%battle_id, event = %event, receivers, "battle event published");
}
