use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::sse::ServerEvent,
    error::ServiceError,
    services::{battle_service, broadcast_events},
    state::SharedState,
};

/// Subscribe to a battle topic for a read-only spectator.
///
/// Returns the receiver together with the snapshot event to send first. The
/// subscription is taken before the snapshot is read so nothing in between
/// is lost.
pub async fn subscribe_battle(
    state: &SharedState,
    battle_id: Uuid,
) -> Result<(broadcast::Receiver<ServerEvent>, Option<ServerEvent>), ServiceError> {
    let receiver = state.hub().subscribe(battle_id);
    match battle_service::snapshot(state, battle_id).await {
        Ok(battle) => Ok((receiver, broadcast_events::state_event(&battle))),
        Err(err) => {
            drop(receiver);
            state.hub().prune(battle_id);
            Err(err)
        }
    }
}

/// Convert a battle subscription into an SSE response, forwarding events
/// until the client disconnects. The topic is pruned once it has no listener left.
pub fn to_sse_stream(
    state: SharedState,
    battle_id: Uuid,
    first: Option<ServerEvent>,
    mut receiver: broadcast::Receiver<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        if let Some(first) = first {
            if tx.send(Ok(to_event(first))).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            // Skip lagged messages but keep the stream alive.
                            warn!(%battle_id, skipped, "spectator stream lagged");
                            continue;
                        }
                    }
                }
            }
        }

        drop(receiver);
        state.release_idle_battle(battle_id);
        info!(%battle_id, "spectator SSE stream disconnected");
    });

    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn to_event(payload: ServerEvent) -> Event {
    Event::default().event(payload.event).data(payload.data)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig, dao::battle_store::memory::MemoryBattleStore,
        dto::battle::CreateBattleRequest, state::AppState, state::battle::{BattleMode, Visibility},
    };

    #[tokio::test]
    async fn spectators_get_the_snapshot_first() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryBattleStore::new()));
        let battle = battle_service::create_battle(
            &state,
            1,
            CreateBattleRequest {
                title: "cypher".into(),
                mode: BattleMode::OneVsOne,
                max_rounds: 2,
                round_duration_seconds: 30,
                visibility: Visibility::Public,
                password: None,
                username: "host".into(),
            },
        )
        .await
        .unwrap();

        let (_receiver, first) = subscribe_battle(&state, battle.id).await.unwrap();
        let first = first.unwrap();
        assert_eq!(first.event, broadcast_events::EVENT_STATE);
        assert_eq!(state.hub().subscriber_count(battle.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_releases_the_topic() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryBattleStore::new()));
        let battle_id = Uuid::new_v4();
        let receiver = state.hub().subscribe(battle_id);

        let sse = to_sse_stream(Arc::clone(&state), battle_id, None, receiver);
        assert_eq!(state.hub().subscriber_count(battle_id), 1);
        drop(sse);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(state.hub().subscriber_count(battle_id), 0);
        assert!(!state.release_idle_battle(battle_id));
    }

    #[tokio::test]
    async fn unknown_battles_leave_no_topic_behind() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryBattleStore::new()));
        let battle_id = Uuid::new_v4();
        let err = subscribe_battle(&state, battle_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert_eq!(state.hub().subscriber_count(battle_id), 0);
    }
}
