use std::time::SystemTime;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::{
        format_system_time,
        sse::{
            ChatMessageEvent, CommandAcceptedEvent, CommandRejectedEvent, JoinedEvent,
            NotFoundEvent, ServerEvent,
        },
        ws::{DeviceControlMessage, InboundCommand},
    },
    error::ServiceError,
    services::{
        access_control::{media_grant, resolve_controller},
        battle_service, broadcast_events, vote_service,
    },
    state::{
        SessionConnection, SharedState,
        battle::{Role, UserId},
    },
};

const EVENT_JOINED: &str = "battle.joined";
const EVENT_NOT_FOUND: &str = "battle.not_found";
const EVENT_DEVICE_CONTROL: &str = "battle.device.control";
const EVENT_ACCEPTED: &str = "command.accepted";
const EVENT_REJECTED: &str = "command.rejected";

/// Internal error type for command handling.
///
/// Distinct from `ServiceError`: a closed writer ends the connection, a
/// service failure only rejects the command.
#[derive(Debug, Error)]
enum CommandError {
    /// Writer channel closed - connection should be terminated immediately.
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Rejected(#[from] ServiceError),
}

/// Per-connection state after a successful `identify`.
struct Session {
    connection_id: Uuid,
    user_id: UserId,
    username: String,
    tx: mpsc::UnboundedSender<Message>,
    joined: Option<JoinedBattle>,
}

struct JoinedBattle {
    battle_id: Uuid,
    forwarder: JoinHandle<()>,
}

impl Session {
    fn battle_id(&self) -> Result<Uuid, ServiceError> {
        self.joined
            .as_ref()
            .map(|joined| joined.battle_id)
            .ok_or_else(|| ServiceError::InvalidInput("join a battle first".into()))
    }

    /// Unsubscribe from the current battle topic, if any.
    ///
    /// Only this connection's session entry is removed; a newer connection of
    /// the same user keeps its own. The topic is pruned once nobody listens.
    async fn leave(&mut self, state: &SharedState) {
        let Some(joined) = self.joined.take() else {
            return;
        };
        joined.forwarder.abort();
        // The receiver is dropped together with the aborted task.
        let _ = joined.forwarder.await;
        state
            .sessions()
            .remove_if(&(joined.battle_id, self.user_id), |_, connection| {
                connection.connection_id == self.connection_id
            });
        if state.release_idle_battle(joined.battle_id) {
            debug!(battle_id = %joined.battle_id, "last listener left battle topic");
        }
        debug!(battle_id = %joined.battle_id, user_id = self.user_id, "left battle topic");
    }
}

/// Handle the full lifecycle of one participant WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let ident_timeout = state.config().identification_timeout();
    let initial_message = match tokio::time::timeout(ident_timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("websocket identification timed out");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let (user_id, username) = match InboundCommand::from_json_str(&initial_message) {
        Ok(InboundCommand::Identify { user_id, username }) => (user_id, username),
        Ok(other) => {
            warn!(command = other.name(), "first message was not identify");
            let _ = send_rejected(
                &outbound_tx,
                other.name(),
                &ServiceError::Unauthorized("identify first".into()),
            );
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to parse or validate identify message");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let mut session = Session {
        connection_id: Uuid::new_v4(),
        user_id,
        username,
        tx: outbound_tx.clone(),
        joined: None,
    };
    info!(user_id, connection_id = %session.connection_id, "participant connected");

    if send_direct(&outbound_tx, EVENT_ACCEPTED, &accepted("identify")).is_ok() {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    debug!(user_id, payload = %text, "received command");
                    let command = match InboundCommand::from_json_str(&text) {
                        Ok(command) => command,
                        Err(err) => {
                            let name = command_name_of(&text);
                            let error = ServiceError::InvalidInput(err.to_string());
                            if send_rejected(&outbound_tx, &name, &error).is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let name = command.name();
                    let outcome = match handle_command(&state, &mut session, command).await {
                        Ok(()) => send_direct(&outbound_tx, EVENT_ACCEPTED, &accepted(name)),
                        Err(CommandError::Rejected(err)) => {
                            debug!(user_id, command = name, error = %err, "command rejected");
                            send_rejected(&outbound_tx, name, &err)
                        }
                        Err(CommandError::ConnectionClosed) => Err(CommandError::ConnectionClosed),
                    };
                    if outcome.is_err() {
                        info!(user_id, "connection closed while replying, terminating");
                        break;
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = outbound_tx.send(Message::Pong(payload));
                }
                Ok(Message::Close(frame)) => {
                    let _ = outbound_tx.send(Message::Close(frame));
                    break;
                }
                Ok(Message::Binary(_)) | Ok(Message::Pong(_)) => {}
                Err(err) => {
                    warn!(user_id, error = %err, "websocket error");
                    break;
                }
            }
        }
    }

    session.leave(&state).await;
    drop(session);
    info!(user_id, "participant disconnected");
    finalize(writer_task, outbound_tx).await;
}

async fn handle_command(
    state: &SharedState,
    session: &mut Session,
    command: InboundCommand,
) -> Result<(), CommandError> {
    let user_id = session.user_id;
    match command {
        InboundCommand::Identify { .. } => Err(ServiceError::InvalidState(
            "connection is already identified".into(),
        )
        .into()),
        InboundCommand::Join { battle_id, role } => {
            handle_join(state, session, battle_id, role, None).await
        }
        InboundCommand::JoinPrivate {
            battle_id,
            password,
            role,
        } => handle_join(state, session, battle_id, role, Some(password)).await,
        InboundCommand::Start => {
            battle_service::start(state, session.battle_id()?, user_id).await?;
            Ok(())
        }
        InboundCommand::StartRound {
            round_number,
            duration,
        } => {
            battle_service::start_round(state, session.battle_id()?, user_id, round_number, duration)
                .await?;
            Ok(())
        }
        InboundCommand::NextTurn => {
            battle_service::next_turn(state, session.battle_id()?, user_id).await?;
            Ok(())
        }
        InboundCommand::EndRound => {
            battle_service::end_round(state, session.battle_id()?, user_id).await?;
            Ok(())
        }
        InboundCommand::Finish => {
            battle_service::finish(state, session.battle_id()?, user_id).await?;
            Ok(())
        }
        InboundCommand::Vote {
            target_user_id,
            round_id,
        } => {
            vote_service::cast_vote(state, session.battle_id()?, round_id, user_id, target_user_id)
                .await?;
            Ok(())
        }
        InboundCommand::SelectBeat {
            round_number,
            beat_url,
        } => {
            battle_service::select_beat(state, session.battle_id()?, user_id, round_number, beat_url)
                .await?;
            Ok(())
        }
        InboundCommand::DeviceControl {
            target_user_id,
            device,
            action,
        } => {
            let battle_id = session.battle_id()?;
            let store = state.require_battle_store().await?;
            resolve_controller(&store, battle_id, user_id).await?;

            let target_tx = state
                .sessions()
                .get(&(battle_id, target_user_id))
                .map(|connection| connection.tx.clone())
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("user `{target_user_id}` is not connected"))
                })?;
            let message = DeviceControlMessage {
                battle_id,
                from_user_id: user_id,
                device,
                action,
            };
            if send_direct(&target_tx, EVENT_DEVICE_CONTROL, &message).is_err() {
                state
                    .sessions()
                    .remove_if(&(battle_id, target_user_id), |_, connection| {
                        connection.tx.same_channel(&target_tx)
                    });
                return Err(ServiceError::NotFound(format!(
                    "user `{target_user_id}` is not connected"
                ))
                .into());
            }
            info!(%battle_id, target_user_id, ?device, ?action, "device control relayed");
            Ok(())
        }
        InboundCommand::SendChat { message } => {
            let battle_id = session.battle_id()?;
            let chat = ChatMessageEvent {
                id: Uuid::new_v4(),
                user_id,
                username: session.username.clone(),
                message: truncate_chat(&message, state.config().chat_max_chars),
                timestamp: format_system_time(SystemTime::now()),
            };
            broadcast_events::broadcast_chat_message(state, battle_id, &chat);
            Ok(())
        }
    }
}

/// Join a battle topic and resynchronise this connection with a fresh snapshot.
async fn handle_join(
    state: &SharedState,
    session: &mut Session,
    battle_id: Uuid,
    role: Option<Role>,
    password: Option<String>,
) -> Result<(), CommandError> {
    let outcome = match battle_service::join(
        state,
        battle_id,
        session.user_id,
        session.username.clone(),
        role,
        password.as_deref(),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(ServiceError::NotFound(message)) => {
            send_direct(&session.tx, EVENT_NOT_FOUND, &NotFoundEvent { battle_id })?;
            return Err(ServiceError::NotFound(message).into());
        }
        Err(err) => return Err(err.into()),
    };

    session.leave(state).await;
    // Subscribe before reading the snapshot so nothing published in between is lost.
    let receiver = state.hub().subscribe(battle_id);
    let battle = battle_service::snapshot(state, battle_id)
        .await
        .unwrap_or(outcome.battle);

    let role = outcome.participant.role;
    send_direct(
        &session.tx,
        EVENT_JOINED,
        &JoinedEvent {
            battle_id,
            role,
            media: media_grant(role),
        },
    )?;
    if let Some(snapshot) = broadcast_events::state_event(&battle) {
        push(&session.tx, &snapshot)?;
    }

    state.sessions().insert(
        (battle_id, session.user_id),
        SessionConnection {
            connection_id: session.connection_id,
            tx: session.tx.clone(),
        },
    );
    session.joined = Some(JoinedBattle {
        battle_id,
        forwarder: spawn_forwarder(battle_id, receiver, session.tx.clone()),
    });
    info!(%battle_id, user_id = session.user_id, role = role.as_str(), "connection joined battle");
    Ok(())
}

/// Relay battle topic events to one connection until either side goes away.
fn spawn_forwarder(
    battle_id: Uuid,
    mut receiver: broadcast::Receiver<ServerEvent>,
    tx: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if push(&tx, &event).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%battle_id, skipped, "slow subscriber skipped battle events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Keep at most `max_chars` characters of a chat line.
pub fn truncate_chat(message: &str, max_chars: usize) -> String {
    message.trim().chars().take(max_chars).collect()
}

fn accepted(command: &str) -> CommandAcceptedEvent {
    CommandAcceptedEvent {
        command: command.to_owned(),
    }
}

fn send_rejected(
    tx: &mpsc::UnboundedSender<Message>,
    command: &str,
    error: &ServiceError,
) -> Result<(), CommandError> {
    let payload = CommandRejectedEvent {
        command: command.to_owned(),
        kind: error.kind(),
        message: error.to_string(),
    };
    send_direct(tx, EVENT_REJECTED, &payload)
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Serialization failures are logged and swallowed; a closed writer is an error.
fn send_direct<T>(
    tx: &mpsc::UnboundedSender<Message>,
    event: &str,
    payload: &T,
) -> Result<(), CommandError>
where
    T: Serialize,
{
    match broadcast_events::build_event(event, payload) {
        Some(message) => push(tx, &message),
        None => Ok(()),
    }
}

fn push(tx: &mpsc::UnboundedSender<Message>, event: &ServerEvent) -> Result<(), CommandError> {
    tx.send(Message::Text(event.to_envelope().into()))
        .map_err(|_| CommandError::ConnectionClosed)
}

/// Best-effort command name of a frame that failed to parse.
fn command_name_of(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("type")?.as_str().map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
