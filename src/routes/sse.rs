use std::convert::Infallible;

use axum::{
    Router,
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;
use tracing::info;
use uuid::Uuid;

use crate::{error::AppError, services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/sse/battles/{id}",
    tag = "sse",
    params(("id" = String, Path, description = "Identifier of the battle to follow")),
    responses(
        (status = 200, description = "Battle event stream, starting with `battle.state`", content_type = "text/event-stream", body = String),
        (status = 404, description = "Unknown battle")
    )
)]
/// Stream the events of one battle to a read-only spectator.
pub async fn battle_stream(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (receiver, first) = sse_service::subscribe_battle(&state, id).await?;
    info!(battle_id = %id, "new spectator SSE connection");
    Ok(sse_service::to_sse_stream(state, id, first, receiver))
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sse/battles/{id}", get(battle_stream))
}
