use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::battle::{
        BattleSnapshot, CreateBattleRequest, ParticipantSummary, ResultsResponse, TallyQuery,
        TallyResponse,
    },
    error::AppError,
    services::{battle_service, vote_service},
    state::{SharedState, battle::UserId},
};

const USER_ID_HEADER: &str = "x-user-id";

/// Battle lifecycle endpoints that do not need a live socket.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/battles", post(create_battle))
        .route("/battles/{id}", get(get_battle).delete(delete_battle))
        .route("/battles/{id}/tally", get(get_tally))
        .route("/battles/{id}/results", get(get_results))
}

/// Schedule a new battle; the caller becomes its moderator.
#[utoipa::path(
    post,
    path = "/battles",
    tag = "battles",
    params(("X-User-Id" = i64, Header, description = "Identifier of the calling user")),
    request_body = CreateBattleRequest,
    responses(
        (status = 201, description = "Battle created", body = BattleSnapshot),
        (status = 400, description = "Invalid payload")
    )
)]
pub async fn create_battle(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Valid(Json(payload)): Valid<Json<CreateBattleRequest>>,
) -> Result<(StatusCode, Json<BattleSnapshot>), AppError> {
    let caller = caller_id(&headers)?;
    let battle = battle_service::create_battle(&state, caller, payload).await?;
    Ok((StatusCode::CREATED, Json(BattleSnapshot::from(&battle))))
}

/// Current state of a battle.
#[utoipa::path(
    get,
    path = "/battles/{id}",
    tag = "battles",
    params(("id" = String, Path, description = "Identifier of the battle")),
    responses(
        (status = 200, description = "Battle snapshot", body = BattleSnapshot),
        (status = 404, description = "Unknown battle")
    )
)]
pub async fn get_battle(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BattleSnapshot>, AppError> {
    let battle = battle_service::snapshot(&state, id).await?;
    Ok(Json(BattleSnapshot::from(&battle)))
}

/// Delete a battle, its rounds, participants and votes.
#[utoipa::path(
    delete,
    path = "/battles/{id}",
    tag = "battles",
    params(
        ("X-User-Id" = i64, Header, description = "Identifier of the calling user"),
        ("id" = String, Path, description = "Identifier of the battle")
    ),
    responses(
        (status = 204, description = "Battle deleted"),
        (status = 401, description = "Caller is neither creator nor moderator")
    )
)]
pub async fn delete_battle(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let caller = caller_id(&headers)?;
    battle_service::delete_battle(&state, id, caller).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Per-target totals of one round.
#[utoipa::path(
    get,
    path = "/battles/{id}/tally",
    tag = "battles",
    params(("id" = String, Path, description = "Identifier of the battle"), TallyQuery),
    responses((status = 200, description = "Round tally", body = TallyResponse))
)]
pub async fn get_tally(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TallyQuery>,
) -> Result<Json<TallyResponse>, AppError> {
    let round_id = match query.round_id {
        Some(round_id) => round_id,
        None => battle_service::snapshot(&state, id)
            .await?
            .active_round_id
            .ok_or_else(|| AppError::BadRequest("no active round; pass `round_id`".into()))?,
    };
    let votes = vote_service::tally(&state, id, round_id).await?;
    Ok(Json(TallyResponse { round_id, votes }))
}

/// Battle-wide totals, winner and final participant scores.
#[utoipa::path(
    get,
    path = "/battles/{id}/results",
    tag = "battles",
    params(("id" = String, Path, description = "Identifier of the battle")),
    responses((status = 200, description = "Battle results", body = ResultsResponse))
)]
pub async fn get_results(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResultsResponse>, AppError> {
    let participants = battle_service::participants(&state, id).await?;
    let tally = vote_service::final_tally(&state, id).await?;
    Ok(Json(ResultsResponse {
        battle_id: id,
        winner_id: tally.winner_id,
        totals: tally.totals,
        participants: participants
            .into_iter()
            .map(ParticipantSummary::from)
            .collect(),
    }))
}

fn caller_id(headers: &HeaderMap) -> Result<UserId, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<UserId>().ok())
        .ok_or_else(|| AppError::Unauthorized("missing or invalid `X-User-Id` header".into()))
}
