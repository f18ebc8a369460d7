use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the live battle backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::battles::create_battle,
        crate::routes::battles::get_battle,
        crate::routes::battles::delete_battle,
        crate::routes::battles::get_tally,
        crate::routes::battles::get_results,
        crate::routes::sse::battle_stream,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::battle::CreateBattleRequest,
            crate::dto::battle::BattleSnapshot,
            crate::dto::battle::ParticipantSummary,
            crate::dto::battle::TallyResponse,
            crate::dto::battle::ResultsResponse,
            crate::dto::sse::RoundTickEvent,
            crate::dto::sse::RoundEndedEvent,
            crate::dto::sse::BattleFinishedEvent,
            crate::dto::sse::VoteCastEvent,
            crate::dto::sse::ChatMessageEvent,
            crate::dto::sse::JoinedEvent,
            crate::dto::sse::CommandRejectedEvent,
            crate::services::access_control::MediaGrant,
            crate::error::ErrorKind,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "battles", description = "Battle lifecycle, tallies and results"),
        (name = "sse", description = "Spectator event streams"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_battle_paths() {
        let doc = ApiDoc::openapi();
        for path in ["/battles", "/battles/{id}", "/battles/{id}/tally", "/sse/battles/{id}", "/ws"] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
