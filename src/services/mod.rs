/// Who may control, vote and publish media.
pub mod access_control;
/// Battle lifecycle orchestration.
pub mod battle_service;
/// Battle topic event builders.
pub mod broadcast_events;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Spectator Server-Sent Events streams.
pub mod sse_service;
/// Storage connection supervision with backoff and degraded mode.
pub mod storage_supervisor;
/// Ballots and tallies.
pub mod vote_service;
/// WebSocket session gateway.
pub mod websocket_service;
