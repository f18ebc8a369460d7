use serde::Serialize;
use utoipa::ToSchema;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Battles with a round countdown in progress.
    pub active_timers: usize,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok(active_timers: usize) -> Self {
        Self {
            status: "ok".to_string(),
            active_timers,
        }
    }

    /// Create a health response indicating the system is in degraded mode.
    pub fn degraded(active_timers: usize) -> Self {
        Self {
            status: "degraded".to_string(),
            active_timers,
        }
    }
}
