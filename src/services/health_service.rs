use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report storage health and the number of running round countdowns.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.require_battle_store().await {
        Ok(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "storage health check failed");
            }
        }
        Err(_) => warn!("storage unavailable (degraded mode)"),
    }

    let active_timers = state.timers().active_count();
    if state.is_degraded().await {
        HealthResponse::degraded(active_timers)
    } else {
        HealthResponse::ok(active_timers)
    }
}
