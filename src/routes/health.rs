use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// `/health`: reports `degraded` (HTTP 207) while the index is empty so
/// external probes can drain traffic until bootstrap completes.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let index_size = state.index.stats().count;
    let status = if index_size > 0 { "healthy" } else { "degraded" };
    let http_status = if index_size > 0 { StatusCode::OK } else { StatusCode::from_u16(207).unwrap() };

    (
        http_status,
        Json(json!({
            "status": status,
            "index_size": index_size,
            "uptime": state.service.uptime_seconds(),
            "last_updated": state.service.last_updated_iso(),
        })),
    )
}
