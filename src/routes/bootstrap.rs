use axum::{extract::State, http::StatusCode, Json};
use serde_json::json;

use crate::state::AppState;

/// `POST /bootstrap`: runs the paged-scan loader in the background and
/// acknowledges immediately. On total failure the index is left as-is.
pub async fn bootstrap(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    tokio::spawn(async move {
        match state.bootstrap().await {
            Ok(total) => tracing::info!(total_vectors = total, "bootstrap complete"),
            Err(e) => tracing::error!(error = %e, "bootstrap failed, index left unchanged"),
        }
    });

    (StatusCode::ACCEPTED, Json(json!({"status": "Bootstrap started in the background"})))
}
