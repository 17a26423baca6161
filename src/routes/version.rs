use axum::{extract::State, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "memory-rag",
        "version": state.service.version,
        "api_version": "v1",
        "index_vectors": state.index.stats().count,
    }))
}
