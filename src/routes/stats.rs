use axum::{extract::State, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.index.stats();
    Json(json!({
        "total_vectors": stats.count,
        "dimension": stats.dimension,
        "index_type": "FlatInnerProduct",
        "memory_usage_bytes": stats.approx_bytes,
        "unique_page_ids": stats.unique_ids,
        "last_updated": state.service.last_updated_iso(),
        "uptime_seconds": state.service.uptime_seconds(),
    }))
}
