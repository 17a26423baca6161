use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::config::VECTOR_DIM;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RefreshBody {
    page_id: String,
    vector: Vec<f32>,
}

fn validate_shape(vector: &[f32]) -> Result<(), (StatusCode, serde_json::Value)> {
    if vector.len() != VECTOR_DIM {
        return Err((
            StatusCode::BAD_REQUEST,
            json!({"error": format!("expected {} dimensions, got {}", VECTOR_DIM, vector.len())}),
        ));
    }
    if vector.iter().any(|c| !c.is_finite()) {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({"error": "vector contains non-finite component"}),
        ));
    }
    Ok(())
}

/// `POST /refresh`: apply a single vector update/insert to the live index.
pub async fn refresh(State(state): State<AppState>, Json(body): Json<RefreshBody>) -> impl IntoResponse {
    if let Err((status, error)) = validate_shape(&body.vector) {
        return (status, Json(error)).into_response();
    }

    match state.index.add(&body.page_id, &body.vector) {
        Ok(()) => {
            state.service.touch();
            state.metrics.refresh_requests_total.inc();
            (StatusCode::ACCEPTED, Json(json!({"status": "ok", "page_id": body.page_id}))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct BulkItem {
    page_id: String,
    vector: Vec<f32>,
}

/// `POST /bulk-refresh`: not transactional — partial application is
/// acceptable, bad rows are logged and skipped.
pub async fn bulk_refresh(State(state): State<AppState>, Json(items): Json<Vec<BulkItem>>) -> impl IntoResponse {
    let mut applied = 0usize;
    for item in items {
        if let Err((_, error)) = validate_shape(&item.vector) {
            tracing::warn!(page_id = %item.page_id, ?error, "bulk-refresh skipped invalid row");
            continue;
        }
        match state.index.add(&item.page_id, &item.vector) {
            Ok(()) => applied += 1,
            Err(e) => tracing::warn!(page_id = %item.page_id, error = %e, "bulk-refresh row failed"),
        }
    }

    state.service.touch();
    state.metrics.refresh_requests_total.inc();
    (StatusCode::ACCEPTED, Json(json!({"status": "ok", "applied": applied})))
}
