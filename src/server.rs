use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::{Any, CorsLayer}, trace::TraceLayer};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes — no auth required.
    let public_routes = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/version", get(routes::version::version))
        .route("/stats", get(routes::stats::stats))
        .route("/retrieve", get(routes::retrieve::retrieve))
        .route("/metrics", get(routes::metrics::metrics));

    // Mutating routes — require RAG_AUTH_TOKEN when configured.
    let protected_routes = Router::new()
        .route("/refresh", post(routes::refresh::refresh))
        .route("/bulk-refresh", post(routes::refresh::bulk_refresh))
        .route("/bootstrap", post(routes::bootstrap::bootstrap))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Validates `Authorization: Bearer <token>` against `RAG_AUTH_TOKEN`. Auth
/// is skipped entirely when no token is configured (development mode).
async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    let Some(expected_token) = state.config.auth_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let auth_header = req.headers().get("authorization").and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header) if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") => {
            let token = &header[7..];
            if token == expected_token {
                Ok(next.run(req).await)
            } else {
                tracing::warn!("auth token mismatch — rejecting request");
                Err((
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
                ))
            }
        }
        _ => {
            tracing::warn!("missing or malformed Authorization header — rejecting request");
            Err((
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
            ))
        }
    }
}
