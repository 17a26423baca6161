use std::time::Duration;

use axum::{extract::{Query, State}, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;

use crate::config::{DEFAULT_K, K_MAX, K_MIN};
use crate::error::AppError;
use crate::slicer;
use crate::state::{AppState, Candidate};

#[derive(Deserialize)]
pub struct RetrieveParams {
    q: String,
    k: Option<usize>,
}

const RETRIEVE_DEADLINE: Duration = Duration::from_secs(10);

/// `GET /retrieve?q=&k=`: embed the query, search the index, fetch bodies,
/// slice the best quote per hit, optionally rerank, return desc by score.
pub async fn retrieve(State(state): State<AppState>, Query(params): Query<RetrieveParams>) -> impl IntoResponse {
    if params.q.chars().count() < 2 {
        return AppError::ShapeError("query must be at least 2 characters".into()).into_response();
    }
    let k = params.k.unwrap_or(DEFAULT_K).clamp(K_MIN, K_MAX);

    match tokio::time::timeout(RETRIEVE_DEADLINE, run_pipeline(&state, &params.q, k)).await {
        Ok(Ok(results)) => {
            state.metrics.retrieve_requests_total.inc();
            (StatusCode::OK, Json(results)).into_response()
        }
        Ok(Err(e)) => e.into_response(),
        Err(_) => AppError::Cancelled("retrieve deadline exceeded".into()).into_response(),
    }
}

async fn run_pipeline(state: &AppState, query: &str, k: usize) -> Result<Vec<Candidate>, AppError> {
    let embed_start = std::time::Instant::now();
    let query_vector = state
        .embedder
        .embed(query)
        .await
        .map_err(|_| AppError::EmbeddingError("embedding service unavailable".into()))?;
    state.metrics.embed_latency_seconds.observe(embed_start.elapsed().as_secs_f64());

    let hits = state.index.search(&query_vector, k)?;
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let mut candidates = Vec::with_capacity(hits.len());
    for (page_id, score) in hits {
        let body = match tokio::time::timeout(Duration::from_secs(5), state.upstream.get_page_body(&page_id)).await {
            Ok(Ok(Some(body))) => body,
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                tracing::warn!(page_id = %page_id, error = %e, "body fetch failed, skipping candidate");
                continue;
            }
            Err(_) => {
                tracing::warn!(page_id = %page_id, "body fetch timed out, skipping candidate");
                continue;
            }
        };

        let passage = slicer::extract(&body, query, slicer::DEFAULT_MAX_WORDS);
        candidates.push(Candidate {
            page_id,
            score,
            quote: passage.quote,
            word_count: passage.word_count,
            rerank_score: None,
        });
    }

    let rerank_start = std::time::Instant::now();
    let reranked = match tokio::time::timeout(
        Duration::from_secs(2),
        rerank_async(state, query, candidates.clone(), k),
    )
    .await
    {
        Ok(reranked) => reranked,
        Err(_) => {
            tracing::warn!("rerank deadline exceeded, returning pre-rerank list");
            candidates
        }
    };
    state.metrics.rerank_latency_seconds.observe(rerank_start.elapsed().as_secs_f64());

    Ok(reranked)
}

async fn rerank_async(state: &AppState, query: &str, candidates: Vec<Candidate>, k: usize) -> Vec<Candidate> {
    // Reranking is CPU-bound; hop to a blocking thread so it never stalls
    // the async executor.
    let reranker = state.reranker.clone();
    let query = query.to_string();
    tokio::task::spawn_blocking(move || reranker.rerank(&query, candidates, k))
        .await
        .unwrap_or_default()
}
