use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::config::AppConfig;
use crate::embedder::EmbeddingClient;
use crate::error::AppResult;
use crate::index::VectorIndex;
use crate::metrics::Metrics;
use crate::reranker::Reranker;
use crate::upstream::UpstreamClient;

/// A single retrieval result, mutated in place as it flows through the
/// pipeline (search → body fetch → slice → rerank).
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub page_id: String,
    pub score: f32,
    pub quote: String,
    pub word_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// Observational service state: when the process started, when the index
/// was last mutated, and what version is running.
pub struct ServiceState {
    start_time: Instant,
    last_updated_epoch_ms: AtomicI64,
    pub version: String,
}

impl ServiceState {
    pub fn new(version: String) -> Self {
        Self {
            start_time: Instant::now(),
            last_updated_epoch_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            version,
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn touch(&self) {
        self.last_updated_epoch_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_updated_iso(&self) -> String {
        let ms = self.last_updated_epoch_ms.load(Ordering::Relaxed);
        chrono::DateTime::from_timestamp_millis(ms)
            .unwrap_or_else(Utc::now)
            .to_rfc3339()
    }
}

/// Rolling stats mirrored from the CDC worker for display on `/stats` /
/// `/metrics` when the worker runs in-process.
#[derive(Default)]
pub struct WorkerStats {
    pub processed_count: AtomicU64,
    pub error_count: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub index: Arc<VectorIndex>,
    pub embedder: Arc<EmbeddingClient>,
    pub upstream: Arc<UpstreamClient>,
    pub reranker: Arc<Reranker>,
    pub metrics: Arc<Metrics>,
    pub service: Arc<ServiceState>,
    pub worker_stats: Arc<WorkerStats>,
}

impl AppState {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let embedder = Arc::new(EmbeddingClient::new(
            config.embed_url.clone(),
            config.embed_model.clone(),
            config.embed_cache_size,
        ));
        let upstream = Arc::new(UpstreamClient::new(
            config.upstream_url.clone(),
            config.upstream_keyspace.clone(),
            config.upstream_auth_token.clone(),
        ));
        let reranker = Arc::new(Reranker::load(
            config.reranker_model.clone(),
            config.reranker_device.clone(),
            config.reranker_batch_size,
            config.reranker_enabled,
        ));
        let metrics = Arc::new(Metrics::new()?);
        let service = Arc::new(ServiceState::new(config.version.clone()));

        Ok(Self {
            config: Arc::new(config),
            index: Arc::new(VectorIndex::new()),
            embedder,
            upstream,
            reranker,
            metrics,
            service,
            worker_stats: Arc::new(WorkerStats::default()),
        })
    }

    /// Paged-scan the upstream vector table and swap it into the index in
    /// one critical section. On total failure the index is left as-is.
    pub async fn bootstrap(&self) -> AppResult<usize> {
        let mut collected: Vec<(String, Vec<f32>)> = Vec::new();
        let total = self
            .upstream
            .paged_scan_vectors(100, |batch| collected.extend(batch))
            .await?;

        if !collected.is_empty() {
            self.index.bulk_load(&collected)?;
            self.service.touch();
        }

        Ok(total)
    }
}
