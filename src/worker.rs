//! CDC ingest worker: consumes Debezium-style change events, embeds page
//! bodies, writes vectors upstream, and notifies the retrieval service to
//! refresh its in-memory index. At-least-once with idempotent upserts —
//! the offset is committed only after the embed + upstream write succeed.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::embedder::EmbeddingClient;
use crate::metrics::Metrics;
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
    Snapshot,
    Other,
}

impl Op {
    fn from_debezium(op: &str) -> Self {
        match op {
            "c" => Op::Create,
            "u" => Op::Update,
            "d" => Op::Delete,
            "r" => Op::Snapshot,
            _ => Op::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    page_id: Option<String>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    op: Option<String>,
    before: Option<ChangeRow>,
    after: Option<ChangeRow>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    payload: Payload,
}

pub struct WorkerConfig {
    pub broker: String,
    pub topic: String,
    pub consumer_group: String,
    pub dry_run: bool,
    pub refresh_memory_rag: bool,
    pub memory_rag_url: String,
    pub stats_interval: u64,
    pub cdc_delete_removes_vector: bool,
}

/// Shared per-event processing: decode, embed, write upstream, notify.
/// Returns `Ok((true, embed_elapsed))` if the event advanced the processed
/// counter (a create/update/snapshot was stored) along with the time spent
/// solely in the embedding call, `Ok((false, Duration::ZERO))` if it was
/// legitimately skipped (wrong op, delete with deletion disabled), and
/// `Err` if it should NOT be considered committed (embed or upstream write
/// failed).
pub async fn process_payload(
    cfg: &WorkerConfig,
    embedder: &EmbeddingClient,
    upstream: &UpstreamClient,
    index: Option<&crate::index::VectorIndex>,
    metrics: Option<&Metrics>,
    http: &reqwest::Client,
    raw: &[u8],
) -> anyhow::Result<(bool, Duration)> {
    let envelope: Envelope = match serde_json::from_slice(raw) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "failed to parse CDC envelope as JSON");
            // Malformed data: log-and-skip, commit offset (replay can't fix it).
            return Ok((false, Duration::ZERO));
        }
    };

    let op = Op::from_debezium(envelope.payload.op.as_deref().unwrap_or(""));

    if op == Op::Delete {
        if cfg.cdc_delete_removes_vector {
            if let (Some(row), Some(index)) = (&envelope.payload.before, index) {
                if let Some(page_id) = &row.page_id {
                    index.remove(page_id);
                    info!(page_id = %page_id, "removed vector for deleted page");
                }
            }
        } else {
            debug!("ignoring delete event (CDC_DELETE_REMOVES_VECTOR=false)");
        }
        return Ok((false, Duration::ZERO));
    }

    if op != Op::Create && op != Op::Update && op != Op::Snapshot {
        debug!(?op, "ignoring unsupported operation type");
        return Ok((false, Duration::ZERO));
    }

    let Some(after) = envelope.payload.after else {
        warn!("event payload missing 'after' data for create/update/snapshot");
        return Ok((false, Duration::ZERO));
    };

    let (Some(page_id), Some(body)) = (after.page_id, after.body) else {
        warn!("missing required fields page_id/body on CDC event");
        return Ok((false, Duration::ZERO));
    };

    if page_id.is_empty() || body.is_empty() {
        warn!(page_id = %page_id, "empty page_id or body, skipping");
        return Ok((false, Duration::ZERO));
    }

    info!(page_id = %page_id, op = ?op, body_len = body.len(), "processing CDC event");

    let embed_start = Instant::now();
    let vector = match embedder.embed(&body).await {
        Ok(vector) => vector,
        Err(e) => {
            if let Some(metrics) = metrics {
                metrics.cdc_errors_total.with_label_values(&["embed"]).inc();
            }
            return Err(anyhow::anyhow!("embedding failed for page {page_id}: {e}"));
        }
    };
    let embed_elapsed = embed_start.elapsed();
    if let Some(metrics) = metrics {
        metrics.embed_latency_seconds.observe(embed_elapsed.as_secs_f64());
    }

    if cfg.dry_run {
        info!(page_id = %page_id, "[DRY RUN] would store vector, would notify refresh");
        return Ok((true, embed_elapsed));
    }

    if let Err(e) = upstream.put_vector(&page_id, &vector).await {
        if let Some(metrics) = metrics {
            metrics.cdc_errors_total.with_label_values(&["upstream"]).inc();
        }
        return Err(anyhow::anyhow!("upstream write failed for page {page_id}: {e}"));
    }

    if let Some(metrics) = metrics {
        metrics.cdc_processed_total.inc();
    }

    if let Some(index) = index {
        // In-process worker: update the index directly instead of over HTTP.
        if let Err(e) = index.add(&page_id, &vector) {
            warn!(page_id = %page_id, error = %e, "failed to apply in-process refresh");
        }
    } else if cfg.refresh_memory_rag {
        notify_refresh(http, &cfg.memory_rag_url, &page_id, &vector).await;
    }

    debug!(page_id = %page_id, embed_ms = embed_elapsed.as_millis(), "event processed");
    Ok((true, embed_elapsed))
}

async fn notify_refresh(http: &reqwest::Client, base_url: &str, page_id: &str, vector: &[f32]) {
    let url = format!("{base_url}/refresh");
    let body = serde_json::json!({ "page_id": page_id, "vector": vector });

    // Best-effort, at most 3 attempts; failure is logged, never blocks the commit.
    for attempt in 1..=3 {
        match http.post(&url).json(&body).timeout(Duration::from_secs(5)).send().await {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => warn!(status = %response.status(), attempt, "refresh notification rejected"),
            Err(e) => warn!(error = %e, attempt, "refresh notification failed"),
        }
        tokio::time::sleep(Duration::from_millis(500 * attempt)).await;
    }
}

/// Runs the standalone CDC consumer loop until cancelled. Used both by the
/// dedicated `embedding-consumer` binary and, optionally, in-process by the
/// retrieval service.
pub async fn run(
    cfg: WorkerConfig,
    embedder: std::sync::Arc<EmbeddingClient>,
    upstream: std::sync::Arc<UpstreamClient>,
    index: Option<std::sync::Arc<crate::index::VectorIndex>>,
    metrics: Option<std::sync::Arc<Metrics>>,
    shutdown: std::sync::Arc<tokio::sync::Notify>,
) -> anyhow::Result<()> {
    info!(
        broker = %cfg.broker,
        topic = %cfg.topic,
        group = %cfg.consumer_group,
        dry_run = cfg.dry_run,
        "starting CDC ingest worker"
    );

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.broker)
        .set("group.id", &cfg.consumer_group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "30000")
        .set("max.poll.interval.ms", "300000")
        .create()?;

    consumer.subscribe(&[cfg.topic.as_str()])?;

    let http = reqwest::Client::new();
    let processed = std::sync::atomic::AtomicU64::new(0);
    let errors = std::sync::atomic::AtomicU64::new(0);
    let embed_ms_total = std::sync::atomic::AtomicU64::new(0);
    let start = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("worker shutdown requested, closing consumer");
                break;
            }
            message = consumer.recv() => {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        error!(error = %e, "kafka consumer error, backing off 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(payload) = message.payload() else {
                    warn!("received message with empty payload");
                    if let Err(e) = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Sync) {
                        warn!(error = %e, "failed to commit offset for empty message");
                    }
                    continue;
                };

                match process_payload(&cfg, &embedder, &upstream, index.as_deref(), metrics.as_deref(), &http, payload).await {
                    Ok((did_process, embed_elapsed)) => {
                        if did_process {
                            processed.fetch_add(1, Ordering::Relaxed);
                            embed_ms_total.fetch_add(embed_elapsed.as_millis() as u64, Ordering::Relaxed);
                        }
                        if let Err(e) = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Sync) {
                            error!(error = %e, "failed to commit Kafka offset");
                        }
                    }
                    Err(e) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "event processing failed, NOT committing offset (will be replayed)");
                    }
                }

                let count = processed.load(Ordering::Relaxed);
                if count > 0 && count % cfg.stats_interval == 0 {
                    log_stats(&processed, &errors, &embed_ms_total, start.elapsed());
                }
            }
        }
    }

    log_stats(&processed, &errors, &embed_ms_total, start.elapsed());
    Ok(())
}

fn log_stats(
    processed: &std::sync::atomic::AtomicU64,
    errors: &std::sync::atomic::AtomicU64,
    embed_ms_total: &std::sync::atomic::AtomicU64,
    elapsed: Duration,
) {
    let processed = processed.load(Ordering::Relaxed);
    let errors = errors.load(Ordering::Relaxed);
    let embed_ms_total = embed_ms_total.load(Ordering::Relaxed);
    let rate = if elapsed.as_secs_f64() > 0.0 { processed as f64 / elapsed.as_secs_f64() } else { 0.0 };
    let avg_embedding_ms = if processed > 0 { embed_ms_total as f64 / processed as f64 } else { 0.0 };

    info!(
        processed,
        errors,
        rate_per_sec = format!("{rate:.2}"),
        avg_embedding_ms = format!("{avg_embedding_ms:.2}"),
        "worker stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(dry_run: bool, cdc_delete_removes_vector: bool) -> WorkerConfig {
        WorkerConfig {
            broker: "localhost:9092".into(),
            topic: "cdc.pages".into(),
            consumer_group: "test-group".into(),
            dry_run,
            refresh_memory_rag: false,
            memory_rag_url: "http://localhost:8001".into(),
            stats_interval: 10,
            cdc_delete_removes_vector,
        }
    }

    fn embedder() -> EmbeddingClient {
        EmbeddingClient::new("http://localhost:1".into(), "nomic-embed-text".into(), 10)
    }

    fn upstream() -> UpstreamClient {
        UpstreamClient::new("http://localhost:1".into(), "ks".into(), None)
    }

    #[tokio::test]
    async fn malformed_json_is_skipped_not_errored() {
        let (did_process, _) = process_payload(&cfg(false, false), &embedder(), &upstream(), None, None, &reqwest::Client::new(), b"not json").await.unwrap();
        assert_eq!(did_process, false);
    }

    #[tokio::test]
    async fn unsupported_op_is_skipped() {
        let raw = br#"{"payload":{"op":"t","after":{"page_id":"p1","body":"hello"}}}"#;
        let (did_process, _) = process_payload(&cfg(false, false), &embedder(), &upstream(), None, None, &reqwest::Client::new(), raw).await.unwrap();
        assert_eq!(did_process, false);
    }

    #[tokio::test]
    async fn delete_is_skipped_when_deletion_disabled() {
        let raw = br#"{"payload":{"op":"d","before":{"page_id":"p1","body":"hello"}}}"#;
        let (did_process, _) = process_payload(&cfg(false, false), &embedder(), &upstream(), None, None, &reqwest::Client::new(), raw).await.unwrap();
        assert_eq!(did_process, false);
    }

    #[tokio::test]
    async fn delete_removes_from_index_when_enabled() {
        let index = crate::index::VectorIndex::new();
        let mut v = vec![0.0f32; crate::config::VECTOR_DIM];
        v[0] = 1.0;
        index.add("p1", &v).unwrap();

        let raw = br#"{"payload":{"op":"d","before":{"page_id":"p1","body":"hello"}}}"#;
        let (did_process, _) = process_payload(&cfg(false, true), &embedder(), &upstream(), Some(&index), None, &reqwest::Client::new(), raw).await.unwrap();
        assert_eq!(did_process, false);
        assert_eq!(index.stats().count, 0);
    }

    #[tokio::test]
    async fn missing_after_fields_are_skipped() {
        let raw = br#"{"payload":{"op":"c","after":{"page_id":"","body":""}}}"#;
        let (did_process, _) = process_payload(&cfg(false, false), &embedder(), &upstream(), None, None, &reqwest::Client::new(), raw).await.unwrap();
        assert_eq!(did_process, false);
    }

    #[test]
    fn op_from_debezium_maps_known_codes() {
        assert_eq!(Op::from_debezium("c"), Op::Create);
        assert_eq!(Op::from_debezium("u"), Op::Update);
        assert_eq!(Op::from_debezium("d"), Op::Delete);
        assert_eq!(Op::from_debezium("r"), Op::Snapshot);
        assert_eq!(Op::from_debezium("x"), Op::Other);
    }
}
