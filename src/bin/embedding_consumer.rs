use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use memory_rag::{config::AppConfig, embedder::EmbeddingClient, upstream::UpstreamClient, worker};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

/// Standalone CDC ingest worker: consumes change events, embeds page
/// bodies, and writes vectors to the upstream store.
#[derive(Parser, Debug)]
#[command(name = "embedding-consumer")]
struct Cli {
    /// Run without writing to the upstream store or notifying the retrieval
    /// service — useful for load testing the consumer loop.
    #[arg(long)]
    dry_run: bool,

    /// Kafka topic to consume from. Overrides the TOPIC env var.
    #[arg(long)]
    topic: Option<String>,

    /// Log rolling stats every N processed events.
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Notify the retrieval service's /refresh endpoint after each write.
    #[arg(long)]
    refresh_memory_rag: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "embedding_consumer=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    info!(
        broker = %config.broker,
        upstream_url = %config.upstream_url,
        embed_url = %config.embed_url,
        embed_model = %config.embed_model,
        dry_run = cli.dry_run,
        "embedding-consumer starting up"
    );

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

    let worker_cfg = worker::WorkerConfig {
        broker: config.broker.clone(),
        topic: cli.topic.unwrap_or(config.topic.clone()),
        consumer_group: config.consumer_group.clone(),
        dry_run: cli.dry_run,
        refresh_memory_rag: cli.refresh_memory_rag,
        memory_rag_url: config.memory_rag_url.clone(),
        stats_interval: cli.stats_interval.unwrap_or(config.stats_interval),
        cdc_delete_removes_vector: config.cdc_delete_removes_vector,
    };

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down consumer");
            shutdown_for_signal.notify_waiters();
        }
    });

    if let Err(e) = worker::run(worker_cfg, embedder, upstream, None, None, shutdown).await {
        error!(error = %e, "embedding-consumer terminated with error");
        return Err(e);
    }

    Ok(())
}
