use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use memory_rag::{config, server, state, worker};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::AppConfig::from_env();
    std::fs::create_dir_all(&config.log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "memory-rag.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "memory_rag=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())).unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "memory_rag::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        upstream_url = %config.upstream_url,
        embed_url = %config.embed_url,
        embed_model = %config.embed_model,
        broker = %config.broker,
        topic = %config.topic,
        reranker_enabled = config.reranker_enabled,
        log_dir = %config.log_dir,
        "memory-rag starting"
    );

    let run_worker_in_process = std::env::var("RUN_WORKER_IN_PROCESS")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false);

    let worker_shutdown = Arc::new(tokio::sync::Notify::new());
    let app_state = state::AppState::new(config)?;

    let app = server::create_app(app_state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("memory-rag listening on {}", addr);

    // Schedule background bootstrap immediately; /health serves `degraded`
    // until it completes.
    let bootstrap_state = app_state.clone();
    tokio::spawn(async move {
        match bootstrap_state.bootstrap().await {
            Ok(total) => info!(total_vectors = total, "startup bootstrap complete"),
            Err(e) => error!(error = %e, "startup bootstrap failed, index left empty"),
        }
    });

    if run_worker_in_process {
        let worker_cfg = worker::WorkerConfig {
            broker: app_state.config.broker.clone(),
            topic: app_state.config.topic.clone(),
            consumer_group: app_state.config.consumer_group.clone(),
            dry_run: false,
            refresh_memory_rag: false,
            memory_rag_url: app_state.config.memory_rag_url.clone(),
            stats_interval: app_state.config.stats_interval,
            cdc_delete_removes_vector: app_state.config.cdc_delete_removes_vector,
        };
        let embedder = app_state.embedder.clone();
        let upstream = app_state.upstream.clone();
        let index = app_state.index.clone();
        let metrics = app_state.metrics.clone();
        let shutdown = worker_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = worker::run(worker_cfg, embedder, upstream, Some(index), Some(metrics), shutdown).await {
                error!(error = %e, "CDC worker terminated unexpectedly");
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(worker_shutdown))
        .await?;

    info!("memory-rag shutdown complete");
    Ok(())
}

async fn shutdown_signal(worker_shutdown: Arc<tokio::sync::Notify>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install secondary Ctrl+C handler");
    };

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
    }

    worker_shutdown.notify_waiters();
    info!("shutdown signal received");
}
