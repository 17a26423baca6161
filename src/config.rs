use serde::{Deserialize, Serialize};

/// Embedding dimension for the whole service. The upstream model, the index,
/// and the wire format all agree on this; it is not runtime-configurable
/// because the index's storage layout depends on it.
pub const VECTOR_DIM: usize = 768;

/// Default `k` for `/retrieve` when the caller omits it.
pub const DEFAULT_K: usize = 4;

/// `/retrieve`'s `k` is clamped to this inclusive range.
pub const K_MIN: usize = 1;
pub const K_MAX: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub log_dir: String,
    pub auth_token: Option<String>,

    pub upstream_url: String,
    pub upstream_auth_token: Option<String>,
    pub upstream_keyspace: String,

    pub embed_url: String,
    pub embed_model: String,
    pub embed_cache_size: usize,

    pub memory_rag_url: String,

    pub broker: String,
    pub topic: String,
    pub consumer_group: String,
    pub stats_interval: u64,

    pub reranker_enabled: bool,
    pub reranker_model: String,
    pub reranker_device: String,
    pub reranker_batch_size: usize,

    pub cdc_delete_removes_vector: bool,

    pub version: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT").unwrap_or_else(|_| "8001".to_string());
        let listen_addr =
            std::env::var("LISTEN_ADDR").unwrap_or_else(|_| format!("0.0.0.0:{}", port));

        let log_dir = std::env::var("RAG_LOG_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("memory-rag").join("logs").to_string_lossy().to_string())
                .unwrap_or_else(|| ".memory-rag-data/logs".to_string())
        });

        Self {
            listen_addr,
            log_dir,
            auth_token: std::env::var("RAG_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),

            upstream_url: std::env::var("UPSTREAM_URL")
                .or_else(|_| std::env::var("STARGATE_URL"))
                .unwrap_or_else(|_| "http://stargate:8080".to_string()),
            upstream_auth_token: std::env::var("UPSTREAM_AUTH_TOKEN")
                .or_else(|_| std::env::var("STARGATE_AUTH_TOKEN"))
                .ok()
                .filter(|t| !t.is_empty()),
            upstream_keyspace: std::env::var("UPSTREAM_KEYSPACE")
                .unwrap_or_else(|_| "gibsey".to_string()),

            embed_url: std::env::var("EMBED_URL")
                .unwrap_or_else(|_| "http://ollama:11434/api/embeddings".to_string()),
            embed_model: std::env::var("EMBED_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            embed_cache_size: std::env::var("EMBED_CACHE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),

            memory_rag_url: std::env::var("MEMORY_RAG_URL")
                .unwrap_or_else(|_| "http://memory-rag:8001".to_string()),

            broker: std::env::var("BROKER")
                .or_else(|_| std::env::var("KAFKA_BROKER"))
                .unwrap_or_else(|_| "kafka:9092".to_string()),
            topic: std::env::var("TOPIC").unwrap_or_else(|_| "cdc.pages".to_string()),
            consumer_group: std::env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "gibsey-embedding-consumer".to_string()),
            stats_interval: std::env::var("STATS_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),

            reranker_enabled: std::env::var("RERANKER")
                .map(|v| matches!(v.to_lowercase().as_str(), "on" | "true" | "1" | "yes"))
                .unwrap_or(true),
            reranker_model: std::env::var("RERANKER_MODEL")
                .unwrap_or_else(|_| "cross-encoder/ms-marco-MiniLM-L-6-v2".to_string()),
            reranker_device: std::env::var("RERANKER_DEVICE").unwrap_or_else(|_| "cpu".to_string()),
            reranker_batch_size: std::env::var("RERANKER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),

            cdc_delete_removes_vector: std::env::var("CDC_DELETE_REMOVES_VECTOR")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(false),

            version: std::env::var("VERSION").unwrap_or_else(|_| "1.0.0".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Env vars are process-global; serialize tests that touch RAG_LOG_DIR
    // so they don't race each other under the default parallel test runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn log_dir_honors_rag_log_dir_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        std::env::set_var("RAG_LOG_DIR", dir.path());
        let config = AppConfig::from_env();
        std::env::remove_var("RAG_LOG_DIR");

        assert_eq!(config.log_dir, dir.path().to_string_lossy());
    }

    #[test]
    fn defaults_are_populated_without_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("UPSTREAM_URL");
        std::env::remove_var("STARGATE_URL");
        let config = AppConfig::from_env();
        assert_eq!(config.upstream_url, "http://stargate:8080");
        assert_eq!(config.reranker_batch_size, 8);
        assert_eq!(config.cdc_delete_removes_vector, false);
    }
}
