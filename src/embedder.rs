//! HTTP client for the external embedding model, with a bounded cache keyed
//! by a strong hash of the input text so repeated queries skip the network
//! call entirely.

use std::sync::Arc;
use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::VECTOR_DIM;
use crate::error::{AppError, AppResult};

const EMBED_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ELAPSED: Duration = Duration::from_secs(25);

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Option<Vec<f32>>,
}

pub struct EmbeddingClient {
    http: reqwest::Client,
    url: String,
    model: String,
    cache: DashMap<String, Arc<Vec<f32>>>,
    cache_cap: usize,
}

fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl EmbeddingClient {
    pub fn new(url: String, model: String, cache_cap: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self { http, url, model, cache: DashMap::new(), cache_cap }
    }

    /// Returns a 768-d vector for `text`. Retries transport errors with
    /// exponential backoff up to [`MAX_ELAPSED`] (roughly 5 attempts).
    pub async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let key = cache_key(text);
        if let Some(cached) = self.cache.get(&key) {
            debug!(cache_key = %key[..8.min(key.len())], "embedding cache hit");
            return Ok((**cached).clone());
        }

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(MAX_ELAPSED),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            ..Default::default()
        };

        let embedding = retry(backoff, || async {
            self.call_once(text).await.map_err(|e| match e {
                AppError::EmbeddingError(_) => backoff::Error::transient(e),
                other => backoff::Error::permanent(other),
            })
        })
        .await?;

        if self.cache.len() >= self.cache_cap {
            // Bounded-size eviction: drop an arbitrary entry. LRU is not
            // required (see design notes), just boundedness.
            if let Some(entry) = self.cache.iter().next().map(|e| e.key().clone()) {
                self.cache.remove(&entry);
            }
        }
        self.cache.insert(key, Arc::new(embedding.clone()));

        Ok(embedding)
    }

    async fn call_once(&self, text: &str) -> AppResult<Vec<f32>> {
        let body = EmbedRequest { model: &self.model, prompt: text };

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::EmbeddingError(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::EmbeddingError(format!("embedding service returned {status}")));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::EmbeddingError(format!("invalid embedding response: {e}")))?;

        let embedding = parsed
            .embedding
            .ok_or_else(|| AppError::EmbeddingError("embedding response missing 'embedding' field".into()))?;

        if embedding.len() != VECTOR_DIM {
            warn!(
                got = embedding.len(),
                expected = VECTOR_DIM,
                "embedding service returned unexpected dimension"
            );
            return Err(AppError::EmbeddingError(format!(
                "expected {} dimensions, got {}",
                VECTOR_DIM,
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_deterministic() {
        assert_eq!(cache_key("hello"), cache_key("hello"));
        assert_ne!(cache_key("hello"), cache_key("world"));
    }

    #[tokio::test]
    async fn cache_hit_skips_network_call() {
        let client = EmbeddingClient::new("http://127.0.0.1:1".to_string(), "test-model".to_string(), 10);
        let key = cache_key("cached text");
        client.cache.insert(key, Arc::new(vec![0.5; VECTOR_DIM]));
        let result = client.embed("cached text").await.unwrap();
        assert_eq!(result.len(), VECTOR_DIM);
    }
}
