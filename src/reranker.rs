//! Cross-encoder reranker: rescales retrieval candidates by running the
//! query paired with each candidate quote through an ONNX cross-encoder.
//! Model loading is best-effort — any failure downgrades to pass-through
//! rather than taking the service down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use ort::session::Session;
use ort::value::Tensor;
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::{error, info, warn};

use crate::state::Candidate;

const MAX_SEQ_LEN: usize = 384;

#[derive(Debug, Clone, Serialize)]
pub struct RerankerMetrics {
    pub rerank_latency_seconds: f64,
    pub rerank_call_count: u64,
    pub reranker_enabled: bool,
    pub reranker_initialized: bool,
    pub model_name: String,
    pub device: String,
}

struct Model {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

pub struct Reranker {
    enabled: bool,
    model_name: String,
    device: String,
    batch_size: usize,
    model: Option<Model>,
    latency_total_micros: AtomicU64,
    call_count: AtomicU64,
}

impl Reranker {
    /// Attempts to load `model_name` from a local path or HF hub repo id.
    /// On any failure this returns an instance with `initialized() == false`
    /// that behaves as pass-through — never a hard error.
    pub fn load(model_name: String, device: String, batch_size: usize, enabled: bool) -> Self {
        if !enabled {
            info!("reranker disabled via configuration");
            return Self {
                enabled,
                model_name,
                device,
                batch_size,
                model: None,
                latency_total_micros: AtomicU64::new(0),
                call_count: AtomicU64::new(0),
            };
        }

        let model = match Self::try_load(&model_name) {
            Ok(model) => {
                info!(model = %model_name, "cross-encoder model loaded");
                Some(model)
            }
            Err(e) => {
                error!(model = %model_name, error = %e, "failed to initialize cross-encoder, falling back to pass-through");
                None
            }
        };

        Self {
            enabled,
            model_name,
            device,
            batch_size,
            model,
            latency_total_micros: AtomicU64::new(0),
            call_count: AtomicU64::new(0),
        }
    }

    fn try_load(model_name: &str) -> anyhow::Result<Model> {
        let (model_path, tokenizer_path) = if std::path::Path::new(model_name).is_dir() {
            (
                std::path::Path::new(model_name).join("model.onnx"),
                std::path::Path::new(model_name).join("tokenizer.json"),
            )
        } else {
            let api = hf_hub::api::sync::Api::new()?;
            let repo = api.model(model_name.to_string());
            (repo.get("model.onnx")?, repo.get("tokenizer.json")?)
        };

        let session = Session::builder()?.commit_from_file(model_path)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

        Ok(Model { session: Mutex::new(session), tokenizer })
    }

    pub fn initialized(&self) -> bool {
        self.model.is_some()
    }

    /// Rescores `candidates` against `query` and returns the top `top_k` by
    /// new score. When disabled or uninitialized, returns the input sorted
    /// by its existing score, truncated to `top_k` — the identity path.
    pub fn rerank(&self, query: &str, mut candidates: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
        if candidates.is_empty() {
            return candidates;
        }

        let Some(model) = (if self.enabled { self.model.as_ref() } else { None }) else {
            return Self::sort_truncate(candidates, top_k);
        };

        let start = Instant::now();
        match self.score_batches(model, query, &candidates) {
            Ok(scores) => {
                for (candidate, score) in candidates.iter_mut().zip(scores) {
                    candidate.rerank_score = Some(score);
                }
                self.record_latency(start.elapsed());
                candidates.sort_by(|a, b| {
                    b.rerank_score
                        .unwrap_or(b.score)
                        .partial_cmp(&a.rerank_score.unwrap_or(a.score))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                candidates.truncate(top_k);
                candidates
            }
            Err(e) => {
                warn!(error = %e, "reranking failed, falling back to original ranking");
                self.record_latency(start.elapsed());
                Self::sort_truncate(candidates, top_k)
            }
        }
    }

    fn sort_truncate(mut candidates: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(top_k);
        candidates
    }

    fn score_batches(&self, model: &Model, query: &str, candidates: &[Candidate]) -> anyhow::Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(candidates.len());
        for chunk in candidates.chunks(self.batch_size.max(1)) {
            let batch_scores = self.score_chunk(model, query, chunk)?;
            scores.extend(batch_scores);
        }
        Ok(scores)
    }

    fn score_chunk(&self, model: &Model, query: &str, chunk: &[Candidate]) -> anyhow::Result<Vec<f32>> {
        let encodings = chunk
            .iter()
            .map(|c| {
                model
                    .tokenizer
                    .encode((query, c.quote.as_str()), true)
                    .map_err(|e| anyhow::anyhow!("tokenizer error: {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .min(MAX_SEQ_LEN);

        let batch = encodings.len();
        let mut input_ids = vec![0i64; batch * max_len];
        let mut attention_mask = vec![0i64; batch * max_len];

        for (row, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            let len = ids.len().min(max_len);
            for col in 0..len {
                input_ids[row * max_len + col] = ids[col] as i64;
                attention_mask[row * max_len + col] = mask[col] as i64;
            }
        }

        let input_ids_tensor = Tensor::from_array(([batch, max_len], input_ids))?;
        let attention_mask_tensor = Tensor::from_array(([batch, max_len], attention_mask))?;

        let mut session = model
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("reranker session lock poisoned"))?;
        let outputs = session.run(ort::inputs![
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor,
        ])?;

        // Cross-encoder models emit one logit per pair: shape [batch, 1].
        let (_, logits) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(logits.to_vec())
    }

    fn record_latency(&self, elapsed: std::time::Duration) {
        self.latency_total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> RerankerMetrics {
        let calls = self.call_count.load(Ordering::Relaxed);
        let total_micros = self.latency_total_micros.load(Ordering::Relaxed);
        let avg_seconds = if calls > 0 {
            (total_micros as f64 / calls as f64) / 1_000_000.0
        } else {
            0.0
        };
        RerankerMetrics {
            rerank_latency_seconds: avg_seconds,
            rerank_call_count: calls,
            reranker_enabled: self.enabled,
            reranker_initialized: self.initialized(),
            model_name: self.model_name.clone(),
            device: self.device.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_reranker_is_identity_sorted_by_existing_score() {
        let reranker = Reranker::load("unused".into(), "cpu".into(), 8, false);
        assert!(!reranker.initialized());

        let candidates = vec![
            Candidate { page_id: "a".into(), score: 0.3, quote: "a".into(), word_count: 1, rerank_score: None },
            Candidate { page_id: "b".into(), score: 0.9, quote: "b".into(), word_count: 1, rerank_score: None },
        ];
        let result = reranker.rerank("query", candidates, 2);
        assert_eq!(result[0].page_id, "b");
    }

    #[test]
    fn empty_candidates_returns_empty() {
        let reranker = Reranker::load("unused".into(), "cpu".into(), 8, true);
        let result = reranker.rerank("query", vec![], 6);
        assert!(result.is_empty());
    }
}
