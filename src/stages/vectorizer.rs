//! Vectorizer stages.
//!
//! - **`hashing`**: signed feature hashing over lower-cased word tokens,
//!   L2-normalized. Deterministic and offline; good enough for tests and
//!   small deployments.
//! - **`openai`**: any OpenAI-compatible `/v1/embeddings` endpoint.
//!
//! Retry strategy for `openai`:
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry

use std::time::Duration;

use async_trait::async_trait;
use ingest_relay_core::error::StageError;
use ingest_relay_core::models::TextChunk;
use ingest_relay_core::stage::{PipelineStageDescriptor, Vectorizer};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::channel::BackoffPolicy;
use crate::config::EmbeddingConfig;

pub fn hashing() -> PipelineStageDescriptor {
    PipelineStageDescriptor::vectorizer("hashing", HashingVectorizer)
        .with_description("Deterministic feature-hashing vectors; no network access")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "dims": { "type": "integer", "default": 256, "minimum": 1 }
            }
        }))
}

pub fn openai(config: &EmbeddingConfig) -> PipelineStageDescriptor {
    PipelineStageDescriptor::vectorizer("openai", OpenAiVectorizer::new(config.clone()))
        .with_description("OpenAI-compatible embeddings API with retry and backoff")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "model": { "type": "string" },
                "dimensions": { "type": "integer", "minimum": 1 }
            }
        }))
}

// ============ Hashing ============

pub struct HashingVectorizer;

#[async_trait]
impl Vectorizer for HashingVectorizer {
    async fn embed(&self, chunks: &[TextChunk], config: &Value) -> Result<Vec<Vec<f32>>, StageError> {
        let dims = config["dims"].as_u64().unwrap_or(256).max(1) as usize;
        Ok(chunks.iter().map(|c| hash_embed(&c.text, dims)).collect())
    }
}

/// Signed feature-hashing embedding of `text` into `dims` dimensions.
pub fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dims];
    let tokens = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase);

    for token in tokens {
        let digest = Sha256::digest(token.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[index] += sign;
    }

    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

// ============ OpenAI ============

pub struct OpenAiVectorizer {
    config: EmbeddingConfig,
}

impl OpenAiVectorizer {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Vectorizer for OpenAiVectorizer {
    async fn embed(&self, chunks: &[TextChunk], config: &Value) -> Result<Vec<Vec<f32>>, StageError> {
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let model = config["model"]
            .as_str()
            .map(str::to_string)
            .or_else(|| self.config.model.clone())
            .ok_or_else(|| StageError::Embed("embedding.model required".to_string()))?;
        let dimensions = config["dimensions"].as_u64();
        embed_openai(&self.config, &model, dimensions, &texts).await
    }
}

/// Call the embeddings endpoint with retry/backoff and return vectors in
/// input order.
async fn embed_openai(
    config: &EmbeddingConfig,
    model: &str,
    dimensions: Option<u64>,
    texts: &[&str],
) -> Result<Vec<Vec<f32>>, StageError> {
    let api_key = std::env::var(&config.api_key_env)
        .map_err(|_| StageError::Embed(format!("{} not set", config.api_key_env)))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| StageError::Embed(e.to_string()))?;

    let mut body = json!({
        "model": model,
        "input": texts,
    });
    if let Some(d) = dimensions {
        body["dimensions"] = json!(d);
    }

    let backoff = BackoffPolicy {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(32),
        jitter_max: Duration::from_millis(250),
        max_retries: config.max_retries,
    };
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff.delay_for(attempt)).await;
        }

        let resp = client
            .post(&config.endpoint)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: Value = response
                        .json()
                        .await
                        .map_err(|e| StageError::Embed(e.to_string()))?;
                    return parse_openai_response(&json);
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = format!("embeddings API error {}: {}", status, body_text);

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(attempt, status = %status, "embedding request failed, retrying");
                    last_err = Some(err);
                    continue;
                }

                return Err(StageError::Embed(err));
            }
            Err(e) => {
                warn!(attempt, error = %e, "embedding request failed, retrying");
                last_err = Some(e.to_string());
            }
        }
    }

    Err(StageError::Embed(
        last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
    ))
}

/// Extract `data[].embedding`, ordered by each item's `index` when present.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, StageError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| StageError::Embed("invalid response: missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| StageError::Embed("invalid response: missing embedding".to_string()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
