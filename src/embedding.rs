//! Embedding provider client.
//!
//! Talks to an OpenAI-style `/embeddings` endpoint. Inputs are trimmed and
//! tail-truncated before submission; transient failures (network, 5xx,
//! 429) are retried with exponential backoff and jitter. A process-wide
//! token bucket gates calls to the provider.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::config::EmbeddingConfig;
use crate::core::errors::CoreError;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 250;

type EmbeddingLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Turns text into fixed-dimension vectors. Safe for concurrent use.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CoreError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;
}

pub struct HttpEmbeddingClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
    max_input_chars: usize,
    timeout: Duration,
    limiter: Arc<EmbeddingLimiter>,
}

impl HttpEmbeddingClient {
    pub fn new(base_url: String, api_key: Option<String>, config: &EmbeddingConfig) -> Self {
        let per_minute =
            NonZeroU32::new(config.requests_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            dim: config.dim,
            max_input_chars: config.max_input_chars,
            timeout: Duration::from_millis(config.timeout_ms),
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        }
    }

    /// Trim and keep at most the trailing `max_input_chars` characters.
    fn prepare_input(&self, text: &str) -> String {
        let trimmed = text.trim();
        let total = trimmed.chars().count();
        if total <= self.max_input_chars {
            return trimmed.to_string();
        }
        trimmed
            .chars()
            .skip(total - self.max_input_chars)
            .collect()
    }

    async fn request_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "input": inputs,
            "model": self.model,
        });

        let mut request = self.client.post(&url).timeout(self.timeout).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(CoreError::transient)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("embedding provider returned {status}: {text}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                CoreError::Transient(message)
            } else {
                CoreError::Permanent(message)
            });
        }

        let payload: Value = response.json().await.map_err(CoreError::transient)?;
        parse_embedding_response(payload, self.dim)
    }
}

#[async_trait]
impl Embedder for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            CoreError::Permanent("embedding provider returned no vectors".to_string())
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Vec<String> = texts.iter().map(|t| self.prepare_input(t)).collect();
        self.limiter.until_ready().await;

        let mut attempt = 0;
        loop {
            match self.request_embeddings(&inputs).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) if err.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        "embedding attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Exponential backoff with ±25% jitter around the nominal delay.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_MS * 2u64.saturating_pow(attempt);
    let jitter = base / 4;
    let offset = rand::thread_rng().gen_range(0..=jitter * 2);
    Duration::from_millis(base - jitter + offset)
}

fn parse_embedding_response(payload: Value, dim: usize) -> Result<Vec<Vec<f32>>, CoreError> {
    let data = payload
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            CoreError::Permanent("embedding response missing data array".to_string())
        })?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback_index);
        let values = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                CoreError::Permanent("embedding item missing embedding array".to_string())
            })?;

        let mut vector = Vec::with_capacity(values.len());
        for value in values {
            let number = value.as_f64().ok_or_else(|| {
                CoreError::Permanent("embedding value must be numeric".to_string())
            })?;
            vector.push(number as f32);
        }
        if vector.len() != dim {
            return Err(CoreError::Permanent(format!(
                "embedding dimension {} does not match expected {}",
                vector.len(),
                dim
            )));
        }
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}
