//! Embedding gateway: turns batches of text into vectors.
//!
//! The [`EmbeddingProvider`] trait is the seam to the external provider;
//! [`EmbeddingGateway`] layers batch splitting (providers cap texts per
//! call) and rate-limit pacing on top of it. A call either returns one
//! vector per input text or fails as a whole — no partial results.
//!
//! Two providers:
//! - **[`OpenAiEmbeddings`]** — the OpenAI embeddings API.
//! - **[`HashEmbeddings`]** — deterministic local vectors derived from a
//!   content hash, for offline use and tests. Identical text always maps to
//!   the identical vector, so stored content is its own nearest neighbor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

/// An external embedding backend.
///
/// Implementations must return vectors in input order, one per text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embed one provider-sized batch. Callers go through
    /// [`EmbeddingGateway`], which enforces the batch limit.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate the configured provider.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbeddings::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbeddings::new(config.dims))),
        other => Err(RagError::Validation(format!(
            "unknown embedding provider: '{other}'"
        ))),
    }
}

/// Batching and pacing wrapper around an [`EmbeddingProvider`].
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    pacing_delay: Duration,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            pacing_delay: Duration::from_millis(config.pacing_delay_ms),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed an arbitrarily large batch, splitting into provider-sized
    /// sub-batches issued sequentially with a pacing delay between them.
    ///
    /// All-or-nothing: any sub-batch failure fails the whole call.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());

        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.pacing_delay.is_zero() {
                tokio::time::sleep(self.pacing_delay).await;
            }
            let vectors = self.provider.embed_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(RagError::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            all.extend(vectors);
        }

        debug!(count = texts.len(), "generated embeddings");
        Ok(all)
    }

    /// Embed a single query text, with no batching.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.provider.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Embedding("empty embedding response".to_string()))
    }
}

// ============ OpenAI provider ============

/// Embedding provider backed by the OpenAI `POST /embeddings` endpoint.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            RagError::Validation("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Embedding(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::Timeout(format!("embedding request timed out: {e}"))
                } else {
                    RagError::Embedding(format!("embedding request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "embedding API error {status}: {body_text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::Embedding(format!("invalid embedding response: {e}")))?;

        parse_embeddings_response(&json)
    }
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::Embedding("missing data array in response".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| RagError::Embedding("missing embedding in response".to_string()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Hash provider ============

/// Deterministic local embeddings derived from a SHA-256 content hash.
///
/// Not semantically meaningful, but stable: the same text always produces
/// the same unit vector, which is enough for offline smoke testing and for
/// exercising the dual-store pipeline without a network dependency.
pub struct HashEmbeddings {
    dims: usize,
}

impl HashEmbeddings {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_vector(t, self.dims)).collect())
    }
}

fn hash_vector(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = Vec::with_capacity(dims);
    let mut counter: u32 = 0;
    while vec.len() < dims {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_le_bytes());
        hasher.update(text.as_bytes());
        for byte in hasher.finalize() {
            if vec.len() == dims {
                break;
            }
            vec.push(byte as f32 / 255.0 - 0.5);
        }
        counter += 1;
    }

    // Normalize so cosine distance behaves like the real provider's output.
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}
