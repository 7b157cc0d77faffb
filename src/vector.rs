//! Vector index service interface.
//!
//! The [`VectorIndex`] trait mirrors the external index API: upsert vectors
//! with a document payload and metadata blob, query nearest neighbors with
//! an optional document filter, delete by id, count. Distances are cosine
//! distances; the chunk store converts them to similarities.
//!
//! Implementations:
//! - **[`MemoryIndex`]** — in-process brute-force index for tests and
//!   offline use.
//! - **[`ChromaIndex`]** — a Chroma-compatible HTTP service.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::VectorConfig;
use crate::error::{RagError, Result};

/// One entry to upsert into the index.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    /// The chunk text stored alongside the vector.
    pub document: String,
    /// Mirrors {document_id, chunk_id, chunk_index, start_char, end_char, token_count}.
    pub metadata: serde_json::Value,
}

/// A nearest-neighbor match, closest first.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    /// Cosine distance (0 = identical direction).
    pub distance: f64,
    pub document: String,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Query the k nearest neighbors, optionally pre-filtered to one
    /// document. Results come back nearest-first.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_id: Option<i64>,
    ) -> Result<Vec<VectorMatch>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

/// Instantiate the configured index backend.
pub fn create_index(config: &VectorConfig) -> Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        "chroma" => Ok(Arc::new(ChromaIndex::new(config)?)),
        other => Err(RagError::Validation(format!(
            "unknown vector provider: '{other}'"
        ))),
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

// ============ In-memory index ============

struct MemoryEntry {
    vector: Vec<f32>,
    document: String,
    metadata: serde_json::Value,
}

/// Brute-force cosine index behind a mutex.
pub struct MemoryIndex {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut entries = self.entries.lock().expect("memory index mutex poisoned");
        for record in records {
            entries.insert(
                record.id,
                MemoryEntry {
                    vector: record.vector,
                    document: record.document,
                    metadata: record.metadata,
                },
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_id: Option<i64>,
    ) -> Result<Vec<VectorMatch>> {
        let entries = self.entries.lock().expect("memory index mutex poisoned");

        let mut matches: Vec<VectorMatch> = entries
            .iter()
            .filter(|(_, e)| match document_id {
                Some(doc_id) => e.metadata.get("document_id").and_then(|v| v.as_i64()) == Some(doc_id),
                None => true,
            })
            .map(|(id, e)| VectorMatch {
                id: id.clone(),
                distance: 1.0 - cosine_similarity(vector, &e.vector) as f64,
                document: e.document.clone(),
                metadata: e.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut entries = self.entries.lock().expect("memory index mutex poisoned");
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.lock().expect("memory index mutex poisoned").len())
    }
}

// ============ Chroma HTTP index ============

/// Vector index backed by a Chroma-compatible HTTP service.
pub struct ChromaIndex {
    client: reqwest::Client,
    base_url: String,
    collection_name: String,
    collection_id: OnceCell<String>,
}

impl ChromaIndex {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::VectorIndex(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection_name: config.collection.clone(),
            collection_id: OnceCell::new(),
        })
    }

    fn map_send_error(e: reqwest::Error) -> RagError {
        if e.is_timeout() {
            RagError::Timeout(format!("vector index request timed out: {e}"))
        } else {
            RagError::VectorIndex(format!("vector index request failed: {e}"))
        }
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::VectorIndex(format!(
                "vector index error {status}: {text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RagError::VectorIndex(format!("invalid vector index response: {e}")))
    }

    /// Resolve (and lazily create) the collection, caching its id.
    async fn collection_id(&self) -> Result<&str> {
        self.collection_id
            .get_or_try_init(|| async {
                let body = serde_json::json!({
                    "name": self.collection_name,
                    "get_or_create": true,
                });
                let json = self.post_json("/api/v1/collections", &body).await?;
                json.get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        RagError::VectorIndex("collection response missing id".to_string())
                    })
            })
            .await
            .map(|s| s.as_str())
    }
}

#[async_trait]
impl VectorIndex for ChromaIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let collection = self.collection_id().await?;

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let embeddings: Vec<&[f32]> = records.iter().map(|r| r.vector.as_slice()).collect();
        let documents: Vec<&str> = records.iter().map(|r| r.document.as_str()).collect();
        let metadatas: Vec<&serde_json::Value> = records.iter().map(|r| &r.metadata).collect();

        let body = serde_json::json!({
            "ids": ids,
            "embeddings": embeddings,
            "documents": documents,
            "metadatas": metadatas,
        });
        self.post_json(&format!("/api/v1/collections/{collection}/upsert"), &body)
            .await?;

        debug!(count = records.len(), "upserted vectors");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_id: Option<i64>,
    ) -> Result<Vec<VectorMatch>> {
        let collection = self.collection_id().await?;

        let mut body = serde_json::json!({
            "query_embeddings": [vector],
            "n_results": k,
            "include": ["documents", "distances", "metadatas"],
        });
        if let Some(doc_id) = document_id {
            body["where"] = serde_json::json!({ "document_id": doc_id });
        }

        let json = self
            .post_json(&format!("/api/v1/collections/{collection}/query"), &body)
            .await?;

        let ids = first_row(&json, "ids");
        let distances = first_row(&json, "distances");
        let documents = first_row(&json, "documents");
        let metadatas = first_row(&json, "metadatas");

        let mut matches = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            matches.push(VectorMatch {
                id: id.as_str().unwrap_or_default().to_string(),
                distance: distances.get(i).and_then(|d| d.as_f64()).unwrap_or(1.0),
                document: documents
                    .get(i)
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
                metadata: metadatas.get(i).cloned().unwrap_or(serde_json::json!({})),
            });
        }
        Ok(matches)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let collection = self.collection_id().await?;
        let body = serde_json::json!({ "ids": ids });
        self.post_json(&format!("/api/v1/collections/{collection}/delete"), &body)
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let collection = self.collection_id().await?;
        let response = self
            .client
            .get(format!(
                "{}/api/v1/collections/{collection}/count",
                self.base_url
            ))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::VectorIndex(format!(
                "vector index error {status}: {text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::VectorIndex(format!("invalid count response: {e}")))?;
        json.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| RagError::VectorIndex("count response was not a number".to_string()))
    }
}

/// Chroma nests query results one level deep (one row per query vector).
fn first_row<'a>(json: &'a serde_json::Value, key: &str) -> Vec<serde_json::Value> {
    json.get(key)
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first())
        .and_then(|row| row.as_array())
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, vector: Vec<f32>, doc_id: i64) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector,
            document: format!("text for {id}"),
            metadata: serde_json::json!({ "document_id": doc_id, "chunk_id": 1 }),
        }
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_mismatched() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_memory_index_nearest_first() {
        let index = MemoryIndex::new();
        index
            .upsert(vec![
                record("a", vec![1.0, 0.0], 1),
                record("b", vec![0.7, 0.7], 1),
                record("c", vec![0.0, 1.0], 1),
            ])
            .await
            .unwrap();

        let matches = index.query(&[1.0, 0.0], 3, None).await.unwrap();
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].id, "a");
        assert!(matches[0].distance < matches[1].distance);
        assert!(matches[1].distance < matches[2].distance);
    }

    #[tokio::test]
    async fn test_memory_index_document_filter() {
        let index = MemoryIndex::new();
        index
            .upsert(vec![
                record("a", vec![1.0, 0.0], 1),
                record("b", vec![1.0, 0.0], 2),
            ])
            .await
            .unwrap();

        let matches = index.query(&[1.0, 0.0], 10, Some(2)).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "b");
    }

    #[tokio::test]
    async fn test_memory_index_delete_and_count() {
        let index = MemoryIndex::new();
        index
            .upsert(vec![
                record("a", vec![1.0, 0.0], 1),
                record("b", vec![0.0, 1.0], 1),
            ])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 2);

        index.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let matches = index.query(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(matches[0].id, "b");
    }

    #[tokio::test]
    async fn test_memory_index_upsert_replaces() {
        let index = MemoryIndex::new();
        index
            .upsert(vec![record("a", vec![1.0, 0.0], 1)])
            .await
            .unwrap();
        index
            .upsert(vec![record("a", vec![0.0, 1.0], 1)])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 1);

        let matches = index.query(&[0.0, 1.0], 1, None).await.unwrap();
        assert!(matches[0].distance < 1e-6);
    }

    #[test]
    fn test_first_row_unwraps_nested_results() {
        let json = serde_json::json!({
            "ids": [["a", "b"]],
            "distances": [[0.1, 0.4]],
        });
        let ids = first_row(&json, "ids");
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].as_str(), Some("a"));
        assert!(first_row(&json, "missing").is_empty());
    }
}
