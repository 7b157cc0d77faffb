//! Dual-write chunk store.
//!
//! Chunks live in two places: SQLite rows (the durable source of truth) and
//! the vector index (the search surface). Writes are ordered so that a
//! failure leaves a recoverable state:
//!
//! - **store**: embed everything first, then commit the relational rows,
//!   then upsert vectors. A vector failure after commit surfaces as
//!   [`RagError::VectorWriteIncomplete`], fixable via [`ChunkStore::resync_document`].
//! - **delete**: remove vectors first, then delete rows in one transaction,
//!   so a stray vector entry never outlives its row unnoticed.
//! - **update**: re-embed, swap the vector entry, commit the row last.

use std::sync::Arc;

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{info, warn};

use crate::embedding::EmbeddingGateway;
use crate::error::{RagError, Result};
use crate::models::{Chunk, ChunkDraft, Document, RetrievedChunk};
use crate::snowflake::IdGenerator;
use crate::vector::{VectorIndex, VectorRecord};

pub struct ChunkStore {
    pool: SqlitePool,
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingGateway>,
    ids: Arc<IdGenerator>,
}

impl ChunkStore {
    pub fn new(
        pool: SqlitePool,
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingGateway>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            pool,
            index,
            embeddings,
            ids,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a document's chunks to both stores.
    ///
    /// Chunk indices are re-assigned contiguously from 0 in draft order, and
    /// each chunk's `vector_id` is its own id stringified. Rows are committed
    /// before the vector upsert; see the module docs for failure semantics.
    pub async fn store_chunks(
        &self,
        document: &Document,
        drafts: &[ChunkDraft],
    ) -> Result<Vec<Chunk>> {
        if drafts.is_empty() {
            return Err(RagError::Validation("no chunks to store".to_string()));
        }
        if drafts.iter().any(|d| d.content.trim().is_empty()) {
            return Err(RagError::Validation(
                "chunk content must not be empty".to_string(),
            ));
        }

        let texts: Vec<String> = drafts.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut chunks = Vec::with_capacity(drafts.len());
        for (i, draft) in drafts.iter().enumerate() {
            let id = self.ids.next_id()?;
            chunks.push(Chunk {
                id,
                document_id: document.id,
                chunk_index: i as i64,
                vector_id: id.to_string(),
                content: draft.content.clone(),
                start_char: draft.start_char,
                end_char: draft.end_char,
                token_count: draft.token_count,
                created_at: now,
            });
        }

        let mut tx = self.pool.begin().await?;
        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO document_chunks \
                 (id, document_id, chunk_index, vector_id, content, start_char, end_char, token_count, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.id)
            .bind(chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.vector_id)
            .bind(&chunk.content)
            .bind(chunk.start_char)
            .bind(chunk.end_char)
            .bind(chunk.token_count)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                id: chunk.vector_id.clone(),
                vector,
                document: chunk.content.clone(),
                metadata: vector_metadata(document, chunk),
            })
            .collect();

        if let Err(e) = self.index.upsert(records).await {
            warn!(
                document_id = document.id,
                error = %e,
                "vector upsert failed after row commit"
            );
            return Err(RagError::VectorWriteIncomplete {
                document_id: document.id,
                vector_ids: chunks.iter().map(|c| c.vector_id.clone()).collect(),
                reason: e.to_string(),
            });
        }

        info!(
            document_id = document.id,
            chunks = chunks.len(),
            "stored document chunks"
        );
        Ok(chunks)
    }

    /// Remove all of a document's chunks from both stores. Succeeds as a
    /// no-op when the document has none.
    pub async fn delete_document_chunks(&self, document_id: i64) -> Result<usize> {
        let vector_ids: Vec<String> =
            sqlx::query("SELECT vector_id FROM document_chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|row| row.get::<String, _>("vector_id"))
                .collect();

        if vector_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        self.index.delete(&vector_ids).await?;
        sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            document_id,
            chunks = vector_ids.len(),
            "deleted document chunks"
        );
        Ok(vector_ids.len())
    }

    /// Replace one chunk's content: re-embed, swap the vector entry, then
    /// commit the row. The row keeps its old content until the index holds
    /// the new entry.
    pub async fn update_chunk(&self, chunk_id: i64, content: &str) -> Result<Chunk> {
        if content.trim().is_empty() {
            return Err(RagError::Validation(
                "chunk content must not be empty".to_string(),
            ));
        }

        let row = sqlx::query(
            "SELECT c.id, c.document_id, c.chunk_index, c.vector_id, c.start_char, c.end_char, c.created_at, \
                    d.name, d.source_type, d.created_at AS doc_created_at \
             FROM document_chunks c JOIN documents d ON d.id = c.document_id \
             WHERE c.id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RagError::ChunkNotFound(chunk_id))?;

        let vector = self.embeddings.embed_query(content).await?;
        let vector_id: String = row.get("vector_id");
        let token_count = (content.chars().count() / 4) as i64;

        let chunk = Chunk {
            id: chunk_id,
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            vector_id: vector_id.clone(),
            content: content.to_string(),
            start_char: row.get("start_char"),
            end_char: row.get("end_char"),
            token_count,
            created_at: row.get("created_at"),
        };

        self.index.delete(std::slice::from_ref(&vector_id)).await?;
        let metadata = serde_json::json!({
            "document_id": chunk.document_id,
            "chunk_id": chunk.id,
            "chunk_index": chunk.chunk_index,
            "start_char": chunk.start_char,
            "end_char": chunk.end_char,
            "token_count": token_count,
            "title": row.get::<String, _>("name"),
            "document_type": row.get::<String, _>("source_type"),
            "created_at": row.get::<i64, _>("doc_created_at"),
        });
        self.index
            .upsert(vec![VectorRecord {
                id: vector_id,
                vector,
                document: content.to_string(),
                metadata,
            }])
            .await?;

        sqlx::query("UPDATE document_chunks SET content = ?, token_count = ? WHERE id = ?")
            .bind(content)
            .bind(token_count)
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;

        Ok(chunk)
    }

    /// Embed the question and query the index, converting distances to
    /// similarities and dropping anything below `threshold`.
    pub async fn similarity_search(
        &self,
        question: &str,
        k: usize,
        threshold: f64,
        document_id: Option<i64>,
    ) -> Result<Vec<RetrievedChunk>> {
        if question.trim().is_empty() {
            return Err(RagError::Validation("question must not be empty".to_string()));
        }

        let query_vector = self.embeddings.embed_query(question).await?;
        let matches = self.index.query(&query_vector, k, document_id).await?;

        let mut retrieved = Vec::with_capacity(matches.len());
        for m in matches {
            let similarity = 1.0 - m.distance;
            if similarity < threshold {
                continue;
            }
            retrieved.push(RetrievedChunk {
                chunk_id: m
                    .metadata
                    .get("chunk_id")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_else(|| m.id.parse().unwrap_or(0)),
                document_id: m
                    .metadata
                    .get("document_id")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                chunk_index: m
                    .metadata
                    .get("chunk_index")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                content: m.document,
                similarity,
                metadata: m.metadata,
                enhanced_score: None,
            });
        }
        Ok(retrieved)
    }

    /// Re-embed and upsert every chunk of a document into the index.
    ///
    /// Repairs the partial state left behind by a failed vector write; the
    /// upsert is idempotent, so resyncing a healthy document is harmless.
    pub async fn resync_document(&self, document_id: i64) -> Result<usize> {
        let doc_row = sqlx::query("SELECT name, source_type, created_at FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RagError::DocumentNotFound(document_id))?;

        let rows = sqlx::query(
            "SELECT id, chunk_index, vector_id, content, start_char, end_char, token_count \
             FROM document_chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = rows.iter().map(|r| r.get("content")).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;

        let title: String = doc_row.get("name");
        let doc_type: String = doc_row.get("source_type");
        let doc_created: i64 = doc_row.get("created_at");

        let records: Vec<VectorRecord> = rows
            .iter()
            .zip(vectors)
            .map(|(row, vector)| VectorRecord {
                id: row.get("vector_id"),
                vector,
                document: row.get("content"),
                metadata: serde_json::json!({
                    "document_id": document_id,
                    "chunk_id": row.get::<i64, _>("id"),
                    "chunk_index": row.get::<i64, _>("chunk_index"),
                    "start_char": row.get::<i64, _>("start_char"),
                    "end_char": row.get::<i64, _>("end_char"),
                    "token_count": row.get::<i64, _>("token_count"),
                    "title": title,
                    "document_type": doc_type,
                    "created_at": doc_created,
                }),
            })
            .collect();

        let count = records.len();
        self.index.upsert(records).await?;
        info!(document_id, chunks = count, "resynced document vectors");
        Ok(count)
    }

    /// Number of chunk rows for a document.
    pub async fn chunk_count(&self, document_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM document_chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Number of entries in the vector index.
    pub async fn vector_count(&self) -> Result<usize> {
        self.index.count().await
    }
}

fn vector_metadata(document: &Document, chunk: &Chunk) -> serde_json::Value {
    serde_json::json!({
        "document_id": chunk.document_id,
        "chunk_id": chunk.id,
        "chunk_index": chunk.chunk_index,
        "start_char": chunk.start_char,
        "end_char": chunk.end_char,
        "token_count": chunk.token_count,
        "title": document.name,
        "document_type": document.source_type.as_str(),
        "created_at": document.created_at,
    })
}
