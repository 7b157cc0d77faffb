//! Document lifecycle: registration, text ingestion, listing, deletion.
//!
//! Ingestion runs split-embed-store against the chunk store and tracks the
//! document's status through `processing`, `completed`, or `failed`. A
//! SHA-256 content hash in the metadata blob catches re-ingestion of
//! identical content.

use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{error, info};

use crate::config::ChunkingConfig;
use crate::error::{RagError, Result};
use crate::models::{Document, DocumentStatus, SourceType};
use crate::snowflake::IdGenerator;
use crate::splitter;
use crate::store::ChunkStore;

pub struct DocumentService {
    pool: SqlitePool,
    store: Arc<ChunkStore>,
    ids: Arc<IdGenerator>,
    chunking: ChunkingConfig,
}

impl DocumentService {
    pub fn new(
        pool: SqlitePool,
        store: Arc<ChunkStore>,
        ids: Arc<IdGenerator>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            pool,
            store,
            ids,
            chunking,
        }
    }

    /// Register a document in status `processing`.
    pub async fn create_document(
        &self,
        name: &str,
        source_type: SourceType,
        metadata: serde_json::Value,
    ) -> Result<Document> {
        if name.trim().is_empty() {
            return Err(RagError::Validation("document name must not be empty".to_string()));
        }

        let id = self.ids.next_id()?;
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO documents (id, name, source_type, status, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name.trim())
        .bind(source_type.as_str())
        .bind(DocumentStatus::Processing.as_str())
        .bind(metadata.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Document {
            id,
            name: name.trim().to_string(),
            source_type,
            status: DocumentStatus::Processing,
            metadata,
            created_at: now,
            updated_at: None,
        })
    }

    /// Split, embed, and store text for an already-registered document,
    /// moving it to `completed`, or to `failed` with the failure message
    /// recorded in its metadata.
    pub async fn process_text(&self, mut document: Document, text: &str) -> Result<Document> {
        let result = async {
            let drafts = splitter::split_text(text, &self.chunking)?;
            self.store.store_chunks(&document, &drafts).await
        }
        .await;

        match result {
            Ok(chunks) => {
                document.metadata["chunk_count"] = serde_json::json!(chunks.len());
                self.set_status(document.id, DocumentStatus::Completed, &document.metadata)
                    .await?;
                document.status = DocumentStatus::Completed;
                info!(
                    document_id = document.id,
                    chunks = chunks.len(),
                    "document ingested"
                );
                Ok(document)
            }
            Err(e) => {
                error!(document_id = document.id, error = %e, "ingestion failed");
                document.metadata["error"] = serde_json::json!(e.to_string());
                self.set_status(document.id, DocumentStatus::Failed, &document.metadata)
                    .await?;
                Err(e)
            }
        }
    }

    /// Ingest a document's extracted text end to end: duplicate check,
    /// registration, then [`DocumentService::process_text`].
    pub async fn ingest_text(
        &self,
        name: &str,
        source_type: SourceType,
        text: &str,
    ) -> Result<Document> {
        let content_hash = format!("{:x}", Sha256::digest(text.as_bytes()));
        if let Some(existing) = self.find_by_hash(&content_hash).await? {
            return Err(RagError::Validation(format!(
                "identical content already ingested as document {existing}"
            )));
        }

        let metadata = serde_json::json!({
            "content_hash": content_hash,
            "char_count": text.chars().count(),
        });
        let document = self.create_document(name, source_type, metadata).await?;
        self.process_text(document, text).await
    }

    pub async fn get_document(&self, document_id: i64) -> Result<Document> {
        let row = sqlx::query(
            "SELECT id, name, source_type, status, metadata, created_at, updated_at \
             FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RagError::DocumentNotFound(document_id))?;
        document_from_row(&row)
    }

    /// All documents, newest first.
    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, name, source_type, status, metadata, created_at, updated_at \
             FROM documents ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    /// Remove a document, its chunk rows, and its vectors.
    pub async fn delete_document(&self, document_id: i64) -> Result<()> {
        self.get_document(document_id).await?;
        self.store.delete_document_chunks(document_id).await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        info!(document_id, "deleted document");
        Ok(())
    }

    async fn set_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("UPDATE documents SET status = ?, metadata = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(metadata.to_string())
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT id FROM documents WHERE json_extract(metadata, '$.content_hash') = ?",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let source_type: String = row.get("source_type");
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    Ok(Document {
        id: row.get("id"),
        name: row.get("name"),
        source_type: SourceType::from_str(&source_type)?,
        status: DocumentStatus::from_str(&status)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::{create_provider, EmbeddingGateway};
    use crate::migrate;
    use crate::vector::MemoryIndex;

    async fn service() -> DocumentService {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        migrate::run(&pool).await.unwrap();

        let config = EmbeddingConfig {
            provider: "hash".to_string(),
            dims: 64,
            pacing_delay_ms: 0,
            ..Default::default()
        };
        let ids = Arc::new(IdGenerator::new(1, 1).unwrap());
        let store = Arc::new(ChunkStore::new(
            pool.clone(),
            Arc::new(MemoryIndex::new()),
            Arc::new(EmbeddingGateway::new(
                create_provider(&config).unwrap(),
                &config,
            )),
            ids.clone(),
        ));
        DocumentService::new(pool, store, ids, ChunkingConfig::default())
    }

    #[tokio::test]
    async fn test_ingest_completes_document() {
        let svc = service().await;
        let text = "The handbook covers vacation policy.\n\nIt also covers expenses.";
        let doc = svc.ingest_text("handbook", SourceType::Txt, text).await.unwrap();

        assert_eq!(doc.status, DocumentStatus::Completed);
        assert!(doc.metadata["chunk_count"].as_u64().unwrap() >= 1);

        let fetched = svc.get_document(doc.id).await.unwrap();
        assert_eq!(fetched.status, DocumentStatus::Completed);
        assert_eq!(fetched.name, "handbook");
    }

    #[tokio::test]
    async fn test_ingest_empty_text_marks_failed() {
        let svc = service().await;
        let err = svc
            .ingest_text("empty", SourceType::Txt, "   \n  ")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let docs = svc.list_documents().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, DocumentStatus::Failed);
        assert!(docs[0].metadata["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_create_then_process_separately() {
        let svc = service().await;
        let doc = svc
            .create_document("staged", SourceType::Txt, serde_json::json!({"origin": "api"}))
            .await
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);

        let done = svc
            .process_text(doc, "text arriving after registration")
            .await
            .unwrap();
        assert_eq!(done.status, DocumentStatus::Completed);
        assert_eq!(done.metadata["origin"], "api");
    }

    #[tokio::test]
    async fn test_duplicate_content_rejected() {
        let svc = service().await;
        let text = "identical content body";
        svc.ingest_text("first", SourceType::Txt, text).await.unwrap();

        let err = svc
            .ingest_text("second", SourceType::Txt, text)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("already ingested"));
        assert_eq!(svc.list_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_document_removes_everything() {
        let svc = service().await;
        let doc = svc
            .ingest_text("doomed", SourceType::Md, "content that will be deleted soon")
            .await
            .unwrap();

        svc.delete_document(doc.id).await.unwrap();
        assert_eq!(svc.store.vector_count().await.unwrap(), 0);
        let err = svc.get_document(doc.id).await.unwrap_err();
        assert_eq!(err.kind(), "document_not_found");
    }

    #[tokio::test]
    async fn test_delete_unknown_document() {
        let svc = service().await;
        let err = svc.delete_document(12345).await.unwrap_err();
        assert_eq!(err.kind(), "document_not_found");
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let svc = service().await;
        svc.ingest_text("older", SourceType::Txt, "first document text")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        svc.ingest_text("newer", SourceType::Txt, "second document text")
            .await
            .unwrap();

        let docs = svc.list_documents().await.unwrap();
        assert_eq!(docs[0].name, "newer");
        assert_eq!(docs[1].name, "older");
    }
}
