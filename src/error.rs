//! Error taxonomy for the question-answering pipeline.
//!
//! Every error carries a stable machine-readable kind (see [`RagError::kind`])
//! plus a human-readable message. Validation and not-found errors are
//! rejected at the pipeline boundary; embedding/vector/LLM failures are
//! candidates for caller-driven retry. [`RagError::VectorWriteIncomplete`]
//! is deliberately distinct from [`RagError::VectorIndex`]: relational rows
//! were committed and only the vector side is missing, so the fix is a
//! targeted resync rather than a full re-ingest.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// Malformed input rejected before any I/O.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Reading or extracting text from a source file failed.
    #[error("text extraction failed: {0}")]
    Extraction(String),

    /// The embedding provider returned an error; nothing was persisted.
    #[error("embedding generation failed: {0}")]
    Embedding(String),

    /// The vector index is unreachable or rejected the request.
    #[error("vector index error: {0}")]
    VectorIndex(String),

    /// Relational rows committed but the vector write failed. The listed
    /// vector ids can be re-synced without re-ingesting the document.
    #[error("vector write incomplete for document {document_id}: {reason} ({} vectors pending)", vector_ids.len())]
    VectorWriteIncomplete {
        document_id: i64,
        vector_ids: Vec<String>,
        reason: String,
    },

    /// An external call exceeded its time budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("chat session {0} not found")]
    SessionNotFound(i64),

    #[error("chunk {0} not found")]
    ChunkNotFound(i64),

    #[error("document {0} not found")]
    DocumentNotFound(i64),

    /// The completion provider failed.
    #[error("llm request failed: {0}")]
    Llm(String),

    /// Wall clock moved backwards past the last generated identifier.
    #[error("clock moved backwards; refusing to generate identifier")]
    ClockSkew,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RagError {
    /// Stable kind string for API surfaces and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation",
            RagError::Extraction(_) => "extraction",
            RagError::Embedding(_) => "embedding",
            RagError::VectorIndex(_) => "vector_index",
            RagError::VectorWriteIncomplete { .. } => "vector_write_incomplete",
            RagError::Timeout(_) => "timeout",
            RagError::SessionNotFound(_) => "session_not_found",
            RagError::ChunkNotFound(_) => "chunk_not_found",
            RagError::DocumentNotFound(_) => "document_not_found",
            RagError::Llm(_) => "llm",
            RagError::ClockSkew => "clock_skew",
            RagError::Database(_) => "database",
        }
    }

    /// Whether a caller-driven retry of the same call is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::Embedding(_)
                | RagError::VectorIndex(_)
                | RagError::Timeout(_)
                | RagError::Llm(_)
        )
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
