//! Core data models for the question-answering pipeline.
//!
//! These types represent the documents, chunks, sessions, and answers that
//! flow through ingestion and retrieval. Identifiers are snowflake `i64`s
//! (see [`crate::snowflake`]); timestamps are Unix milliseconds.

use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// Accepted document source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Docx,
    Txt,
    Md,
    Pptx,
    Xlsx,
    Csv,
    Rtf,
    Url,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Docx => "docx",
            SourceType::Txt => "txt",
            SourceType::Md => "md",
            SourceType::Pptx => "pptx",
            SourceType::Xlsx => "xlsx",
            SourceType::Csv => "csv",
            SourceType::Rtf => "rtf",
            SourceType::Url => "url",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(SourceType::Pdf),
            "docx" => Ok(SourceType::Docx),
            "txt" => Ok(SourceType::Txt),
            "md" => Ok(SourceType::Md),
            "pptx" => Ok(SourceType::Pptx),
            "xlsx" => Ok(SourceType::Xlsx),
            "csv" => Ok(SourceType::Csv),
            "rtf" => Ok(SourceType::Rtf),
            "url" => Ok(SourceType::Url),
            other => Err(RagError::Validation(format!(
                "unknown source type: '{other}'"
            ))),
        }
    }
}

/// Document processing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(RagError::Validation(format!(
                "unknown document status: '{other}'"
            ))),
        }
    }
}

/// A logical source (uploaded file or scraped URL) stored in SQLite.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub name: String,
    pub source_type: SourceType,
    pub status: DocumentStatus,
    /// Open key-value metadata: size, content hash, source URL, provider fields.
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

/// Splitter output before identifiers are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub index: i64,
    pub content: String,
    pub start_char: i64,
    pub end_char: i64,
    pub token_count: i64,
}

/// An indexed passage belonging to exactly one document.
///
/// `vector_id` is the chunk's own id stringified; after a completed write it
/// references exactly one entry in both the relational store and the vector
/// index.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i64,
    pub document_id: i64,
    pub chunk_index: i64,
    pub vector_id: String,
    pub content: String,
    pub start_char: i64,
    pub end_char: i64,
    pub token_count: i64,
    pub created_at: i64,
}

/// A chunk surfaced by similarity search, carrying its index metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: i64,
    pub document_id: i64,
    pub chunk_index: i64,
    pub content: String,
    /// Raw similarity (1 − cosine distance) from the vector index.
    pub similarity: f64,
    /// Metadata blob mirrored from the vector index entry.
    pub metadata: serde_json::Value,
    /// Set by the ranker; absent when ranking is disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_score: Option<f64>,
}

impl RetrievedChunk {
    /// Score used for confidence: enhanced when ranked, raw otherwise.
    pub fn effective_score(&self) -> f64 {
        self.enhanced_score.unwrap_or(self.similarity)
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(RagError::Validation(format!(
                "unknown message role: '{other}'"
            ))),
        }
    }
}

/// A conversation container. Soft-deleted via `is_active` so the message
/// history survives for audit.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: i64,
    pub title: String,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

/// One turn of a conversation. Append-only, ordered by creation time.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub sources: Option<Vec<SourceRef>>,
    pub created_at: i64,
}

/// A conversation turn as fed into the optimizer and synthesizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: MessageRole,
    pub content: String,
}

/// A source citation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: i64,
    pub document_id: i64,
    pub chunk_index: i64,
    pub similarity: f64,
    pub enhanced_score: f64,
    /// Excerpt of the chunk content, truncated to 500 characters.
    pub content: String,
}

/// Structured answer returned by the query pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: f64,
    pub processing_time: f64,
    pub retrieved_documents: usize,
    pub query_optimized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_query: Option<String>,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_warning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tips: Vec<String>,
}
