//! Retrieval-augmented answer pipeline.
//!
//! `query` runs the full path: cache lookup, query optimization, similarity
//! search, re-ranking, prompt assembly, completion, and source attribution.
//! When retrieval comes back empty the pipeline skips the completion call
//! entirely and returns a structured no-results response with suggestions.
//! `stream_query` runs the same path but delivers the answer as deltas.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::QueryCache;
use crate::config::{CacheConfig, RankingConfig, RetrievalConfig};
use crate::error::{RagError, Result};
use crate::llm::{LlmMessage, LlmProvider};
use crate::models::{HistoryTurn, QueryResponse, RetrievedChunk, SourceRef};
use crate::optimizer;
use crate::rank::Ranker;
use crate::store::ChunkStore;

/// Answers slower than this get a performance warning attached.
const SLOW_QUERY_SECS: f64 = 5.0;

/// Source excerpts are clamped to this many characters.
const EXCERPT_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "You are a document question-answering assistant. \
Answer using only the provided document excerpts. Cite which document an \
answer comes from when possible. If the excerpts do not contain the answer, \
say so plainly instead of guessing.";

/// Per-query knobs. `use_cache` defaults to off so conversational callers
/// opt in explicitly.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Restrict retrieval to one document.
    pub document_id: Option<i64>,
    /// Prior conversation turns, oldest first.
    pub history: Vec<HistoryTurn>,
    pub use_cache: bool,
    /// Document type to boost during ranking.
    pub preferred_type: Option<String>,
}

/// A streaming answer: attribution up front, content as deltas.
pub struct AnswerStream {
    pub sources: Vec<SourceRef>,
    pub confidence: f64,
    pub query_optimized: bool,
    pub original_query: Option<String>,
    pub deltas: mpsc::Receiver<Result<String>>,
}

pub struct RagPipeline {
    store: Arc<ChunkStore>,
    ranker: Ranker,
    cache: QueryCache,
    llm: Arc<dyn LlmProvider>,
    retrieval: RetrievalConfig,
}

impl RagPipeline {
    pub fn new(
        store: Arc<ChunkStore>,
        llm: Arc<dyn LlmProvider>,
        retrieval: RetrievalConfig,
        ranking: RankingConfig,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            store,
            ranker: Ranker::new(ranking),
            cache: QueryCache::new(cache),
            llm,
            retrieval,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Answer a question against the indexed documents.
    pub async fn query(&self, question: &str, options: &QueryOptions) -> Result<QueryResponse> {
        let started = Instant::now();
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::Validation("question must not be empty".to_string()));
        }

        // History-bearing queries are conversation-specific; caching them
        // would leak answers across contexts.
        let cacheable = options.use_cache && options.history.is_empty();
        let cache_key = QueryCache::key(
            question,
            options.document_id,
            self.retrieval.similarity_threshold,
        );
        if cacheable {
            if let Some(mut cached) = self.cache.get(&cache_key) {
                cached.from_cache = true;
                cached.processing_time = started.elapsed().as_secs_f64();
                return Ok(cached);
            }
        }

        let optimized = optimizer::optimize_query(question, &options.history);
        let chunks = self
            .store
            .similarity_search(
                &optimized.text,
                self.retrieval.top_k,
                self.retrieval.similarity_threshold,
                options.document_id,
            )
            .await?;

        if chunks.is_empty() {
            info!(question, "no chunks above threshold");
            let mut response = no_results_response(question, options.document_id);
            response.processing_time = started.elapsed().as_secs_f64();
            response.query_optimized = optimized.was_optimized;
            response.original_query = optimized
                .was_optimized
                .then(|| question.to_string());
            return Ok(response);
        }

        let ranked = self
            .ranker
            .rank(chunks, question, options.preferred_type.as_deref());

        let messages = build_messages(question, &ranked, &options.history);
        let answer = self.llm.complete(&messages).await?;

        let sources = source_refs(&ranked);
        let confidence = mean_confidence(&ranked);
        let processing_time = started.elapsed().as_secs_f64();
        if processing_time > SLOW_QUERY_SECS {
            warn!(question, processing_time, "slow query");
        }

        let response = QueryResponse {
            answer,
            retrieved_documents: ranked.len(),
            confidence,
            processing_time,
            query_optimized: optimized.was_optimized,
            original_query: optimized.was_optimized.then(|| question.to_string()),
            from_cache: false,
            performance_warning: (processing_time > SLOW_QUERY_SECS).then(|| {
                format!("query took {processing_time:.1}s, consider narrowing the document scope")
            }),
            sources,
            suggestions: vec![],
            alternative_queries: vec![],
            tips: vec![],
        };

        if cacheable {
            // Timing and cache provenance are per-request, not part of the
            // cached value.
            let mut stored = response.clone();
            stored.processing_time = 0.0;
            stored.from_cache = false;
            self.cache.put(cache_key, stored);
        }

        Ok(response)
    }

    /// Answer a question as a delta stream. Retrieval and ranking happen
    /// before this returns; the completion streams afterwards.
    pub async fn stream_query(
        &self,
        question: &str,
        options: &QueryOptions,
    ) -> Result<AnswerStream> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::Validation("question must not be empty".to_string()));
        }

        let optimized = optimizer::optimize_query(question, &options.history);
        let chunks = self
            .store
            .similarity_search(
                &optimized.text,
                self.retrieval.top_k,
                self.retrieval.similarity_threshold,
                options.document_id,
            )
            .await?;

        if chunks.is_empty() {
            // Deliver the no-results answer as a single delta so callers
            // handle both shapes through one channel.
            let response = no_results_response(question, options.document_id);
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(Ok(response.answer));
            return Ok(AnswerStream {
                sources: vec![],
                confidence: 0.0,
                query_optimized: optimized.was_optimized,
                original_query: optimized.was_optimized.then(|| question.to_string()),
                deltas: rx,
            });
        }

        let ranked = self
            .ranker
            .rank(chunks, question, options.preferred_type.as_deref());
        let messages = build_messages(question, &ranked, &options.history);
        let deltas = self.llm.complete_stream(&messages).await?;

        Ok(AnswerStream {
            sources: source_refs(&ranked),
            confidence: mean_confidence(&ranked),
            query_optimized: optimized.was_optimized,
            original_query: optimized.was_optimized.then(|| question.to_string()),
            deltas,
        })
    }
}

fn build_messages(
    question: &str,
    ranked: &[RetrievedChunk],
    history: &[HistoryTurn],
) -> Vec<LlmMessage> {
    let context = ranked
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "Document {} (Similarity: {:.2}):\n{}",
                i + 1,
                c.similarity,
                c.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(LlmMessage::system(SYSTEM_PROMPT));
    for turn in history {
        messages.push(LlmMessage {
            role: turn.role,
            content: turn.content.clone(),
        });
    }
    messages.push(LlmMessage::user(format!(
        "Document excerpts:\n\n{context}\n\nQuestion: {question}"
    )));
    messages
}

fn source_refs(ranked: &[RetrievedChunk]) -> Vec<SourceRef> {
    ranked
        .iter()
        .map(|c| SourceRef {
            chunk_id: c.chunk_id,
            document_id: c.document_id,
            chunk_index: c.chunk_index,
            similarity: c.similarity,
            enhanced_score: c.effective_score(),
            content: c.content.chars().take(EXCERPT_CHARS).collect(),
        })
        .collect()
}

fn mean_confidence(ranked: &[RetrievedChunk]) -> f64 {
    if ranked.is_empty() {
        return 0.0;
    }
    let sum: f64 = ranked.iter().map(|c| c.effective_score()).sum();
    (sum / ranked.len() as f64).min(1.0)
}

/// Canned starter questions a user can fall back on, document-scoped
/// variants first when a document is in scope.
pub fn query_suggestions(document_id: Option<i64>, limit: usize) -> Vec<String> {
    let mut suggestions = Vec::new();
    if let Some(id) = document_id {
        suggestions.extend([
            format!("What are the key insights from document {id}?"),
            format!("Can you explain the main concepts in document {id}?"),
            format!("What are the important details in document {id}?"),
            format!("How does document {id} relate to other documents?"),
            format!("What questions does document {id} answer?"),
        ]);
    }
    suggestions.extend([
        "What is the main topic of the documents?".to_string(),
        "Can you summarize the key points?".to_string(),
        "What are the most important findings?".to_string(),
        "Are there any recommendations mentioned?".to_string(),
        "What conclusions can be drawn from the content?".to_string(),
    ]);
    suggestions.truncate(limit);
    suggestions
}

/// Build the structured answer for an empty retrieval, with rephrasing
/// suggestions, canned alternative queries, and complexity tips.
fn no_results_response(question: &str, document_id: Option<i64>) -> QueryResponse {
    let mut suggestions = Vec::new();
    if document_id.is_some() {
        suggestions.push("Remove the document filter to search everything ingested".to_string());
    }
    suggestions.push("Rephrase the question using terms that appear in the documents".to_string());
    suggestions.push("Check that the relevant document finished processing".to_string());

    QueryResponse {
        answer: "I couldn't find relevant information in the indexed documents to \
                 answer your question. Try rephrasing it or checking that the \
                 right documents have been ingested."
            .to_string(),
        sources: vec![],
        confidence: 0.0,
        processing_time: 0.0,
        retrieved_documents: 0,
        query_optimized: false,
        original_query: None,
        from_cache: false,
        performance_warning: None,
        suggestions,
        alternative_queries: query_suggestions(document_id, 3),
        tips: analyze_query_complexity(question),
    }
}

/// Rough question-type classification, used to shape rephrasing tips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuestionKind {
    Factual,
    Explanatory,
    Comparative,
    Summary,
    Other,
}

fn classify_question(question: &str) -> QuestionKind {
    let lower = question.to_lowercase();
    if lower.contains("compare") || lower.contains(" versus ") || lower.contains(" vs ") {
        QuestionKind::Comparative
    } else if lower.contains("summarize") || lower.contains("summary") || lower.contains("overview")
    {
        QuestionKind::Summary
    } else if lower.starts_with("why") || lower.starts_with("how") || lower.contains("explain") {
        QuestionKind::Explanatory
    } else if lower.starts_with("what")
        || lower.starts_with("when")
        || lower.starts_with("where")
        || lower.starts_with("who")
    {
        QuestionKind::Factual
    } else {
        QuestionKind::Other
    }
}

fn analyze_query_complexity(question: &str) -> Vec<String> {
    let words = question.split_whitespace().count();
    let mut tips = Vec::new();

    if words < 3 {
        tips.push("The question is very short; add more specific detail".to_string());
    }
    if words > 25 {
        tips.push("The question is long; consider splitting it into smaller ones".to_string());
    }
    if question.matches('?').count() > 1 {
        tips.push("Ask one question at a time for better retrieval".to_string());
    }

    match classify_question(question) {
        QuestionKind::Comparative => tips.push(
            "Comparisons work best when both subjects appear in the documents; try asking about each separately".to_string(),
        ),
        QuestionKind::Summary => tips.push(
            "For summaries, name the specific document or section to summarize".to_string(),
        ),
        QuestionKind::Explanatory => tips.push(
            "Explanatory questions retrieve better with the key subject named explicitly".to_string(),
        ),
        QuestionKind::Factual | QuestionKind::Other => {}
    }
    tips
}
