//! Heuristic result re-ranking.
//!
//! Multiplies each retrieved chunk's raw similarity by configurable boost
//! factors (recency, document type, title term overlap) and re-sorts by the
//! enhanced score. Ranking never discards a result and, with boosts >= 1.0,
//! never scores a chunk below its raw similarity.

use tracing::debug;

use crate::config::RankingConfig;
use crate::models::RetrievedChunk;

pub struct Ranker {
    config: RankingConfig,
}

impl Ranker {
    pub fn new(config: RankingConfig) -> Self {
        Self { config }
    }

    /// Score and re-sort chunks in place, highest enhanced score first.
    ///
    /// `preferred_type` boosts chunks whose document type matches; pass
    /// `None` to skip the type heuristic.
    pub fn rank(
        &self,
        mut chunks: Vec<RetrievedChunk>,
        question: &str,
        preferred_type: Option<&str>,
    ) -> Vec<RetrievedChunk> {
        let question_terms: Vec<String> = question
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        for chunk in &mut chunks {
            let mut score = chunk.similarity;

            if chunk.metadata.get("created_at").and_then(|v| v.as_i64()).is_some() {
                score *= self.config.recency_boost;
            }

            if let Some(wanted) = preferred_type {
                let doc_type = chunk
                    .metadata
                    .get("document_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if doc_type.eq_ignore_ascii_case(wanted) {
                    score *= self.config.type_boost;
                }
            }

            if let Some(title) = chunk.metadata.get("title").and_then(|v| v.as_str()) {
                let title_lower = title.to_lowercase();
                if question_terms.iter().any(|t| title_lower.contains(t)) {
                    score *= self.config.title_boost;
                }
            }

            chunk.enhanced_score = Some(score);
        }

        chunks.sort_by(|a, b| {
            b.effective_score()
                .partial_cmp(&a.effective_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(count = chunks.len(), "ranked retrieval results");
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: i64, similarity: f64, metadata: serde_json::Value) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id,
            document_id: 1,
            chunk_index: 0,
            content: format!("chunk {id}"),
            similarity,
            metadata,
            enhanced_score: None,
        }
    }

    fn ranker() -> Ranker {
        Ranker::new(RankingConfig::default())
    }

    #[test]
    fn test_no_signals_keeps_raw_score() {
        let ranked = ranker().rank(
            vec![chunk(1, 0.8, serde_json::json!({}))],
            "any question",
            None,
        );
        assert_eq!(ranked[0].enhanced_score, Some(0.8));
    }

    #[test]
    fn test_recency_boost_applied() {
        let ranked = ranker().rank(
            vec![chunk(1, 0.8, serde_json::json!({ "created_at": 1700000000000i64 }))],
            "question",
            None,
        );
        assert!((ranked[0].enhanced_score.unwrap() - 0.8 * 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_type_boost_requires_match() {
        let meta = serde_json::json!({ "document_type": "pdf" });
        let ranked = ranker().rank(vec![chunk(1, 0.5, meta.clone())], "q", Some("pdf"));
        assert!((ranked[0].enhanced_score.unwrap() - 0.5 * 1.2).abs() < 1e-9);

        let ranked = ranker().rank(vec![chunk(1, 0.5, meta)], "q", Some("docx"));
        assert_eq!(ranked[0].enhanced_score, Some(0.5));
    }

    #[test]
    fn test_title_boost_case_insensitive() {
        let meta = serde_json::json!({ "title": "Quarterly Budget Report" });
        let ranked = ranker().rank(vec![chunk(1, 0.6, meta)], "tell me about the BUDGET", None);
        assert!((ranked[0].enhanced_score.unwrap() - 0.6 * 1.15).abs() < 1e-9);
    }

    #[test]
    fn test_boosts_are_multiplicative() {
        let meta = serde_json::json!({
            "created_at": 1700000000000i64,
            "document_type": "pdf",
            "title": "budget notes",
        });
        let ranked = ranker().rank(vec![chunk(1, 0.5, meta)], "budget", Some("pdf"));
        let expected = 0.5 * 1.1 * 1.2 * 1.15;
        assert!((ranked[0].enhanced_score.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_resorts_but_never_discards() {
        let boosted = chunk(
            1,
            0.70,
            serde_json::json!({ "created_at": 1700000000000i64, "title": "budget" }),
        );
        let plain = chunk(2, 0.75, serde_json::json!({}));
        let ranked = ranker().rank(vec![plain, boosted], "budget", None);

        assert_eq!(ranked.len(), 2);
        // 0.70 * 1.1 * 1.15 = 0.8855 beats 0.75.
        assert_eq!(ranked[0].chunk_id, 1);
        assert!(ranked[0].effective_score() >= ranked[1].effective_score());
    }

    #[test]
    fn test_enhanced_never_below_raw() {
        let chunks = vec![
            chunk(1, 0.9, serde_json::json!({})),
            chunk(2, 0.8, serde_json::json!({ "created_at": 1i64 })),
            chunk(3, 0.7, serde_json::json!({ "title": "unrelated words" })),
        ];
        for c in ranker().rank(chunks, "question terms", None) {
            assert!(c.effective_score() >= c.similarity);
        }
    }
}
