//! Query optimizer.
//!
//! Very short follow-up questions ("why?", "and then?") carry almost no
//! retrieval signal on their own. When the question is at most two words and
//! conversation history exists, the optimizer appends recent user turns as
//! context so the embedding has something to bite on. Longer questions pass
//! through untouched.

use tracing::debug;

use crate::models::{HistoryTurn, MessageRole};

/// Number of trailing user turns appended as context.
const CONTEXT_TURNS: usize = 3;

/// Cap on appended context, in characters.
const CONTEXT_CHAR_LIMIT: usize = 100;

/// Word-count threshold under which a question is considered too short to
/// retrieve on alone.
const SHORT_QUESTION_WORDS: usize = 2;

/// The optimizer's verdict on one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedQuery {
    pub text: String,
    pub was_optimized: bool,
}

/// Expand a short follow-up question with recent user turns.
///
/// Returns the original text (with `was_optimized = false`) unless the
/// question has at most two words and the history holds at least one user
/// turn.
pub fn optimize_query(question: &str, history: &[HistoryTurn]) -> OptimizedQuery {
    let trimmed = question.trim();
    let word_count = trimmed.split_whitespace().count();

    if word_count == 0 || word_count > SHORT_QUESTION_WORDS || history.is_empty() {
        return OptimizedQuery {
            text: trimmed.to_string(),
            was_optimized: false,
        };
    }

    let recent_user_turns: Vec<&str> = history
        .iter()
        .filter(|t| t.role == MessageRole::User)
        .map(|t| t.content.as_str())
        .rev()
        .take(CONTEXT_TURNS)
        .collect();

    if recent_user_turns.is_empty() {
        return OptimizedQuery {
            text: trimmed.to_string(),
            was_optimized: false,
        };
    }

    // Oldest-first, then clamp to the character budget.
    let mut context = recent_user_turns
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" ");
    if context.chars().count() > CONTEXT_CHAR_LIMIT {
        context = context.chars().take(CONTEXT_CHAR_LIMIT).collect();
    }

    let text = format!("{trimmed} {context}");
    debug!(original = trimmed, optimized = %text, "expanded short question");
    OptimizedQuery {
        text,
        was_optimized: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: MessageRole, content: &str) -> HistoryTurn {
        HistoryTurn {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn test_long_question_unchanged() {
        let history = vec![turn(MessageRole::User, "tell me about the budget")];
        let out = optimize_query("what does the third section say?", &history);
        assert!(!out.was_optimized);
        assert_eq!(out.text, "what does the third section say?");
    }

    #[test]
    fn test_short_question_without_history_unchanged() {
        let out = optimize_query("why?", &[]);
        assert!(!out.was_optimized);
        assert_eq!(out.text, "why?");
    }

    #[test]
    fn test_short_question_gains_context() {
        let history = vec![
            turn(MessageRole::User, "summarize the quarterly report"),
            turn(MessageRole::Assistant, "revenue grew twelve percent"),
        ];
        let out = optimize_query("why?", &history);
        assert!(out.was_optimized);
        assert_eq!(out.text, "why? summarize the quarterly report");
    }

    #[test]
    fn test_only_user_turns_counted() {
        let history = vec![
            turn(MessageRole::Assistant, "here is an answer"),
            turn(MessageRole::System, "instructions"),
        ];
        let out = optimize_query("more?", &history);
        assert!(!out.was_optimized);
    }

    #[test]
    fn test_takes_last_three_user_turns_in_order() {
        let history = vec![
            turn(MessageRole::User, "first"),
            turn(MessageRole::User, "second"),
            turn(MessageRole::User, "third"),
            turn(MessageRole::User, "fourth"),
        ];
        let out = optimize_query("and?", &history);
        assert!(out.was_optimized);
        assert_eq!(out.text, "and? second third fourth");
    }

    #[test]
    fn test_context_clamped_to_char_limit() {
        let history = vec![turn(MessageRole::User, &"x".repeat(400))];
        let out = optimize_query("why?", &history);
        assert!(out.was_optimized);
        // 100 chars of context + space + question.
        assert_eq!(out.text.chars().count(), 100 + 1 + 4);
    }

    #[test]
    fn test_two_words_is_still_short() {
        let history = vec![turn(MessageRole::User, "explain the appendix")];
        let out = optimize_query("which one", &history);
        assert!(out.was_optimized);
    }
}
