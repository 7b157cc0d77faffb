//! Overlapping-window text splitter.
//!
//! Splits normalized document text into windows of at most `chunk_size`
//! characters, preferring to break at the highest-priority separator
//! (paragraph break, line break, space) that falls inside the window, and
//! repeating `chunk_overlap` tail characters at the head of the next window.
//! Every chunk carries its start/end character offsets into the original
//! text and an approximate token count.

use crate::config::ChunkingConfig;
use crate::error::{RagError, Result};
use crate::models::ChunkDraft;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Break-point separators, highest priority first. The empty string means
/// a hard cut at the window boundary.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Split `text` into overlapping chunks with offset provenance.
///
/// Offsets are character positions (not bytes) into the original text.
/// Returns a [`RagError::Validation`] error for empty or whitespace-only
/// input; chunk indices in the output are contiguous from 0.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Result<Vec<ChunkDraft>> {
    if text.trim().is_empty() {
        return Err(RagError::Validation(
            "no text content to chunk".to_string(),
        ));
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let chunk_size = config.chunk_size.max(1);
    let overlap = config.chunk_overlap.min(chunk_size - 1);

    let mut drafts = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    while start < total {
        let hard_end = (start + chunk_size).min(total);
        let end = if hard_end == total {
            total
        } else {
            find_break(&chars, start, hard_end)
        };

        // Trim the window to its non-whitespace extent so offsets point at
        // the stored content.
        let (content_start, content_end) = trimmed_extent(&chars, start, end);
        if content_start < content_end {
            let content: String = chars[content_start..content_end].iter().collect();
            let token_count = ((content_end - content_start) / CHARS_PER_TOKEN) as i64;
            drafts.push(ChunkDraft {
                index,
                content,
                start_char: content_start as i64,
                end_char: content_end as i64,
                token_count,
            });
            index += 1;
        }

        if end == total {
            break;
        }

        // Carry the overlap into the next window, but always make progress.
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    Ok(drafts)
}

/// Pick the break position in `(start, limit]`, preferring the
/// highest-priority separator whose occurrence is closest to `limit`.
/// The separator stays with the preceding chunk.
fn find_break(chars: &[char], start: usize, limit: usize) -> usize {
    for sep in SEPARATORS {
        let sep_chars: Vec<char> = sep.chars().collect();
        let sep_len = sep_chars.len();
        if limit - start < sep_len {
            continue;
        }
        // Scan backwards from the window boundary for the separator.
        let mut pos = limit - sep_len;
        loop {
            if chars[pos..pos + sep_len] == sep_chars[..] {
                let break_at = pos + sep_len;
                if break_at > start {
                    return break_at;
                }
            }
            if pos == start {
                break;
            }
            pos -= 1;
        }
    }
    limit
}

fn trimmed_extent(chars: &[char], start: usize, end: usize) -> (usize, usize) {
    let mut s = start;
    let mut e = end;
    while s < e && chars[s].is_whitespace() {
        s += 1;
    }
    while e > s && chars[e - 1].is_whitespace() {
        e -= 1;
    }
    (s, e)
}
