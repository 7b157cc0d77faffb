//! Chat completion client.
//!
//! [`LlmProvider`] is the seam to the completion backend: one call for a
//! full answer, one for a streamed answer delivered as content deltas over
//! a channel. [`OpenAiChat`] talks to an OpenAI-compatible
//! `/chat/completions` endpoint, parsing the SSE stream incrementally.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{RagError, Result};
use crate::models::MessageRole;

/// One message in a completion request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LlmMessage {
    pub role: MessageRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run a completion and return the full answer text.
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String>;

    /// Run a streaming completion. Content deltas arrive on the returned
    /// channel in order; the channel closes after the final delta or after
    /// one terminal `Err`.
    async fn complete_stream(
        &self,
        messages: &[LlmMessage],
    ) -> Result<mpsc::Receiver<Result<String>>>;
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiChat {
    client: reqwest::Client,
    /// Read lazily so commands that never complete anything work without it.
    api_key: Option<String>,
    api_base: String,
    model: String,
    temperature: f64,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Llm(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn send(&self, messages: &[LlmMessage], stream: bool) -> Result<reqwest::Response> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            RagError::Validation("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": stream,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::Timeout(format!("llm request timed out: {e}"))
                } else {
                    RagError::Llm(format!("llm request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Llm(format!("llm API error {status}: {text}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String> {
        let response = self.send(messages, false).await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::Llm(format!("invalid llm response: {e}")))?;

        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| RagError::Llm("llm response missing content".to_string()))
    }

    async fn complete_stream(
        &self,
        messages: &[LlmMessage],
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let mut response = self.send(messages, true).await?;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut lines = LineAssembler::new();
            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        for line in lines.push(&bytes) {
                            match parse_sse_line(&line) {
                                SseEvent::Delta(text) => {
                                    if tx.send(Ok(text)).await.is_err() {
                                        return;
                                    }
                                }
                                SseEvent::Done => return,
                                SseEvent::Skip => {}
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let err = if e.is_timeout() {
                            RagError::Timeout(format!("llm stream timed out: {e}"))
                        } else {
                            RagError::Llm(format!("llm stream failed: {e}"))
                        };
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        });

        debug!("opened llm completion stream");
        Ok(rx)
    }
}

/// Assembles complete SSE lines from raw network chunks.
///
/// Bytes are buffered until a full newline-terminated line is present and
/// only then decoded, so a multi-byte UTF-8 character split across two
/// chunk reads survives intact.
struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    fn new() -> Self {
        Self { pending: Vec::new() }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&raw[..pos]).trim().to_string());
        }
        lines
    }
}

enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
        return SseEvent::Skip;
    };
    if payload == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
        return SseEvent::Skip;
    };
    match json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        Some(text) if !text.is_empty() => SseEvent::Delta(text.to_string()),
        _ => SseEvent::Skip,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        match parse_sse_line(line) {
            SseEvent::Delta(text) => assert_eq!(text, "Hello"),
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn test_parse_sse_done_and_noise() {
        assert!(matches!(parse_sse_line("data: [DONE]"), SseEvent::Done));
        assert!(matches!(parse_sse_line(""), SseEvent::Skip));
        assert!(matches!(parse_sse_line(": keepalive"), SseEvent::Skip));
        // Role-only delta carries no content.
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(matches!(parse_sse_line(line), SseEvent::Skip));
    }

    #[test]
    fn test_line_assembler_holds_back_partial_lines() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"data: {\"a\":").is_empty());
        let lines = asm.push(b"1}\ndata: trailing");
        assert_eq!(lines, vec![r#"data: {"a":1}"#.to_string()]);
        assert_eq!(asm.push(b"\n"), vec!["data: trailing".to_string()]);
    }

    #[test]
    fn test_multibyte_delta_split_across_chunks() {
        let payload = r#"data: {"choices":[{"delta":{"content":"café"}}]}"#;
        let mut bytes = payload.as_bytes().to_vec();
        bytes.push(b'\n');
        // Cut inside the two-byte encoding of 'é'.
        let cut = payload.find('é').unwrap() + 1;

        let mut asm = LineAssembler::new();
        assert!(asm.push(&bytes[..cut]).is_empty());
        let lines = asm.push(&bytes[cut..]);
        assert_eq!(lines.len(), 1);
        match parse_sse_line(&lines[0]) {
            SseEvent::Delta(text) => assert_eq!(text, "café"),
            _ => panic!("expected delta"),
        }
    }

    #[tokio::test]
    async fn test_stub_streams_in_order() {
        let stub = testing::StubLlm::answering("one two three");
        let mut rx = stub.complete_stream(&[LlmMessage::user("q")]).await.unwrap();
        let mut collected = String::new();
        while let Some(delta) = rx.recv().await {
            collected.push_str(&delta.unwrap());
        }
        assert_eq!(collected, "one two three");
    }

    #[tokio::test]
    async fn test_stub_records_messages() {
        let stub = testing::StubLlm::answering("ok");
        stub.complete(&[LlmMessage::system("sys"), LlmMessage::user("hi")])
            .await
            .unwrap();
        let seen = stub.last_messages.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].role, MessageRole::System);
    }
}
