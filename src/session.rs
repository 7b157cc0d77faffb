//! Chat session management.
//!
//! Sessions are soft-deleted (`is_active = 0`) so message history survives
//! for audit. Messages are append-only; the pipeline sees the last ten as
//! conversation history. `stream_message` delivers the assistant's answer
//! as a typed event stream and commits whatever content accumulated if the
//! consumer goes away mid-answer.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{RagError, Result};
use crate::models::{ChatMessage, ChatSession, HistoryTurn, MessageRole, QueryResponse, SourceRef};
use crate::rag::{QueryOptions, RagPipeline};
use crate::snowflake::IdGenerator;

/// How many trailing messages feed the pipeline as history.
const HISTORY_WINDOW: usize = 10;

/// Events emitted by [`ChatSessionManager::stream_message`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The assistant message row was allocated; deltas follow.
    MessageCreated { message_id: i64 },
    ContentDelta { delta: String },
    MessageCompleted {
        message_id: i64,
        sources: Vec<SourceRef>,
        confidence: f64,
    },
    Error { message: String },
}

/// Result of a non-streaming [`ChatSessionManager::send_message`].
#[derive(Debug)]
pub struct SendOutcome {
    pub user_message_id: i64,
    pub assistant_message_id: i64,
    pub response: QueryResponse,
}

pub struct ChatSessionManager {
    pool: SqlitePool,
    pipeline: Arc<RagPipeline>,
    ids: Arc<IdGenerator>,
}

impl ChatSessionManager {
    pub fn new(pool: SqlitePool, pipeline: Arc<RagPipeline>, ids: Arc<IdGenerator>) -> Self {
        Self {
            pool,
            pipeline,
            ids,
        }
    }

    pub async fn create_session(&self, title: &str) -> Result<ChatSession> {
        let id = self.ids.next_id()?;
        let now = chrono::Utc::now().timestamp_millis();
        let title = if title.trim().is_empty() {
            "New conversation".to_string()
        } else {
            title.trim().to_string()
        };

        sqlx::query(
            "INSERT INTO chat_sessions (id, title, is_active, created_at) VALUES (?, ?, 1, ?)",
        )
        .bind(id)
        .bind(&title)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(session_id = id, "created chat session");
        Ok(ChatSession {
            id,
            title,
            is_active: true,
            created_at: now,
            updated_at: None,
        })
    }

    /// Fetch an active session. Soft-deleted sessions read as not found.
    pub async fn get_session(&self, session_id: i64) -> Result<ChatSession> {
        sqlx::query(
            "SELECT id, title, is_active, created_at, updated_at \
             FROM chat_sessions WHERE id = ? AND is_active = 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| ChatSession {
            id: row.get("id"),
            title: row.get("title"),
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
        .ok_or(RagError::SessionNotFound(session_id))
    }

    /// Active sessions, most recently touched first.
    pub async fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT id, title, is_active, created_at, updated_at \
             FROM chat_sessions WHERE is_active = 1 \
             ORDER BY COALESCE(updated_at, created_at) DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChatSession {
                id: row.get("id"),
                title: row.get("title"),
                is_active: row.get("is_active"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// The last `limit` messages of a session in chronological order.
    pub async fn session_messages(&self, session_id: i64, limit: usize) -> Result<Vec<ChatMessage>> {
        self.get_session(session_id).await?;

        let rows = sqlx::query(
            "SELECT id, session_id, role, content, sources, created_at \
             FROM chat_messages WHERE session_id = ? \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let role: String = row.get("role");
            let sources: Option<String> = row.get("sources");
            messages.push(ChatMessage {
                id: row.get("id"),
                session_id: row.get("session_id"),
                role: MessageRole::from_str(&role)?,
                content: row.get("content"),
                sources: match sources {
                    Some(json) => serde_json::from_str(&json).unwrap_or(None),
                    None => None,
                },
                created_at: row.get("created_at"),
            });
        }
        Ok(messages)
    }

    /// Append one message and touch the session's `updated_at`.
    pub async fn add_message(
        &self,
        session_id: i64,
        role: MessageRole,
        content: &str,
        sources: Option<&[SourceRef]>,
    ) -> Result<ChatMessage> {
        self.get_session(session_id).await?;
        let id = self.ids.next_id()?;
        insert_message(&self.pool, id, session_id, role, content, sources).await
    }

    /// Run one conversational turn: persist the user message, answer with
    /// the last ten messages as history, persist the assistant reply.
    ///
    /// Caching is off unless the caller opts in; conversational answers are
    /// usually context-dependent.
    pub async fn send_message(
        &self,
        session_id: i64,
        content: &str,
        document_id: Option<i64>,
        use_cache: bool,
    ) -> Result<SendOutcome> {
        self.get_session(session_id).await?;
        let history = self.history_window(session_id).await?;

        let user_id = self.ids.next_id()?;
        insert_message(&self.pool, user_id, session_id, MessageRole::User, content, None).await?;

        let options = QueryOptions {
            document_id,
            history,
            use_cache,
            preferred_type: None,
        };
        let response = self.pipeline.query(content, &options).await?;

        let assistant_id = self.ids.next_id()?;
        insert_message(
            &self.pool,
            assistant_id,
            session_id,
            MessageRole::Assistant,
            &response.answer,
            Some(&response.sources),
        )
        .await?;

        Ok(SendOutcome {
            user_message_id: user_id,
            assistant_message_id: assistant_id,
            response,
        })
    }

    /// Run one conversational turn as an event stream.
    ///
    /// The user message is persisted before this returns. If the consumer
    /// drops the receiver mid-answer, whatever content accumulated is
    /// committed as the assistant message rather than discarded.
    pub async fn stream_message(
        &self,
        session_id: i64,
        content: &str,
        document_id: Option<i64>,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        self.get_session(session_id).await?;
        let history = self.history_window(session_id).await?;

        let user_id = self.ids.next_id()?;
        insert_message(&self.pool, user_id, session_id, MessageRole::User, content, None).await?;
        let assistant_id = self.ids.next_id()?;

        let (tx, rx) = mpsc::channel(32);
        let pipeline = self.pipeline.clone();
        let pool = self.pool.clone();
        let question = content.to_string();

        tokio::spawn(async move {
            let _ = tx
                .send(StreamEvent::MessageCreated {
                    message_id: assistant_id,
                })
                .await;

            let options = QueryOptions {
                document_id,
                history,
                use_cache: false,
                preferred_type: None,
            };
            let mut stream = match pipeline.stream_query(&question, &options).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let mut accumulated = String::new();
            while let Some(delta) = stream.deltas.recv().await {
                match delta {
                    Ok(text) => {
                        accumulated.push_str(&text);
                        if tx
                            .send(StreamEvent::ContentDelta { delta: text })
                            .await
                            .is_err()
                        {
                            // Consumer went away; keep what we have.
                            commit_partial(&pool, assistant_id, session_id, &accumulated).await;
                            return;
                        }
                    }
                    Err(e) => {
                        commit_partial(&pool, assistant_id, session_id, &accumulated).await;
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }

            if let Err(e) = insert_message(
                &pool,
                assistant_id,
                session_id,
                MessageRole::Assistant,
                &accumulated,
                Some(&stream.sources),
            )
            .await
            {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }

            let _ = tx
                .send(StreamEvent::MessageCompleted {
                    message_id: assistant_id,
                    sources: stream.sources,
                    confidence: stream.confidence,
                })
                .await;
        });

        Ok(rx)
    }

    /// Soft-delete: the session disappears from reads but its rows remain.
    pub async fn delete_session(&self, session_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET is_active = 0, updated_at = ? \
             WHERE id = ? AND is_active = 1",
        )
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::SessionNotFound(session_id));
        }
        info!(session_id, "soft-deleted chat session");
        Ok(())
    }

    pub async fn update_session_title(&self, session_id: i64, title: &str) -> Result<()> {
        if title.trim().is_empty() {
            return Err(RagError::Validation("title must not be empty".to_string()));
        }
        let result = sqlx::query(
            "UPDATE chat_sessions SET title = ?, updated_at = ? \
             WHERE id = ? AND is_active = 1",
        )
        .bind(title.trim())
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::SessionNotFound(session_id));
        }
        Ok(())
    }

    async fn history_window(&self, session_id: i64) -> Result<Vec<HistoryTurn>> {
        let messages = self.session_messages(session_id, HISTORY_WINDOW).await?;
        Ok(messages
            .into_iter()
            .map(|m| HistoryTurn {
                role: m.role,
                content: m.content,
            })
            .collect())
    }
}

async fn insert_message(
    pool: &SqlitePool,
    id: i64,
    session_id: i64,
    role: MessageRole,
    content: &str,
    sources: Option<&[SourceRef]>,
) -> Result<ChatMessage> {
    let now = chrono::Utc::now().timestamp_millis();
    let sources_json = match sources {
        Some(s) if !s.is_empty() => Some(serde_json::to_string(s).map_err(|e| {
            RagError::Validation(format!("failed to serialize sources: {e}"))
        })?),
        _ => None,
    };

    sqlx::query(
        "INSERT INTO chat_messages (id, session_id, role, content, sources, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(session_id)
    .bind(role.as_str())
    .bind(content)
    .bind(&sources_json)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(session_id)
        .execute(pool)
        .await?;

    Ok(ChatMessage {
        id,
        session_id,
        role,
        content: content.to_string(),
        sources: sources.map(|s| s.to_vec()),
        created_at: now,
    })
}

/// Best-effort commit of a cut-short assistant answer.
async fn commit_partial(pool: &SqlitePool, id: i64, session_id: i64, accumulated: &str) {
    if accumulated.is_empty() {
        return;
    }
    if let Err(e) = insert_message(
        pool,
        id,
        session_id,
        MessageRole::Assistant,
        accumulated,
        None,
    )
    .await
    {
        warn!(session_id, error = %e, "failed to commit partial assistant message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, EmbeddingConfig, RankingConfig, RetrievalConfig};
    use crate::embedding::{create_provider, EmbeddingGateway};
    use crate::llm::testing::StubLlm;
    use crate::llm::LlmProvider;
    use crate::migrate;
    use crate::models::{ChunkDraft, Document, DocumentStatus, SourceType};
    use crate::store::ChunkStore;
    use crate::vector::MemoryIndex;

    async fn manager_with(texts: &[&str], llm: Arc<dyn LlmProvider>) -> ChatSessionManager {
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

        if !texts.is_empty() {
            let document = Document {
                id: 1,
                name: "notes".to_string(),
                source_type: SourceType::Txt,
                status: DocumentStatus::Completed,
                metadata: serde_json::json!({}),
                created_at: chrono::Utc::now().timestamp_millis(),
                updated_at: None,
            };
            sqlx::query(
                "INSERT INTO documents (id, name, source_type, status, metadata, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(document.id)
            .bind(&document.name)
            .bind(document.source_type.as_str())
            .bind(document.status.as_str())
            .bind(document.metadata.to_string())
            .bind(document.created_at)
            .execute(&pool)
            .await
            .unwrap();

            let drafts: Vec<ChunkDraft> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| ChunkDraft {
                    index: i as i64,
                    content: t.to_string(),
                    start_char: 0,
                    end_char: t.len() as i64,
                    token_count: (t.len() / 4) as i64,
                })
                .collect();
            store.store_chunks(&document, &drafts).await.unwrap();
        }

        let pipeline = Arc::new(RagPipeline::new(
            store,
            llm,
            RetrievalConfig::default(),
            RankingConfig::default(),
            &CacheConfig::default(),
        ));
        ChatSessionManager::new(pool, pipeline, ids)
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let m = manager_with(&[], Arc::new(StubLlm::answering("ok"))).await;
        let session = m.create_session("budget questions").await.unwrap();
        assert!(session.is_active);

        let fetched = m.get_session(session.id).await.unwrap();
        assert_eq!(fetched.title, "budget questions");

        m.delete_session(session.id).await.unwrap();
        let err = m.get_session(session.id).await.unwrap_err();
        assert_eq!(err.kind(), "session_not_found");

        // Soft delete: the row is still there.
        let row = sqlx::query("SELECT is_active FROM chat_sessions WHERE id = ?")
            .bind(session.id)
            .fetch_one(&m.pool)
            .await
            .unwrap();
        assert!(!row.get::<bool, _>("is_active"));

        // Deleting again is an error.
        assert!(m.delete_session(session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_blank_title_gets_default() {
        let m = manager_with(&[], Arc::new(StubLlm::answering("ok"))).await;
        let session = m.create_session("   ").await.unwrap();
        assert_eq!(session.title, "New conversation");

        m.update_session_title(session.id, "renamed").await.unwrap();
        assert_eq!(m.get_session(session.id).await.unwrap().title, "renamed");
        assert!(m.update_session_title(session.id, "  ").await.is_err());
    }

    #[tokio::test]
    async fn test_history_window_is_last_ten_chronological() {
        let m = manager_with(&[], Arc::new(StubLlm::answering("ok"))).await;
        let session = m.create_session("long chat").await.unwrap();

        for i in 0..15 {
            m.add_message(session.id, MessageRole::User, &format!("message {i}"), None)
                .await
                .unwrap();
        }

        let window = m.session_messages(session.id, 10).await.unwrap();
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].content, "message 5");
        assert_eq!(window[9].content, "message 14");
        for pair in window.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[tokio::test]
    async fn test_send_message_persists_both_turns() {
        let m = manager_with(
            &["the printer is on the third floor"],
            Arc::new(StubLlm::answering("Third floor.")),
        )
        .await;
        let session = m.create_session("office").await.unwrap();

        let outcome = m
            .send_message(session.id, "the printer is on the third floor", None, false)
            .await
            .unwrap();
        assert_eq!(outcome.response.answer, "Third floor.");
        assert!(outcome.user_message_id < outcome.assistant_message_id);

        let messages = m.session_messages(session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert!(messages[1].sources.is_some());
    }

    #[tokio::test]
    async fn test_send_message_unknown_session() {
        let m = manager_with(&[], Arc::new(StubLlm::answering("ok"))).await;
        let err = m.send_message(42, "hello", None, false).await.unwrap_err();
        assert_eq!(err.kind(), "session_not_found");
    }

    #[tokio::test]
    async fn test_stream_message_event_order() {
        let m = manager_with(
            &["the cafeteria opens at eight"],
            Arc::new(StubLlm::answering("At eight in the morning.")),
        )
        .await;
        let session = m.create_session("food").await.unwrap();

        let mut rx = m
            .stream_message(session.id, "the cafeteria opens at eight", None)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let created_id = match first {
            StreamEvent::MessageCreated { message_id } => message_id,
            other => panic!("expected message_created, got {other:?}"),
        };

        let mut answer = String::new();
        let mut completed = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::ContentDelta { delta } => answer.push_str(&delta),
                StreamEvent::MessageCompleted {
                    message_id,
                    sources,
                    confidence,
                } => {
                    assert_eq!(message_id, created_id);
                    assert!(!sources.is_empty());
                    assert!(confidence > 0.9);
                    completed = Some(message_id);
                }
                StreamEvent::Error { message } => panic!("unexpected error: {message}"),
                StreamEvent::MessageCreated { .. } => panic!("duplicate message_created"),
            }
        }
        assert_eq!(answer, "At eight in the morning.");
        assert!(completed.is_some());

        let messages = m.session_messages(session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "At eight in the morning.");
    }

    #[tokio::test]
    async fn test_stream_receiver_drop_commits_partial() {
        let long_answer = "word ".repeat(200);
        let m = manager_with(
            &["some indexed content to retrieve"],
            Arc::new(StubLlm::answering(&long_answer)),
        )
        .await;
        let session = m.create_session("partial").await.unwrap();

        let mut rx = m
            .stream_message(session.id, "some indexed content to retrieve", None)
            .await
            .unwrap();
        // Take the created event plus one delta, then walk away.
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        drop(rx);

        // Give the producer task time to notice and commit.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let messages = m.session_messages(session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert!(!messages[1].content.is_empty());
        assert!(messages[1].content.len() < long_answer.len());
    }

    #[tokio::test]
    async fn test_stream_event_serialization() {
        let event = StreamEvent::ContentDelta {
            delta: "hello".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_delta");
        assert_eq!(json["delta"], "hello");
    }
}
