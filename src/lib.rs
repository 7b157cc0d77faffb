//! # docqa
//!
//! A document question-answering pipeline: documents are split into
//! overlapping chunks, embedded, and stored in both SQLite (source of
//! truth) and a vector index (search surface). Questions are answered by
//! retrieving the most similar chunks, re-ranking them with lightweight
//! heuristics, and synthesizing an answer with a chat completion model,
//! with source attribution and a confidence score.
//!
//! ## Module map
//!
//! - [`config`] — TOML configuration and validation
//! - [`error`] — the [`error::RagError`] taxonomy
//! - [`snowflake`] — time-ordered identifier generation
//! - [`models`] — documents, chunks, sessions, answers
//! - [`splitter`] — overlapping-window text splitting
//! - [`embedding`] — embedding providers and the batching gateway
//! - [`vector`] — vector index trait plus memory and Chroma backends
//! - [`store`] — the dual-write chunk store and similarity search
//! - [`rank`] — heuristic result re-ranking
//! - [`optimizer`] — short-question expansion from history
//! - [`cache`] — TTL query result cache
//! - [`llm`] — chat completion client with streaming
//! - [`rag`] — the end-to-end query pipeline
//! - [`session`] — chat sessions, message history, streamed turns
//! - [`documents`] — document lifecycle and text ingestion
//! - [`db`] / [`migrate`] — SQLite pool and schema

pub mod cache;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod optimizer;
pub mod rag;
pub mod rank;
pub mod session;
pub mod snowflake;
pub mod splitter;
pub mod store;
pub mod vector;
