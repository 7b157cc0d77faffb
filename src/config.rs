use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application configuration, loaded from TOML.
///
/// Constructors of the embedding gateway, LLM client, vector index, and
/// chunk store each borrow their sub-struct; reloading means building a new
/// `Config` and swapping the shared reference, never mutating in place.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk window size, in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters repeated from the tail of one chunk at the head of the next.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` (remote API) or `"hash"` (deterministic local vectors,
    /// for offline use and tests).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dims")]
    pub dims: usize,
    /// Provider-side limit on texts per call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between sub-batches, to respect rate limits.
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_embedding_dims(),
            batch_size: default_batch_size(),
            pacing_delay_ms: default_pacing_delay_ms(),
            timeout_secs: default_timeout_secs(),
            api_base: default_openai_base(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    100
}
fn default_pacing_delay_ms() -> u64 {
    100
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            api_base: default_openai_base(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_temperature() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// `"memory"` (in-process, brute-force) or `"chroma"` (HTTP service).
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default = "default_chroma_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            url: default_chroma_url(),
            collection: default_collection(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_vector_provider() -> String {
    "memory".to_string()
}
fn default_chroma_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_collection() -> String {
    "docqa_chunks".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_similarity_threshold() -> f64 {
    0.7
}

/// Heuristic boost multipliers for result re-ranking. All must be >= 1.0 so
/// that an enhanced score never falls below the raw similarity.
#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    #[serde(default = "default_recency_boost")]
    pub recency_boost: f64,
    #[serde(default = "default_type_boost")]
    pub type_boost: f64,
    #[serde(default = "default_title_boost")]
    pub title_boost: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            recency_boost: default_recency_boost(),
            type_boost: default_type_boost(),
            title_boost: default_title_boost(),
        }
    }
}

fn default_recency_boost() -> f64 {
    1.1
}
fn default_type_boost() -> f64 {
    1.2
}
fn default_title_boost() -> f64 {
    1.15
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_minutes: default_ttl_minutes(),
        }
    }
}

fn default_max_entries() -> usize {
    100
}
fn default_ttl_minutes() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_node_id")]
    pub datacenter_id: i64,
    #[serde(default = "default_node_id")]
    pub worker_id: i64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            datacenter_id: default_node_id(),
            worker_id: default_node_id(),
        }
    }
}

fn default_node_id() -> i64 {
    1
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    for (name, boost) in [
        ("recency_boost", config.ranking.recency_boost),
        ("type_boost", config.ranking.type_boost),
        ("title_boost", config.ranking.title_boost),
    ] {
        if boost < 1.0 {
            anyhow::bail!("ranking.{name} must be >= 1.0");
        }
    }
    if config.cache.max_entries == 0 {
        anyhow::bail!("cache.max_entries must be >= 1");
    }
    match config.embedding.provider.as_str() {
        "openai" | "hash" => {}
        other => anyhow::bail!("Unknown embedding provider: '{other}'. Must be openai or hash."),
    }
    match config.vector.provider.as_str() {
        "memory" | "chroma" => {}
        other => anyhow::bail!("Unknown vector provider: '{other}'. Must be memory or chroma."),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("docqa.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[db]\npath = \"/tmp/docqa.sqlite\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.embedding.batch_size, 100);
        assert_eq!(config.retrieval.top_k, 10);
        assert!((config.retrieval.similarity_threshold - 0.7).abs() < 1e-9);
        assert!((config.ranking.recency_boost - 1.1).abs() < 1e-9);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.cache.ttl_minutes, 30);
        assert_eq!(config.vector.provider, "memory");
    }

    #[test]
    fn test_rejects_overlap_at_least_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[db]\npath = \"/tmp/d.sqlite\"\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_rejects_boost_below_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[db]\npath = \"/tmp/d.sqlite\"\n[ranking]\nrecency_boost = 0.9\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_rejects_unknown_vector_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[db]\npath = \"/tmp/d.sqlite\"\n[vector]\nprovider = \"faiss\"\n",
        );
        assert!(load_config(&path).is_err());
    }
}
