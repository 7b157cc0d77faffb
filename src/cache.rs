//! In-memory query result cache.
//!
//! Keys are a hash of the question, the optional document scope, and the
//! similarity threshold, so the same question asked against a different
//! scope never collides. Entries expire after a TTL (checked lazily on
//! lookup) and the oldest entry is evicted when the cache is full.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CacheConfig;
use crate::models::QueryResponse;

struct CacheEntry {
    response: QueryResponse,
    inserted_at: Instant,
}

pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_entries: usize,
    pub ttl_minutes: u64,
    /// At most the first ten keys, for inspection.
    pub sample_keys: Vec<String>,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: config.max_entries.max(1),
            ttl: Duration::from_secs(config.ttl_minutes * 60),
        }
    }

    /// Derive the cache key for one query shape.
    pub fn key(question: &str, document_id: Option<i64>, threshold: f64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(question.trim().to_lowercase().as_bytes());
        hasher.update(b"\x00");
        match document_id {
            Some(id) => hasher.update(id.to_le_bytes()),
            None => hasher.update(b"all"),
        }
        hasher.update(b"\x00");
        hasher.update(threshold.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a cached response, lazily dropping it if expired.
    pub fn get(&self, key: &str) -> Option<QueryResponse> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                debug!(key, "query cache hit");
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a response, evicting the oldest entry when at capacity.
    pub fn put(&self, key: String, response: QueryResponse) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("cache mutex poisoned");
        CacheStats {
            size: entries.len(),
            max_entries: self.max_entries,
            ttl_minutes: self.ttl.as_secs() / 60,
            sample_keys: entries.keys().take(10).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(answer: &str) -> QueryResponse {
        QueryResponse {
            answer: answer.to_string(),
            sources: vec![],
            confidence: 0.9,
            processing_time: 0.1,
            retrieved_documents: 1,
            query_optimized: false,
            original_query: None,
            from_cache: false,
            performance_warning: None,
            suggestions: vec![],
            alternative_queries: vec![],
            tips: vec![],
        }
    }

    fn cache(max_entries: usize, ttl_minutes: u64) -> QueryCache {
        QueryCache::new(&CacheConfig {
            max_entries,
            ttl_minutes,
        })
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = cache(10, 30);
        let key = QueryCache::key("what is this?", None, 0.7);
        assert!(cache.get(&key).is_none());

        cache.put(key.clone(), response("an answer"));
        assert_eq!(cache.get(&key).unwrap().answer, "an answer");
    }

    #[test]
    fn test_key_varies_with_scope_and_threshold() {
        let base = QueryCache::key("question", None, 0.7);
        assert_ne!(base, QueryCache::key("question", Some(5), 0.7));
        assert_ne!(base, QueryCache::key("question", None, 0.8));
        assert_ne!(base, QueryCache::key("other question", None, 0.7));
        // Case and surrounding whitespace do not change the key.
        assert_eq!(base, QueryCache::key("  Question  ", None, 0.7));
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let cache = cache(10, 0);
        let key = QueryCache::key("q", None, 0.7);
        cache.put(key.clone(), response("stale"));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_eviction_removes_oldest() {
        let cache = cache(2, 30);
        let k1 = QueryCache::key("first", None, 0.7);
        let k2 = QueryCache::key("second", None, 0.7);
        let k3 = QueryCache::key("third", None, 0.7);

        cache.put(k1.clone(), response("1"));
        cache.put(k2.clone(), response("2"));
        cache.put(k3.clone(), response("3"));

        assert_eq!(cache.stats().size, 2);
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let cache = cache(2, 30);
        let k1 = QueryCache::key("first", None, 0.7);
        let k2 = QueryCache::key("second", None, 0.7);
        cache.put(k1.clone(), response("1"));
        cache.put(k2.clone(), response("2"));
        cache.put(k1.clone(), response("1 again"));

        assert_eq!(cache.stats().size, 2);
        assert_eq!(cache.get(&k1).unwrap().answer, "1 again");
        assert!(cache.get(&k2).is_some());
    }

    #[test]
    fn test_clear_and_stats() {
        let cache = cache(100, 30);
        for i in 0..5 {
            cache.put(
                QueryCache::key(&format!("q{i}"), None, 0.7),
                response("a"),
            );
        }
        let stats = cache.stats();
        assert_eq!(stats.size, 5);
        assert_eq!(stats.max_entries, 100);
        assert_eq!(stats.ttl_minutes, 30);
        assert_eq!(stats.sample_keys.len(), 5);

        assert_eq!(cache.clear(), 5);
        assert_eq!(cache.stats().size, 0);
    }
}
