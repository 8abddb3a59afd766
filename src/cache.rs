//! In-memory cache of whole upstream responses for large, repeated prompts.
//!
//! Values are stored behind `Arc`, so a reader either finds nothing or the
//! complete response. Expired entries are dropped on read and swept on insert.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CacheConfig;
use crate::translate::gemini_types::{GenerateContentRequest, GenerateContentResponse};

#[derive(Debug)]
struct CacheEntry {
    value: Arc<GenerateContentResponse>,
    inserted: Instant,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
}

#[derive(Debug)]
pub struct ContentCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    ttl: Duration,
    min_chars: usize,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl ContentCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            min_chars: config.min_chars,
            max_entries: config.max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Hex SHA-256 of the target model and the serialized request.
    pub fn key(model: &str, request: &GenerateContentRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(request).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    /// Only prompts at least `min_chars` long are worth caching.
    pub fn eligible(&self, request: &GenerateContentRequest) -> bool {
        request.prompt_chars() >= self.min_chars
    }

    pub fn get(&self, key: &str) -> Option<Arc<GenerateContentResponse>> {
        // Clone out before removing; holding a shard guard across remove deadlocks.
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()));
        match entry {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.value))
            }
            Some(_) => {
                self.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: GenerateContentResponse) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted.elapsed() < ttl);

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().inserted)
                .map(|e| e.key().clone());
            if let Some(oldest) = oldest {
                debug!(key = %oldest, "Evicting oldest cache entry");
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(
            key,
            Arc::new(CacheEntry {
                value: Arc::new(value),
                inserted: Instant::now(),
            }),
        );
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::gemini_types::{Content, Part};

    fn config(ttl_secs: u64, max_entries: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            min_chars: 10,
            ttl_secs,
            max_entries,
        }
    }

    fn request(text: &str) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(text)],
            }],
            ..GenerateContentRequest::default()
        }
    }

    fn response(id: &str) -> GenerateContentResponse {
        GenerateContentResponse {
            response_id: Some(id.to_string()),
            ..GenerateContentResponse::default()
        }
    }

    #[test]
    fn test_key_depends_on_model_and_body() {
        let a = ContentCache::key("gemini-2.5-pro", &request("hello world"));
        assert_eq!(a.len(), 64);
        assert_eq!(a, ContentCache::key("gemini-2.5-pro", &request("hello world")));
        assert_ne!(a, ContentCache::key("gemini-2.5-flash", &request("hello world")));
        assert_ne!(a, ContentCache::key("gemini-2.5-pro", &request("hello there")));
    }

    #[test]
    fn test_eligibility_threshold() {
        let cache = ContentCache::new(&config(60, 4));
        assert!(!cache.eligible(&request("short")));
        assert!(cache.eligible(&request("long enough prompt")));
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = ContentCache::new(&config(60, 4));
        assert!(cache.get("k").is_none());
        cache.insert("k".to_string(), response("r1"));

        let hit = cache.get("k").unwrap();
        assert_eq!(hit.response_id.as_deref(), Some("r1"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
    }

    #[test]
    fn test_expired_entries_are_not_served() {
        let cache = ContentCache::new(&config(0, 4));
        cache.insert("k".to_string(), response("r1"));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_oldest_entry_is_evicted() {
        let cache = ContentCache::new(&config(60, 2));
        cache.insert("a".to_string(), response("a"));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".to_string(), response("b"));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c".to_string(), response("c"));

        assert_eq!(cache.stats().entries, 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
