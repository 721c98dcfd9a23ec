//! In-process embedding cache
//!
//! Provides:
//! - A strict LRU bound on the number of cached query vectors
//! - Keys derived from whitespace-normalized text (SHA-256, hex)
//! - `get_or_compute` that never holds the lock across the computation
//!
//! Two concurrent misses for the same text may both compute; the last
//! insert wins and both callers receive equal vectors.

use crate::errors::Result;
use crate::metrics;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const CACHE_NAME: &str = "embedding";

/// Collapse runs of whitespace and trim; case is preserved
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache key for a text
pub fn cache_key(text: &str) -> String {
    hex::encode(Sha256::digest(normalize_text(text).as_bytes()))
}

/// Hit/miss counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Bounded LRU map from normalized question text to its embedding
pub struct EmbeddingCache {
    entries: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` vectors (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let bounded = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(bounded)),
            capacity: bounded.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Arc<Vec<f32>>>> {
        // A panic while holding the lock cannot leave the LRU half-updated
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a vector, promoting it to most recently used
    pub fn get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        let key = cache_key(text);
        let found = self.lock().get(&key).cloned();

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache(found.is_some(), CACHE_NAME);
        found
    }

    /// Store a vector, evicting the least recently used entry when full
    pub fn put(&self, text: &str, vector: Vec<f32>) -> Arc<Vec<f32>> {
        let vector = Arc::new(vector);
        self.lock().put(cache_key(text), Arc::clone(&vector));
        vector
    }

    /// Return the cached vector or compute, store, and return it
    pub async fn get_or_compute<F, Fut>(&self, text: &str, compute: F) -> Result<Arc<Vec<f32>>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Vec<f32>>>,
    {
        if let Some(vector) = self.get(text) {
            tracing::debug!(len = vector.len(), "Embedding cache hit");
            return Ok(vector);
        }

        let normalized = normalize_text(text);
        let vector = compute(normalized).await?;
        Ok(self.put(text, vector))
    }

    pub fn contains(&self, text: &str) -> bool {
        self.lock().contains(&cache_key(text))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
