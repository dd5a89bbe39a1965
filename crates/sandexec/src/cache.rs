//! Restricted-rewrite cache: an LRU cache keyed by SHA-256 hashes of cleaned
//! source.
//!
//! The restricted compiler parses and re-emits the whole snippet, which costs
//! more than running most snippets. Clients tend to send the same source
//! repeatedly, so the rewritten text is kept here and shared by every call an
//! [`Executor`](crate::Executor) makes. Only successful rewrites are stored;
//! a rejected snippet is re-checked (and rejected) every time.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest used as a cache key.
pub type CacheKey = [u8; 32];

/// SHA-256 of `source`.
pub fn cache_key(source: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.finalize().into()
}

/// LRU cache mapping [`CacheKey`] → rewritten source.
pub struct RewriteCache {
    inner: Mutex<LruCache<CacheKey, String>>,
    capacity: usize,
}

impl RewriteCache {
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached rewrite of `source`, or runs `rewrite` and stores
    /// its result on success. The lock is not held while `rewrite` runs.
    pub fn get_or_rewrite<F, E>(&self, source: &str, rewrite: F) -> Result<String, E>
    where
        F: FnOnce(&str) -> Result<String, E>,
    {
        let key = cache_key(source);
        if let Some(hit) = self.get(&key) {
            tracing::trace!("rewrite cache hit");
            return Ok(hit);
        }
        let rewritten = rewrite(source)?;
        self.insert(key, rewritten.clone());
        Ok(rewritten)
    }

    /// Looks up `key`, marking it most recently used on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Inserts `key` → `value`, evicting the least recently used entry when full.
    pub fn insert(&self, key: CacheKey, value: String) {
        self.lock().put(key, value);
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

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    // ── cache_key ────────────────────────────────────────────────────────────

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        assert_eq!(cache_key("x = 1"), cache_key("x = 1"));
        assert_ne!(cache_key("x = 1"), cache_key("x = 2"));
    }

    // ── get_or_rewrite ───────────────────────────────────────────────────────

    #[test]
    fn test_rewrite_runs_once_per_source() {
        let cache = RewriteCache::new(8);
        let calls = Cell::new(0);
        let rewrite = |src: &str| -> Result<String, ()> {
            calls.set(calls.get() + 1);
            Ok(format!("rewritten:{src}"))
        };

        assert_eq!(cache.get_or_rewrite("a.b", rewrite), Ok("rewritten:a.b".to_string()));
        assert_eq!(cache.get_or_rewrite("a.b", rewrite), Ok("rewritten:a.b".to_string()));
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_rewrite_is_not_cached() {
        let cache = RewriteCache::new(8);
        let result: Result<String, &str> = cache.get_or_rewrite("import os", |_| Err("rejected"));
        assert_eq!(result, Err("rejected"));
        assert!(cache.is_empty());
    }

    // ── LRU eviction ─────────────────────────────────────────────────────────

    #[test]
    fn test_lru_eviction_order() {
        let cache = RewriteCache::new(2);
        let (a, b, c) = (cache_key("a"), cache_key("b"), cache_key("c"));

        cache.insert(a, "A".to_string());
        cache.insert(b, "B".to_string());
        let _ = cache.get(&a);
        cache.insert(c, "C".to_string());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&b), None);
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn test_capacity_zero_treated_as_one() {
        let cache = RewriteCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(cache_key("x"), "1".to_string());
        cache.insert(cache_key("y"), "2".to_string());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_empties_cache() {
        let cache = RewriteCache::new(4);
        cache.insert(cache_key("a"), "A".to_string());
        cache.clear();
        assert!(cache.is_empty());
    }

    // ── Thread safety ────────────────────────────────────────────────────────

    #[test]
    fn test_concurrent_rewrites() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(RewriteCache::new(64));
        let handles: Vec<_> = (0_u32..4)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for j in 0_u32..16 {
                        let src = format!("x_{} = {j}", i % 2);
                        let out: Result<String, ()> =
                            cache.get_or_rewrite(&src, |s| Ok(s.to_uppercase()));
                        assert_eq!(out, Ok(src.to_uppercase()));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
        assert_eq!(cache.len(), 32);
    }
}
