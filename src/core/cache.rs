//! Deduplicating provider cache
//!
//! Structure: HashMap<CacheKey, SharedProvider> + IndexSet<CacheKey> (LRU order)
//!
//! Guarantees:
//! - At most one live provider per key: lookup, factory call, insert and
//!   enqueue all happen under one lock, so concurrent `get()`s cannot race
//! - `invalidate()` takes the same lock: the next `get()` after it returns
//!   always misses, while holders of the old provider keep a detached instance
//! - Decode work never runs under the lock (factories only build decoders)
//!
//! With `capacity > 0`, completed entries are evicted least-recently-used
//! first once the map grows past capacity. In-flight entries are never evicted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use indexmap::IndexSet;
use log::{debug, trace, warn};

use crate::entities::traits::DecoderFactory;
use crate::entities::{CacheKey, Decoder, Provider, ProviderCache, SharedProvider};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<CacheKey, SharedProvider>,
    /// Front = least recently requested
    lru: IndexSet<CacheKey>,
}

impl Entries {
    fn remove(&mut self, key: &CacheKey) -> Option<SharedProvider> {
        self.lru.shift_remove(key);
        self.map.remove(key)
    }
}

/// Key → provider map feeding the background worker
pub struct FrameCache {
    entries: Mutex<Entries>,
    queue: Sender<SharedProvider>,
    stats: Arc<CacheStats>,
    /// Max retained entries, 0 = unbounded
    capacity: usize,
}

impl FrameCache {
    /// Create a cache that enqueues new providers on `queue`
    pub fn new(queue: Sender<SharedProvider>, capacity: usize) -> Self {
        debug!("FrameCache created: capacity={}", capacity);
        Self {
            entries: Mutex::new(Entries::default()),
            queue,
            stats: Arc::new(CacheStats::new()),
            capacity,
        }
    }

    /// Return the live provider for `key`, or build, register and enqueue one.
    ///
    /// `factory` is invoked only on a miss, and at most once per live key.
    pub fn get<F>(&self, key: CacheKey, factory: F) -> SharedProvider
    where
        F: FnOnce() -> Decoder,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = entries.map.get(&key).cloned() {
            self.stats.record_hit();
            entries.lru.shift_remove(&key);
            entries.lru.insert(key);
            return existing;
        }

        self.stats.record_miss();
        let provider = Arc::new(Provider::new(key.clone(), factory()));
        trace!("Cache miss: {} ({:?})", key, provider);
        entries.map.insert(key.clone(), Arc::clone(&provider));
        entries.lru.insert(key);

        if self.queue.send(Arc::clone(&provider)).is_err() {
            warn!("Worker queue closed, {} will never be decoded", provider.key());
        }

        if self.capacity > 0 {
            self.evict_completed(&mut entries);
        }
        provider
    }

    /// Drop completed entries, oldest first, until back under capacity
    fn evict_completed(&self, entries: &mut Entries) {
        while entries.map.len() > self.capacity {
            let victim = entries
                .lru
                .iter()
                .find(|k| entries.map.get(*k).is_some_and(|p| p.is_complete()))
                .cloned();
            let Some(key) = victim else {
                break;
            };
            entries.remove(&key);
            self.stats.record_eviction();
            debug!("LRU evicted: {}", key);
        }
    }

    /// Forget `key`; returns true if it was cached
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let removed = entries.remove(key).is_some();
        if removed {
            debug!("Invalidated {}", key);
        }
        removed
    }

    /// Forget every key derived from `path`, edits included; returns the count
    pub fn invalidate_source(&self, path: &Path) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<CacheKey> = entries
            .map
            .keys()
            .filter(|k| k.depends_on(path))
            .cloned()
            .collect();
        for key in &stale {
            entries.remove(key);
        }
        if !stale.is_empty() {
            debug!("Invalidated {} entries for {}", stale.len(), path.display());
        }
        stale.len()
    }

    /// Atomically clear every mapping
    pub fn flush_all(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let count = entries.map.len();
        entries.map.clear();
        entries.lru.clear();
        debug!("Cache flushed: {} entries", count);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached providers still decoding
    pub fn pending(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map
            .values()
            .filter(|p| !p.is_complete())
            .count()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl ProviderCache for FrameCache {
    fn provider(&self, key: CacheKey, factory: DecoderFactory<'_>) -> SharedProvider {
        self.get(key, factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn missing(name: &str) -> Decoder {
        Decoder::Sniff {
            path: PathBuf::from("/nonexistent/seqload").join(name),
            force_generic: false,
        }
    }

    fn cache(capacity: usize) -> (FrameCache, Receiver<SharedProvider>) {
        let (tx, rx) = unbounded();
        (FrameCache::new(tx, capacity), rx)
    }

    #[test]
    fn test_factory_called_once_per_key() {
        let (cache, rx) = cache(0);
        let calls = AtomicUsize::new(0);
        let key = CacheKey::file(Path::new("a.png"), 0);

        let first = cache.get(key.clone(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            missing("a.png")
        });
        for _ in 0..5 {
            let again = cache.get(key.clone(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                missing("a.png")
            });
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(cache.stats().hits(), 5);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_concurrent_get_single_factory_call() {
        let (cache, rx) = cache(0);
        let cache = Arc::new(cache);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::file(Path::new("shared.png"), 7);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let key = key.clone();
                thread::spawn(move || {
                    cache.get(key, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        missing("shared.png")
                    })
                })
            })
            .collect();
        let providers: Vec<SharedProvider> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(providers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_invalidate_forces_fresh_provider() {
        let (cache, _rx) = cache(0);
        let key = CacheKey::file(Path::new("a.png"), 0);
        let held = cache.get(key.clone(), || missing("a.png"));

        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));

        let calls = AtomicUsize::new(0);
        let fresh = cache.get(key.clone(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            missing("a.png")
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!Arc::ptr_eq(&held, &fresh));

        // The detached provider still works for its holder
        held.advance();
        assert!(held.is_complete());
        assert!(!fresh.is_complete());
    }

    #[test]
    fn test_invalidate_source_covers_edits() {
        let (cache, _rx) = cache(0);
        let a0 = CacheKey::file(Path::new("a.vpp"), 0);
        let a1 = CacheKey::file(Path::new("a.vpp"), 1);
        let b0 = CacheKey::file(Path::new("b.vpp"), 0);
        let edit = CacheKey::Edit {
            program: Arc::from("x y -"),
            inputs: vec![b0.clone(), a1.clone()],
        };
        for key in [&a0, &a1, &b0, &edit] {
            cache.get(key.clone(), || missing("x"));
        }

        assert_eq!(cache.invalidate_source(Path::new("a.vpp")), 3);
        assert!(cache.contains(&b0));
        assert!(!cache.contains(&edit));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_flush_all() {
        let (cache, _rx) = cache(0);
        for i in 0..4 {
            cache.get(CacheKey::file(Path::new("v.vpp"), i), || missing("v"));
        }
        assert_eq!(cache.len(), 4);
        cache.flush_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_get_race_never_duplicates() {
        let (cache, _rx) = cache(0);
        let cache = Arc::new(cache);
        let key = CacheKey::file(Path::new("race.png"), 0);

        let invalidator = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    cache.invalidate(&key);
                }
            })
        };
        for _ in 0..500 {
            let p = cache.get(key.clone(), || missing("race.png"));
            assert_eq!(p.key(), &key);
            assert!(cache.len() <= 1);
        }
        invalidator.join().unwrap();

        cache.invalidate(&key);
        let calls = AtomicUsize::new(0);
        cache.get(key.clone(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            missing("race.png")
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capacity_evicts_only_completed() {
        let (cache, _rx) = cache(2);
        let p0 = cache.get(CacheKey::file(Path::new("v"), 0), || missing("0"));
        cache.get(CacheKey::file(Path::new("v"), 1), || missing("1"));
        // Nothing complete yet: over capacity but nothing evictable
        cache.get(CacheKey::file(Path::new("v"), 2), || missing("2"));
        assert_eq!(cache.len(), 3);

        p0.advance();
        cache.get(CacheKey::file(Path::new("v"), 3), || missing("3"));
        assert!(!cache.contains(&CacheKey::file(Path::new("v"), 0)));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions(), 1);
    }
}
