//! Resolution cache for bindings.
//!
//! Maps `(namespace, capability, consumer)` to the last binding produced for
//! it. Entries past their expiry read as misses but stay in place until they
//! are overwritten, evicted or purged, so a stale binding can still be offered
//! as a last resort. When `max_size` is reached the least recently used entry
//! is evicted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::binding::Binding;

/// Separate key spaces for behavioral and file-path bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheNamespace {
    Capability,
    FilePath,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    namespace: CacheNamespace,
    capability: String,
    consumer: String,
}

impl CacheKey {
    fn new(namespace: CacheNamespace, capability: &str, consumer: &str) -> Self {
        Self {
            namespace,
            capability: capability.to_string(),
            consumer: consumer.to_string(),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    binding: Binding,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Recency tick → key; the smallest tick is the LRU entry.
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &CacheKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.last_used);
            entry.last_used = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_used);
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<CacheKey> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// TTL + LRU cache of bindings.
#[derive(Debug)]
pub struct ResolutionCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResolutionCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Live binding for the key, or `None` when absent or expired.
    pub fn get(&self, namespace: CacheNamespace, capability: &str, consumer: &str) -> Option<Binding> {
        let key = CacheKey::new(namespace, capability, consumer);
        let mut inner = self.inner.lock();
        let live = match inner.entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.binding.clone()),
            _ => None,
        };
        if live.is_some() {
            inner.touch(&key);
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        live
    }

    /// Expired binding still physically present for the key.
    pub fn get_stale(
        &self,
        namespace: CacheNamespace,
        capability: &str,
        consumer: &str,
    ) -> Option<Binding> {
        let key = CacheKey::new(namespace, capability, consumer);
        let inner = self.inner.lock();
        inner
            .entries
            .get(&key)
            .filter(|entry| entry.expires_at <= Instant::now())
            .map(|entry| entry.binding.clone())
    }

    /// Store `binding`, replacing any previous entry (last writer wins).
    pub fn put(
        &self,
        namespace: CacheNamespace,
        capability: &str,
        consumer: &str,
        binding: Binding,
        ttl: Duration,
    ) {
        let key = CacheKey::new(namespace, capability, consumer);
        let mut inner = self.inner.lock();
        inner.remove(&key);
        while inner.entries.len() >= self.max_size {
            match inner.evict_lru() {
                Some(evicted) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Evicted LRU binding for {}/{}",
                        evicted.capability,
                        evicted.consumer
                    );
                }
                None => break,
            }
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.recency.insert(tick, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                binding,
                expires_at: Instant::now() + ttl,
                last_used: tick,
            },
        );
    }

    /// Drop the entry for one key. Returns whether something was removed.
    pub fn invalidate(&self, namespace: CacheNamespace, capability: &str, consumer: &str) -> bool {
        let key = CacheKey::new(namespace, capability, consumer);
        self.inner.lock().remove(&key).is_some()
    }

    /// Drop every entry requested as `capability` or bound against it, in
    /// every namespace and for every consumer.
    pub fn invalidate_capability(&self, capability: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(k, e)| k.capability == capability || e.binding.capability == capability)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    /// Physically remove expired entries. Optional; reads already ignore them.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
