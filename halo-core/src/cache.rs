//! Result cache for ensemble evaluations.
//!
//! Entries are keyed by a SHA-256 fingerprint of the agent output and the
//! ground truth. Conversation history is not part of the key, so two
//! requests that differ only in history share one entry.
//!
//! Eviction is bounded FIFO: once `capacity` is reached the oldest inserted
//! entry goes first, regardless of how recently it was read.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::CacheConfig;
use crate::types::{EnsembleResult, EvaluationRequest};

/// Stable content hash of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Fingerprint `(agent_output, ground_truth)`.
    ///
    /// Fields are length-prefixed so `("ab", "c")` and `("a", "bc")` differ,
    /// and a missing ground truth differs from an empty one.
    pub fn of(request: &EvaluationRequest) -> Self {
        let mut hasher = Sha256::new();
        let output = request.agent_output().as_bytes();
        hasher.update((output.len() as u64).to_le_bytes());
        hasher.update(output);
        match request.ground_truth() {
            Some(gt) => {
                hasher.update([1u8]);
                hasher.update((gt.len() as u64).to_le_bytes());
                hasher.update(gt.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16.min(self.0.len())])
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Number of live entries
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: EnsembleResult,
    inserted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<Fingerprint, CacheEntry>,
    /// Insertion order, oldest first; holds each live key once
    order: VecDeque<Fingerprint>,
}

impl Entries {
    fn remove(&mut self, key: &Fingerprint) -> bool {
        if self.map.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

/// Bounded FIFO cache of ensemble results, owned by one engine.
#[derive(Debug)]
pub struct ResultCache {
    entries: RwLock<Entries>,
    counters: Counters,
    capacity: usize,
    ttl: Option<Duration>,
}

impl ResultCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            counters: Counters::default(),
            capacity: capacity.max(1),
            ttl: None,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let cache = Self::new(config.capacity);
        match config.ttl_secs {
            Some(secs) => cache.with_ttl(Duration::seconds(secs.min(i64::MAX as u64 / 1000) as i64)),
            None => cache,
        }
    }

    /// Expire entries older than `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        self.ttl.map(|ttl| now - entry.inserted_at > ttl).unwrap_or(false)
    }

    /// Look up a stored result.
    pub async fn get(&self, key: &Fingerprint) -> Option<EnsembleResult> {
        self.get_at(key, Utc::now()).await
    }

    async fn get_at(&self, key: &Fingerprint, now: DateTime<Utc>) -> Option<EnsembleResult> {
        {
            let entries = self.entries.read().await;
            match entries.map.get(key) {
                Some(entry) if !self.is_expired(entry, now) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.result.clone());
                }
                Some(_) => {}
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: drop it under the write lock. Another writer may have
        // replaced it in between, so check again.
        let mut entries = self.entries.write().await;
        let still_expired = entries
            .map
            .get(key)
            .map(|e| self.is_expired(e, now))
            .unwrap_or(false);
        if still_expired && entries.remove(key) {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache entry expired");
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result, evicting the oldest entry when full.
    ///
    /// Writing an existing key overwrites the value and resets its age
    /// without moving it in the eviction order.
    pub async fn insert(&self, key: Fingerprint, result: EnsembleResult) {
        self.insert_at(key, result, Utc::now()).await
    }

    async fn insert_at(&self, key: Fingerprint, result: EnsembleResult, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        let entry = CacheEntry {
            result,
            inserted_at: now,
        };

        if let Some(existing) = entries.map.get_mut(&key) {
            *existing = entry;
        } else {
            while entries.map.len() >= self.capacity {
                let Some(oldest) = entries.order.pop_front() else {
                    break;
                };
                if entries.map.remove(&oldest).is_some() {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %oldest, "cache entry evicted");
                }
            }
            entries.order.push_back(key.clone());
            entries.map.insert(key, entry);
        }
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now()).await
    }

    async fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let mut entries = self.entries.write().await;
        let expired: Vec<Fingerprint> = entries
            .map
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Drop all entries. Statistics are kept.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.map.clear();
        entries.order.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the statistics.
    pub async fn stats(&self) -> CacheStats {
        let entry_count = self.len().await as u64;
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entry_count,
        }
    }
}
