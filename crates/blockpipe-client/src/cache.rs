//! Result Cache with TTL and LRU Eviction
//!
//! Memoizes successful results of idempotent read calls, keyed by
//! [`Fingerprint`]. Failures are never stored: a fingerprint that failed is
//! always retried fresh.
//!
//! ## Eviction
//!
//! An entry leaves the cache on whichever comes first:
//! - **TTL**: an entry older than its TTL reads as absent (lazy expiry), and a
//!   sweep every `sweep_every` puts drops expired entries to bound memory
//! - **Capacity**: once `capacity` entries are resident, inserting a new
//!   fingerprint evicts the least recently used entry of the whole cache
//!
//! ## Concurrency
//!
//! The key space is split across `shards` independent LRU maps, each behind
//! its own mutex, so concurrent callers only contend when their fingerprints
//! land on the same shard. No lock is held across an await point, and at most
//! one shard lock is held at a time.
//!
//! Capacity is global. A resident counter spans all shards, and every entry
//! carries a cache-wide access tick, so eviction picks the shard whose LRU
//! entry is oldest. Under concurrent inserts residency can exceed
//! `capacity` by the number of racing puts until their evictions land.
//!
//! ```text
//! get(fp) ──→ shard[fp % shards] ──→ expired? ──YES──→ drop, miss
//!                                       │
//!                                       NO ──→ promote, hit
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let cache = ResultCache::new(CacheConfig::default());
//! if let Some(hit) = cache.get(&request.fingerprint()) {
//!     return hit;
//! }
//! let result = call_upstream(&request).await;
//! cache.put(request.fingerprint(), &result, cache.default_ttl());
//! ```

use blockpipe_core::{CallResult, Fingerprint};
use blockpipe_observability::metrics::{CACHE_ENTRIES, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

fn default_capacity() -> usize {
    10_000
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_shards() -> usize {
    16
}

fn default_sweep_every() -> u64 {
    1_000
}

/// Result cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether results are cached at all (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Total entry capacity across all shards (default: 10,000)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Entry time-to-live (default: 300s)
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Number of independently locked shards (default: 16)
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Sweep expired entries after this many puts (default: 1,000)
    #[serde(default = "default_sweep_every")]
    pub sweep_every: u64,
}

fn default_enabled() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            capacity: default_capacity(),
            ttl_ms: default_ttl_ms(),
            shards: default_shards(),
            sweep_every: default_sweep_every(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: CallResult,
    inserted_at: Instant,
    ttl: Duration,
    last_used: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Cache counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

pub struct ResultCache {
    shards: Box<[Mutex<LruCache<Fingerprint, CacheEntry>>]>,
    enabled: bool,
    capacity: usize,
    resident: AtomicUsize,
    clock: AtomicU64,
    default_ttl: Duration,
    sweep_every: u64,
    puts: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        let shard_count = config.shards.clamp(1, capacity);

        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::unbounded()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            enabled: config.enabled,
            capacity,
            resident: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            default_ttl: config.ttl(),
            sweep_every: config.sweep_every.max(1),
            puts: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn shard(&self, fingerprint: &Fingerprint) -> &Mutex<LruCache<Fingerprint, CacheEntry>> {
        let index = (fingerprint.prefix_u64() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Look up a live entry. The returned result is marked `from_cache`.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CallResult> {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();
        let mut shard = self.shard(fingerprint).lock();

        let expired = shard.peek(fingerprint).map(|entry| entry.is_expired(now));
        if expired.is_none() {
            drop(shard);
            self.misses.fetch_add(1, Ordering::Relaxed);
            CACHE_MISSES_TOTAL.inc();
            trace!(fingerprint = %fingerprint, "Cache miss");
            return None;
        }

        if expired == Some(true) {
            shard.pop(fingerprint);
            self.resident.fetch_sub(1, Ordering::Relaxed);
            drop(shard);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            CACHE_MISSES_TOTAL.inc();
            CACHE_ENTRIES.dec();
            trace!(fingerprint = %fingerprint, "Cache entry expired");
            return None;
        }

        let tick = self.tick();
        let hit = shard.get_mut(fingerprint).map(|entry| {
            entry.last_used = tick;
            entry.result.cached()
        });
        drop(shard);
        self.hits.fetch_add(1, Ordering::Relaxed);
        CACHE_HITS_TOTAL.inc();
        trace!(fingerprint = %fingerprint, "Cache hit");
        hit
    }

    /// Store a successful result for `ttl`. Failed results and `null`
    /// payloads are ignored.
    ///
    /// Returns `true` if the result was stored.
    pub fn put(&self, fingerprint: Fingerprint, result: &CallResult, ttl: Duration) -> bool {
        if !self.enabled || !result.is_success() || ttl.is_zero() {
            return false;
        }
        if result.payload().is_some_and(Value::is_null) {
            trace!(fingerprint = %fingerprint, "Not caching null result");
            return false;
        }

        let mut shard = self.shard(&fingerprint).lock();
        let entry = CacheEntry {
            result: result.clone(),
            inserted_at: Instant::now(),
            ttl,
            last_used: self.tick(),
        };
        let replaced = shard.push(fingerprint, entry).is_some();
        let resident = if replaced {
            0
        } else {
            self.resident.fetch_add(1, Ordering::Relaxed) + 1
        };
        drop(shard);

        if !replaced {
            CACHE_ENTRIES.inc();
            if resident > self.capacity && self.evict_lru() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        let puts = self.puts.fetch_add(1, Ordering::Relaxed) + 1;
        if puts % self.sweep_every == 0 {
            self.sweep_expired();
        }
        true
    }

    /// Remove the least recently used entry across all shards.
    fn evict_lru(&self) -> bool {
        loop {
            let victim = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(index, shard)| {
                    shard
                        .lock()
                        .peek_lru()
                        .map(|(key, entry)| (entry.last_used, index, *key))
                })
                .min_by_key(|(last_used, _, _)| *last_used);
            let Some((last_used, index, key)) = victim else {
                return false;
            };

            let mut shard = self.shards[index].lock();
            // Touched or removed since the scan: pick again.
            if shard
                .peek(&key)
                .is_some_and(|entry| entry.last_used == last_used)
            {
                shard.pop(&key);
                self.resident.fetch_sub(1, Ordering::Relaxed);
                drop(shard);
                CACHE_ENTRIES.dec();
                trace!(fingerprint = %key, "Evicted least recently used entry");
                return true;
            }
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let expired: Vec<Fingerprint> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| *key)
                .collect();
            for key in &expired {
                shard.pop(key);
            }
            self.resident.fetch_sub(expired.len(), Ordering::Relaxed);
            removed += expired.len();
        }
        if removed > 0 {
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            CACHE_ENTRIES.sub(removed as i64);
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        let mut cleared = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            self.resident.fetch_sub(shard.len(), Ordering::Relaxed);
            cleared += shard.len();
            shard.clear();
        }
        CACHE_ENTRIES.sub(cleared as i64);
        debug!(cleared, "Cache cleared");
    }

    /// Resident entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
