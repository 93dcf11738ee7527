//! Bounded keyed cache with TTL, idle expiry, eviction policies and
//! refresh-ahead.
//!
//! Expiry is checked on read, mirroring the record-store approach: an entry
//! past its TTL or idle limit is removed and reported as a miss. Hits, misses
//! and evictions are folded into the owning adapter's metrics when present.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apex_data_core::{CacheConfig, DataSourceMetrics, EvictionPolicy};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created: Instant,
    last_access: Instant,
    expires_at: Instant,
    hits: u64,
    refreshing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpiryReason {
    NotExpired,
    Ttl,
    MaxIdle,
}

/// Outcome of [`TtlCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    /// Fresh value.
    Hit(V),
    /// Valid value old enough to reload. Reported once per entry until the
    /// entry is rewritten.
    Stale(V),
    Miss,
}

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

/// Concurrent cache keyed by string.
///
/// `max_size == 0` means unbounded. A zero `max_idle` disables idle expiry.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
    max_idle: Duration,
    max_size: usize,
    policy: EvictionPolicy,
    refresh_after: Option<Duration>,
    metrics: Option<Arc<DataSourceMetrics>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Builds a cache from its configuration, reporting into `metrics`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(config: &CacheConfig, metrics: Option<Arc<DataSourceMetrics>>) -> Self {
        let ttl = config.ttl();
        let refresh_after = config.refresh_ahead.then(|| {
            let factor = config.refresh_ahead_factor.min(100);
            ttl.mul_f64(factor as f64 / 100.0)
        });
        Self {
            entries: DashMap::new(),
            ttl,
            max_idle: config.max_idle(),
            max_size: config.max_size,
            policy: config.eviction_policy,
            refresh_after,
            metrics,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the value if present and not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        match self.lookup(key) {
            CacheLookup::Hit(v) | CacheLookup::Stale(v) => Some(v),
            CacheLookup::Miss => None,
        }
    }

    /// Like [`get`](Self::get), but distinguishes values due for refresh-ahead.
    pub fn lookup(&self, key: &str) -> CacheLookup<V> {
        let now = Instant::now();
        let reason = match self.entries.get_mut(key) {
            None => {
                self.record_miss();
                return CacheLookup::Miss;
            }
            Some(mut entry) => {
                let reason = self.check_expired(&entry, now);
                if reason == ExpiryReason::NotExpired {
                    entry.last_access = now;
                    entry.hits += 1;
                    let stale = !entry.refreshing
                        && self
                            .refresh_after
                            .is_some_and(|after| now.duration_since(entry.created) >= after);
                    if stale {
                        entry.refreshing = true;
                    }
                    let value = entry.value.clone();
                    drop(entry);
                    self.record_hit();
                    return if stale {
                        CacheLookup::Stale(value)
                    } else {
                        CacheLookup::Hit(value)
                    };
                }
                reason
            }
        };

        tracing::trace!(key, ?reason, "cache entry expired");
        if self.entries.remove(key).is_some() {
            self.record_eviction();
        }
        self.record_miss();
        CacheLookup::Miss
    }

    /// Inserts with the configured TTL.
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.put_with_ttl(key, value, self.ttl);
    }

    /// Inserts with an explicit TTL, evicting one entry first if the cache is full.
    pub fn put_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        if self.max_size > 0
            && !self.entries.contains_key(&key)
            && self.entries.len() >= self.max_size
        {
            self.evict_one();
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created: now,
                last_access: now,
                expires_at: now + ttl,
                hits: 0,
                refreshing: false,
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| self.check_expired(&e, Instant::now()) == ExpiryReason::NotExpired)
    }

    /// Keys of live entries, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| self.check_expired(e.value(), now) == ExpiryReason::NotExpired)
            .map(|e| e.key().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, e| self.check_expired(e, now) == ExpiryReason::NotExpired);
        let removed = before.saturating_sub(self.entries.len());
        for _ in 0..removed {
            self.record_eviction();
        }
        removed
    }

    #[must_use]
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            size: self.entries.len(),
            max_size: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn check_expired(&self, entry: &CacheEntry<V>, now: Instant) -> ExpiryReason {
        if now >= entry.expires_at {
            return ExpiryReason::Ttl;
        }
        if !self.max_idle.is_zero() && now.duration_since(entry.last_access) >= self.max_idle {
            return ExpiryReason::MaxIdle;
        }
        ExpiryReason::NotExpired
    }

    fn evict_one(&self) {
        let victim = match self.policy {
            EvictionPolicy::Random => self.random_key(),
            EvictionPolicy::Lru => self.min_key_by(|e| (e.last_access, 0)),
            EvictionPolicy::Lfu => self
                .entries
                .iter()
                .min_by_key(|e| (e.hits, e.last_access))
                .map(|e| e.key().clone()),
            EvictionPolicy::Fifo => self.min_key_by(|e| (e.created, 0)),
            EvictionPolicy::TtlBased => self.min_key_by(|e| (e.expires_at, 0)),
        };
        if let Some(key) = victim {
            if self.entries.remove(&key).is_some() {
                tracing::trace!(key, policy = ?self.policy, "cache eviction");
                self.record_eviction();
            }
        }
    }

    fn min_key_by<F>(&self, rank: F) -> Option<String>
    where
        F: Fn(&CacheEntry<V>) -> (Instant, u8),
    {
        self.entries
            .iter()
            .min_by_key(|e| rank(e.value()))
            .map(|e| e.key().clone())
    }

    /// Single-slot reservoir sample over the current keys.
    fn random_key(&self) -> Option<String> {
        use rand::Rng;

        let mut rng = rand::rng();
        let mut chosen = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if rng.random_range(0..=i) == 0 {
                chosen = Some(entry.key().clone());
            }
        }
        chosen
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.record_cache_hit();
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.record_cache_miss();
        }
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.record_cache_eviction();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
