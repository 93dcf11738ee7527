use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which entry to drop when a cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionPolicy {
    /// Least recently read.
    #[default]
    Lru,
    /// Least frequently read.
    Lfu,
    /// Oldest insertion.
    Fifo,
    /// Uniformly random entry.
    Random,
    /// Entry closest to its expiry.
    #[serde(rename = "TTL_BASED", alias = "TTL")]
    TtlBased,
}

/// Caching policy for one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Time to live from insertion, in seconds. 0 disables TTL.
    pub ttl_seconds: u64,
    /// Maximum time since last read, in seconds. 0 disables idle expiry.
    pub max_idle_seconds: u64,
    pub max_size: usize,
    pub eviction_policy: EvictionPolicy,
    pub preload_enabled: bool,
    pub refresh_ahead: bool,
    /// Percentage of the TTL after which a hit triggers a background reload.
    pub refresh_ahead_factor: u64,
    pub statistics_enabled: bool,
    pub key_prefix: Option<String>,
    pub compression_enabled: bool,
    pub serialization_format: String,
    pub warmup_enabled: bool,
    pub warmup_batch_size: u32,
    pub distributed_cache: bool,
    pub replication_factor: u32,
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    #[must_use]
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 3600,
            max_idle_seconds: 1800,
            max_size: 10_000,
            eviction_policy: EvictionPolicy::Lru,
            preload_enabled: false,
            refresh_ahead: false,
            refresh_ahead_factor: 75,
            statistics_enabled: true,
            key_prefix: None,
            compression_enabled: false,
            serialization_format: "json".to_string(),
            warmup_enabled: false,
            warmup_batch_size: 100,
            distributed_cache: false,
            replication_factor: 1,
        }
    }
}
