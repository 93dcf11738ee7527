//! Cache adapter: a keyed in-memory store exposed through the data-source
//! contract. Queries are key patterns, updates are `key=value` pairs.

use std::sync::Arc;
use std::time::Duration;

use apex_data_core::{
    CacheConfig, ConnectionStatus, DataSourceConfiguration, DataSourceError, DataSourceMetrics,
    DataSourceType, Params, Record, Result, Value,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;

use super::{data_cache_key, AdapterCore};
use crate::resilience::{CacheStatistics, TtlCache};
use crate::traits::ExternalDataSource;

const HEALTH_CHECK_KEY: &str = "_health_check_";

/// Backing store for a cache data source. Keys are namespaced by the
/// configured prefix.
struct CacheManager {
    entries: TtlCache<Value>,
    prefix: String,
}

impl CacheManager {
    fn new(config: &CacheConfig, metrics: Arc<DataSourceMetrics>) -> Self {
        Self {
            entries: TtlCache::new(config, Some(metrics)),
            prefix: config.key_prefix.clone().unwrap_or_default(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Live keys matching `pattern`, prefix stripped, sorted.
    fn keys_matching(&self, pattern: &Regex) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .filter(|k| k != HEALTH_CHECK_KEY && pattern.is_match(k))
            .collect();
        keys.sort();
        keys
    }

    /// Round-trips a marker entry without touching hit/miss counters.
    fn round_trip(&self) -> bool {
        let key = self.full_key(HEALTH_CHECK_KEY);
        self.entries.put(key.clone(), Value::from("ok"));
        let present = self.entries.contains(&key);
        let removed = self.entries.remove(&key).is_some();
        present && removed
    }
}

/// Compiles a key pattern where `*` matches any run and `?` one character.
fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| {
        DataSourceError::configuration(format!("Invalid key pattern '{pattern}': {e}"))
    })
}

pub struct CacheDataSource {
    core: AdapterCore,
    manager: RwLock<Option<Arc<CacheManager>>>,
}

impl Default for CacheDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheDataSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: AdapterCore::new(),
            manager: RwLock::new(None),
        }
    }

    fn manager(&self, operation: &str) -> Result<Arc<CacheManager>> {
        self.core.ensure_operational(operation)?;
        self.manager.read().clone().ok_or_else(|| {
            DataSourceError::connection("Cache not initialized")
                .in_context(&self.core.name(), operation)
        })
    }

    /// Stores `value` under `key` with the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns `CONNECTION_ERROR` if the cache is not initialized.
    pub fn put(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let manager = self.manager("put")?;
        manager.entries.put(manager.full_key(key), value.into());
        Ok(())
    }

    /// Stores `value` under `key` with an explicit TTL.
    ///
    /// # Errors
    ///
    /// Returns `CONNECTION_ERROR` if the cache is not initialized.
    pub fn put_with_ttl(&self, key: &str, value: impl Into<Value>, ttl: Duration) -> Result<()> {
        let manager = self.manager("put")?;
        manager
            .entries
            .put_with_ttl(manager.full_key(key), value.into(), ttl);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `CONNECTION_ERROR` if the cache is not initialized.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let manager = self.manager("get")?;
        Ok(manager.entries.get(&manager.full_key(key)))
    }

    /// Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns `CONNECTION_ERROR` if the cache is not initialized.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let manager = self.manager("remove")?;
        Ok(manager.entries.remove(&manager.full_key(key)).is_some())
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.manager
            .read()
            .as_ref()
            .is_some_and(|m| m.entries.contains(&m.full_key(key)))
    }

    /// Keys matching a `*`/`?` wildcard pattern.
    ///
    /// # Errors
    ///
    /// Returns `CONFIGURATION_ERROR` for a pattern that cannot be compiled,
    /// or `CONNECTION_ERROR` if the cache is not initialized.
    pub fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let manager = self.manager("keys_by_pattern")?;
        Ok(manager.keys_matching(&wildcard_regex(pattern)?))
    }

    /// Drops expired entries and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.manager
            .read()
            .as_ref()
            .map_or(0, |m| m.entries.evict_expired())
    }

    #[must_use]
    pub fn statistics(&self) -> Option<CacheStatistics> {
        self.manager.read().as_ref().map(|m| m.entries.statistics())
    }

    pub fn clear(&self) {
        if let Some(manager) = self.manager.read().as_ref() {
            manager.entries.clear();
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.manager.read().as_ref().map_or(0, |m| m.entries.len())
    }
}

#[async_trait]
impl ExternalDataSource for CacheDataSource {
    fn configuration(&self) -> Arc<DataSourceConfiguration> {
        self.core.config()
    }

    fn source_type(&self) -> DataSourceType {
        DataSourceType::Cache
    }

    fn metrics(&self) -> Arc<DataSourceMetrics> {
        self.core.metrics()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.core.status()
    }

    async fn initialize(&self, config: &DataSourceConfiguration) -> Result<()> {
        self.core.set_config(config);
        self.core.begin_connect();

        let backend = config.source_type_or_default();
        match backend.as_str() {
            "cache" | "memory" | "in-memory" => {}
            "redis" | "hazelcast" => {
                tracing::warn!(
                    source = %config.name,
                    backend = %backend,
                    "distributed cache client not available, falling back to in-memory cache"
                );
            }
            other => {
                let err = DataSourceError::configuration(format!("Unsupported cache type: {other}"))
                    .in_context(&config.name, "initialize");
                self.core.connect_failed(&err);
                return Err(err);
            }
        }

        let cache_config = config.cache.clone().unwrap_or_default();
        let manager = Arc::new(CacheManager::new(&cache_config, self.core.metrics()));
        if !manager.round_trip() {
            let err = DataSourceError::connection("Failed to establish cache connection")
                .in_context(&config.name, "initialize");
            self.core.connect_failed(&err);
            return Err(err);
        }
        *self.manager.write() = Some(manager);
        self.core.connect_succeeded("Cache data source initialized");
        tracing::info!(source = %config.name, "cache data source initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.core.set_status(ConnectionStatus::shutting_down());
        if let Some(manager) = self.manager.write().take() {
            manager.entries.clear();
        }
        self.core.set_status(ConnectionStatus::shutdown());
        tracing::debug!(source = %self.core.name(), "cache data source shut down");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.core.status().is_operational() && self.test_connection().await
    }

    async fn test_connection(&self) -> bool {
        self.manager.read().as_ref().is_some_and(|m| m.round_trip())
    }

    async fn get_data(&self, data_type: &str, params: &[Value]) -> Result<Option<Value>> {
        let manager = self.manager("get_data")?;
        let key = manager.full_key(&data_cache_key(data_type, params));
        self.core
            .timed("get_data", async { Ok(manager.entries.get(&key)) })
            .await
    }

    /// Values of every live key matching the pattern; maps pass through,
    /// other values are wrapped as `{"key", "value"}`.
    async fn query(&self, query: &str, _params: &Params) -> Result<Vec<Record>> {
        let manager = self.manager("query")?;
        let records = self
            .core
            .timed("query", async {
                let pattern = wildcard_regex(query)?;
                let records: Vec<Record> = manager
                    .keys_matching(&pattern)
                    .into_iter()
                    .filter_map(|key| {
                        let value = manager.entries.get(&manager.full_key(&key))?;
                        Some(match value {
                            Value::Map(record) => record,
                            other => Record::from([
                                ("key".to_string(), Value::String(key)),
                                ("value".to_string(), other),
                            ]),
                        })
                    })
                    .collect();
                Ok::<_, DataSourceError>(records)
            })
            .await?;
        self.core
            .metrics()
            .record_records_processed(records.len() as u64);
        Ok(records)
    }

    /// Applies `key=value` entries; malformed entries are skipped with a
    /// warning and count as 0.
    async fn batch_update(&self, statements: &[String]) -> Result<Vec<u64>> {
        let manager = self.manager("batch_update")?;
        let counts = statements
            .iter()
            .map(|statement| match statement.split_once('=') {
                Some((key, value)) => {
                    manager
                        .entries
                        .put(manager.full_key(key.trim()), Value::from(value.trim()));
                    1
                }
                None => {
                    tracing::warn!(source = %self.core.name(), update = %statement, "invalid cache update format");
                    0
                }
            })
            .collect();
        Ok(counts)
    }

    async fn refresh(&self) -> Result<()> {
        let manager = self.manager("refresh")?;
        let evicted = manager.entries.evict_expired();
        tracing::info!(source = %self.core.name(), evicted, "cache data source refreshed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use apex_data_core::ErrorKind;

    use super::*;

    fn config(source_type: Option<&str>) -> DataSourceConfiguration {
        DataSourceConfiguration {
            source_type: source_type.map(str::to_string),
            cache: Some(CacheConfig {
                enabled: true,
                ttl_seconds: 60,
                key_prefix: Some("ref:".into()),
                ..CacheConfig::default()
            }),
            ..DataSourceConfiguration::new("lookup-cache", DataSourceType::Cache)
        }
    }

    async fn adapter() -> CacheDataSource {
        let ds = CacheDataSource::new();
        ds.initialize(&config(None)).await.unwrap();
        ds
    }

    #[test]
    fn wildcard_patterns() {
        let re = wildcard_regex("user:*").unwrap();
        assert!(re.is_match("user:1"));
        assert!(re.is_match("user:"));
        assert!(!re.is_match("users:1"));
        let re = wildcard_regex("a?c.d").unwrap();
        assert!(re.is_match("abc.d"));
        assert!(!re.is_match("abcxd"));
    }

    #[tokio::test]
    async fn put_get_remove() {
        let ds = adapter().await;
        ds.put("currency:USD", "US Dollar").unwrap();
        assert_eq!(ds.get("currency:USD").unwrap(), Some(Value::from("US Dollar")));
        assert!(ds.contains_key("currency:USD"));
        assert!(ds.remove("currency:USD").unwrap());
        assert!(!ds.remove("currency:USD").unwrap());
        assert_eq!(ds.get("currency:USD").unwrap(), None);
        assert_eq!(ds.size(), 0);
    }

    #[tokio::test]
    async fn health_check_leaves_counters_alone() {
        let ds = adapter().await;
        assert!(ds.is_healthy().await);
        assert!(ds.test_connection().await);
        assert_eq!(ds.metrics().cache_hits(), 0);
        assert_eq!(ds.metrics().cache_misses(), 0);
        assert_eq!(ds.size(), 0);
    }

    #[tokio::test]
    async fn queries_match_key_patterns() {
        let ds = adapter().await;
        let counts = ds
            .batch_update(&[
                "user:1=ada".to_string(),
                "user:2 = grace".to_string(),
                "order:1=book".to_string(),
                "malformed".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(counts, vec![1, 1, 1, 0]);

        let users = ds.query("user:*", &Params::new()).await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0]["key"], Value::from("user:1"));
        assert_eq!(users[1]["value"], Value::from("grace"));
        assert_eq!(ds.keys_by_pattern("order:?").unwrap(), vec!["order:1".to_string()]);
        assert!(ds.query("none*", &Params::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_data_counts_hits_and_misses() {
        let ds = adapter().await;
        ds.put("rate:EUR", 1.1).unwrap();
        assert_eq!(ds.get_data("rate", &[Value::from("EUR")]).await.unwrap(), Some(Value::Float(1.1)));
        assert_eq!(ds.get_data("rate", &[Value::from("GBP")]).await.unwrap(), None);
        assert_eq!(ds.metrics().cache_hits(), 1);
        assert_eq!(ds.metrics().cache_misses(), 1);
        let stats = ds.statistics().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_evicts_expired_entries() {
        let ds = adapter().await;
        ds.put_with_ttl("short", "x", Duration::from_secs(1)).unwrap();
        ds.put("long", "y").unwrap();
        tokio::time::advance(Duration::from_millis(1100)).await;
        ds.refresh().await.unwrap();
        assert_eq!(ds.size(), 1);
        assert_eq!(ds.metrics().cache_evictions(), 1);
    }

    #[tokio::test]
    async fn distributed_backends_fall_back_and_unknown_ones_fail() {
        let ds = CacheDataSource::new();
        ds.initialize(&config(Some("redis"))).await.unwrap();
        assert!(ds.is_healthy().await);

        let ds = CacheDataSource::new();
        let err = ds.initialize(&config(Some("memcached"))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.message(), "Unsupported cache type: memcached");
    }

    #[tokio::test]
    async fn shutdown_rejects_further_calls() {
        let ds = adapter().await;
        ds.shutdown().await.unwrap();
        ds.shutdown().await.unwrap();
        assert!(!ds.is_healthy().await);
        let err = ds.put("k", "v").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
