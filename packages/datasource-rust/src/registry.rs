//! Name-keyed registry of live adapters with type and tag indexes, health
//! tracking and listener fan-out.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use apex_data_core::clock::now_millis;
use apex_data_core::{DataSourceError, DataSourceType, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::traits::ExternalDataSource;
use crate::worker::{BackgroundRunnable, BackgroundWorker, WorkerSchedule};

/// Default period of the health monitor.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

const MONITOR_STOP_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Events and listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryEventType {
    Registered,
    Unregistered,
    HealthRestored,
    HealthLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEvent {
    pub event_type: RegistryEventType,
    pub name: String,
    pub source_type: DataSourceType,
    pub timestamp: u64,
}

impl RegistryEvent {
    fn new(event_type: RegistryEventType, source: &dyn ExternalDataSource) -> Self {
        Self {
            event_type,
            name: source.name(),
            source_type: source.source_type(),
            timestamp: now_millis(),
        }
    }
}

/// Receives registry events synchronously, on the task that caused them.
pub trait RegistryListener: Send + Sync {
    fn on_event(&self, event: &RegistryEvent);
}

impl<F> RegistryListener for F
where
    F: Fn(&RegistryEvent) + Send + Sync,
{
    fn on_event(&self, event: &RegistryEvent) {
        self(event);
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub by_type: BTreeMap<DataSourceType, usize>,
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// DataSourceRegistry
// ---------------------------------------------------------------------------

struct Registration {
    source: Arc<dyn ExternalDataSource>,
    tags: BTreeSet<String>,
    /// Health as of the last check; starts optimistic.
    healthy: AtomicBool,
}

/// Registry of adapters keyed by name.
///
/// A name maps to at most one adapter. Registering an existing name first
/// unregisters (and shuts down) the previous adapter. Register and unregister
/// are serialized; lookups are lock-free reads of the concurrent maps.
pub struct DataSourceRegistry {
    entries: DashMap<String, Arc<Registration>>,
    by_type: DashMap<DataSourceType, BTreeSet<String>>,
    by_tag: DashMap<String, BTreeSet<String>>,
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
    writes: tokio::sync::Mutex<()>,
    monitor: tokio::sync::Mutex<Option<BackgroundWorker<HealthMonitor>>>,
}

impl Default for DataSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_type: DashMap::new(),
            by_tag: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            writes: tokio::sync::Mutex::new(()),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Registers `source` under its configured name, replacing any adapter
    /// already registered under that name.
    ///
    /// # Errors
    ///
    /// Returns `CONFIGURATION_ERROR` if the adapter's name is blank.
    pub async fn register(&self, source: Arc<dyn ExternalDataSource>) -> Result<()> {
        let name = source.name();
        if name.trim().is_empty() {
            return Err(DataSourceError::configuration(
                "Data source name cannot be null or empty",
            )
            .with_operation("register"));
        }

        let _guard = self.writes.lock().await;
        if self.entries.contains_key(&name) {
            tracing::info!(source = %name, "replacing registered data source");
            self.remove_entry(&name).await;
        }

        let tags = tags_of(source.as_ref());
        let source_type = source.source_type();
        self.by_type
            .entry(source_type)
            .or_default()
            .insert(name.clone());
        for tag in &tags {
            self.by_tag.entry(tag.clone()).or_default().insert(name.clone());
        }
        let event = RegistryEvent::new(RegistryEventType::Registered, source.as_ref());
        self.entries.insert(
            name.clone(),
            Arc::new(Registration {
                source,
                tags,
                healthy: AtomicBool::new(true),
            }),
        );
        tracing::info!(source = %name, source_type = %source_type, "registered data source");
        self.notify(&event);
        Ok(())
    }

    /// Removes and shuts down the adapter registered under `name`.
    /// Returns `false` if nothing was registered.
    pub async fn unregister(&self, name: &str) -> bool {
        if name.trim().is_empty() {
            return false;
        }
        let _guard = self.writes.lock().await;
        self.remove_entry(name).await
    }

    async fn remove_entry(&self, name: &str) -> bool {
        let Some((_, registration)) = self.entries.remove(name) else {
            return false;
        };
        let source_type = registration.source.source_type();
        remove_from_index(&self.by_type, &source_type, name);
        for tag in &registration.tags {
            remove_from_index(&self.by_tag, tag, name);
        }
        if let Err(err) = registration.source.shutdown().await {
            tracing::warn!(source = %name, error = %err, "error shutting down data source");
        }
        tracing::info!(source = %name, "unregistered data source");
        self.notify(&RegistryEvent::new(
            RegistryEventType::Unregistered,
            registration.source.as_ref(),
        ));
        true
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ExternalDataSource>> {
        self.entries.get(name).map(|e| Arc::clone(&e.source))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names registered under `source_type`, sorted.
    #[must_use]
    pub fn names_by_type(&self, source_type: DataSourceType) -> Vec<String> {
        self.by_type
            .get(&source_type)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_by_type(&self, source_type: DataSourceType) -> Vec<Arc<dyn ExternalDataSource>> {
        self.resolve(self.names_by_type(source_type))
    }

    /// Adapters carrying `tag` (case-insensitive).
    #[must_use]
    pub fn get_by_tag(&self, tag: &str) -> Vec<Arc<dyn ExternalDataSource>> {
        let names = self
            .by_tag
            .get(&tag.to_ascii_lowercase())
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default();
        self.resolve(names)
    }

    fn resolve(&self, names: Vec<String>) -> Vec<Arc<dyn ExternalDataSource>> {
        names.into_iter().filter_map(|n| self.get(&n)).collect()
    }

    fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Polls every adapter's `is_healthy` and returns those that pass.
    pub async fn get_healthy(&self) -> Vec<Arc<dyn ExternalDataSource>> {
        self.partition_by_health().await.0
    }

    /// Polls every adapter's `is_healthy` and returns those that fail.
    pub async fn get_unhealthy(&self) -> Vec<Arc<dyn ExternalDataSource>> {
        self.partition_by_health().await.1
    }

    async fn partition_by_health(
        &self,
    ) -> (Vec<Arc<dyn ExternalDataSource>>, Vec<Arc<dyn ExternalDataSource>>) {
        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for registration in self.snapshot() {
            let source = Arc::clone(&registration.source);
            if source.is_healthy().await {
                healthy.push(source);
            } else {
                unhealthy.push(source);
            }
        }
        (healthy, unhealthy)
    }

    /// Re-checks every adapter and emits `HEALTH_RESTORED`/`HEALTH_LOST` for
    /// each one whose health changed since the last check. Returns the
    /// number of transitions.
    pub async fn check_health(&self) -> usize {
        let mut transitions = 0;
        for registration in self.snapshot() {
            let now_healthy = registration.source.is_healthy().await;
            let was_healthy = registration.healthy.swap(now_healthy, Ordering::SeqCst);
            if was_healthy == now_healthy {
                continue;
            }
            transitions += 1;
            let event_type = if now_healthy {
                tracing::info!(source = %registration.source.name(), "data source health restored");
                RegistryEventType::HealthRestored
            } else {
                tracing::warn!(source = %registration.source.name(), "data source health lost");
                RegistryEventType::HealthLost
            };
            self.notify(&RegistryEvent::new(event_type, registration.source.as_ref()));
        }
        transitions
    }

    /// Refreshes every adapter, returning the failures keyed by name.
    pub async fn refresh_all(&self) -> BTreeMap<String, DataSourceError> {
        let mut failures = BTreeMap::new();
        for registration in self.snapshot() {
            let name = registration.source.name();
            if let Err(err) = registration.source.refresh().await {
                tracing::error!(source = %name, error = %err, "failed to refresh data source");
                failures.insert(name, err);
            }
        }
        tracing::info!(total = self.size(), failed = failures.len(), "refreshed data sources");
        failures
    }

    pub async fn statistics(&self) -> RegistryStatistics {
        let mut by_type = BTreeMap::new();
        let mut healthy = 0;
        let registrations = self.snapshot();
        for registration in &registrations {
            *by_type.entry(registration.source.source_type()).or_insert(0) += 1;
            if registration.source.is_healthy().await {
                healthy += 1;
            }
        }
        RegistryStatistics {
            total: registrations.len(),
            healthy,
            unhealthy: registrations.len() - healthy,
            by_type,
            timestamp: now_millis(),
        }
    }

    // -- listeners ----------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes `listener` by identity. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn RegistryListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Delivers `event` to every listener. A panicking listener is logged
    /// and skipped.
    fn notify(&self, event: &RegistryEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let delivered =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if delivered.is_err() {
                tracing::error!(
                    event = ?event.event_type,
                    source = %event.name,
                    "registry listener panicked"
                );
            }
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Starts the periodic health monitor. A running monitor is left alone.
    pub async fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(BackgroundWorker::is_running) {
            return;
        }
        *monitor = Some(BackgroundWorker::start(
            "registry-health-monitor",
            HealthMonitor {
                registry: Arc::downgrade(self),
            },
            WorkerSchedule::every(interval),
        ));
        tracing::debug!(interval_ms = interval.as_millis(), "registry health monitor started");
    }

    pub async fn stop_health_monitor(&self) {
        let worker = self.monitor.lock().await.take();
        if let Some(mut worker) = worker {
            worker.stop(MONITOR_STOP_GRACE).await;
        }
    }

    /// Stops the monitor, unregisters (and shuts down) every adapter and
    /// drops all listeners.
    pub async fn shutdown(&self) {
        self.stop_health_monitor().await;
        let names = self.names();
        tracing::info!(count = names.len(), "shutting down data source registry");
        {
            let _guard = self.writes.lock().await;
            for name in &names {
                self.remove_entry(name).await;
            }
            self.entries.clear();
            self.by_type.clear();
            self.by_tag.clear();
        }
        self.listeners.write().clear();
    }
}

fn tags_of(source: &dyn ExternalDataSource) -> BTreeSet<String> {
    let config = source.configuration();
    let mut tags = BTreeSet::from([source.source_type().config_value().to_string()]);
    tags.extend(config.data_type.iter().map(|t| t.to_ascii_lowercase()));
    tags.extend(config.tags.iter().map(|t| t.to_ascii_lowercase()));
    tags
}

fn remove_from_index<K>(index: &DashMap<K, BTreeSet<String>>, key: &K, name: &str)
where
    K: Eq + std::hash::Hash,
{
    if let Some(mut names) = index.get_mut(key) {
        names.remove(name);
    }
    index.remove_if(key, |_, names| names.is_empty());
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

struct HealthMonitor {
    registry: Weak<DataSourceRegistry>,
}

#[async_trait]
impl BackgroundRunnable for HealthMonitor {
    type Task = ();

    async fn run(&mut self, (): ()) {
        self.on_tick().await;
    }

    async fn on_tick(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let transitions = registry.check_health().await;
            tracing::trace!(transitions, "registry health check complete");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use apex_data_core::{DataSourceConfiguration, ErrorKind};
    use parking_lot::Mutex;

    use super::*;
    use crate::testing::StubDataSource;

    fn recorder(registry: &DataSourceRegistry) -> Arc<Mutex<Vec<(RegistryEventType, String)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        registry.add_listener(Arc::new(move |e: &RegistryEvent| {
            sink.lock().push((e.event_type, e.name.clone()));
        }));
        events
    }

    #[tokio::test]
    async fn register_indexes_by_type_and_tag() {
        let registry = DataSourceRegistry::new();
        let mut config = DataSourceConfiguration::new("orders-db", DataSourceType::Database);
        config.tags = vec!["Primary".into()];
        config.data_type = Some("orders".into());
        registry
            .register(Arc::new(StubDataSource::with_config(config)))
            .await
            .unwrap();
        registry
            .register(Arc::new(StubDataSource::new("users-api", DataSourceType::RestApi)))
            .await
            .unwrap();

        assert_eq!(registry.size(), 2);
        assert_eq!(registry.names_by_type(DataSourceType::Database), vec!["orders-db"]);
        assert!(registry.get_by_type(DataSourceType::Cache).is_empty());
        assert_eq!(registry.get_by_tag("primary").len(), 1);
        assert_eq!(registry.get_by_tag("ORDERS").len(), 1);
        assert_eq!(registry.get_by_tag("rest-api").len(), 1);
        assert_eq!(registry.names(), vec!["orders-db", "users-api"]);
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let registry = DataSourceRegistry::new();
        let err = registry
            .register(Arc::new(StubDataSource::new("  ", DataSourceType::Cache)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn re_register_replaces_and_shuts_down_previous() {
        let registry = DataSourceRegistry::new();
        let events = recorder(&registry);
        let first = Arc::new(StubDataSource::new("db", DataSourceType::Database));
        let second = Arc::new(StubDataSource::new("db", DataSourceType::Cache));
        registry.register(first.clone()).await.unwrap();
        registry.register(second.clone()).await.unwrap();

        assert_eq!(registry.size(), 1);
        assert_eq!(first.shutdown_count(), 1);
        assert_eq!(second.shutdown_count(), 0);
        assert!(registry.names_by_type(DataSourceType::Database).is_empty());
        assert_eq!(registry.names_by_type(DataSourceType::Cache), vec!["db"]);
        assert_eq!(
            *events.lock(),
            vec![
                (RegistryEventType::Registered, "db".to_string()),
                (RegistryEventType::Unregistered, "db".to_string()),
                (RegistryEventType::Registered, "db".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn unregister_shuts_down_even_when_shutdown_fails() {
        let registry = DataSourceRegistry::new();
        let stub = Arc::new(StubDataSource::new("q", DataSourceType::MessageQueue));
        stub.fail_on_shutdown();
        registry.register(stub.clone()).await.unwrap();
        assert!(registry.unregister("q").await);
        assert!(!registry.unregister("q").await);
        assert_eq!(stub.shutdown_count(), 1);
        assert!(!registry.contains("q"));
    }

    #[tokio::test]
    async fn health_transitions_are_reported_once() {
        let registry = DataSourceRegistry::new();
        let events = recorder(&registry);
        let stub = Arc::new(StubDataSource::new("cache", DataSourceType::Cache));
        registry.register(stub.clone()).await.unwrap();

        assert_eq!(registry.check_health().await, 0);
        stub.set_healthy(false);
        assert_eq!(registry.get_unhealthy().await.len(), 1);
        assert_eq!(registry.check_health().await, 1);
        assert_eq!(registry.check_health().await, 0);
        stub.set_healthy(true);
        assert_eq!(registry.get_healthy().await.len(), 1);
        assert_eq!(registry.check_health().await, 1);

        let kinds: Vec<_> = events.lock().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                RegistryEventType::Registered,
                RegistryEventType::HealthLost,
                RegistryEventType::HealthRestored,
            ]
        );
    }

    struct PanickingListener;

    impl RegistryListener for PanickingListener {
        fn on_event(&self, _event: &RegistryEvent) {
            panic!("listener bug");
        }
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_mutation() {
        let registry = DataSourceRegistry::new();
        registry.add_listener(Arc::new(PanickingListener));
        let events = recorder(&registry);
        registry
            .register(Arc::new(StubDataSource::new("a", DataSourceType::Cache)))
            .await
            .unwrap();
        assert!(registry.contains("a"));
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test]
    async fn listeners_can_be_removed() {
        let registry = DataSourceRegistry::new();
        let listener: Arc<dyn RegistryListener> = Arc::new(|_: &RegistryEvent| {});
        registry.add_listener(Arc::clone(&listener));
        assert!(registry.remove_listener(&listener));
        assert!(!registry.remove_listener(&listener));
    }

    #[tokio::test]
    async fn refresh_all_collects_failures() {
        let registry = DataSourceRegistry::new();
        let ok = Arc::new(StubDataSource::new("ok", DataSourceType::Cache));
        let bad = Arc::new(StubDataSource::new("bad", DataSourceType::Cache));
        bad.fail_with(ErrorKind::Connection);
        registry.register(ok.clone()).await.unwrap();
        registry.register(bad.clone()).await.unwrap();

        let failures = registry.refresh_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures["bad"].kind(), ErrorKind::Connection);
        assert_eq!(ok.refresh_count(), 1);
    }

    #[tokio::test]
    async fn statistics_count_health_and_types() {
        let registry = DataSourceRegistry::new();
        let down = Arc::new(StubDataSource::new("b", DataSourceType::Database));
        down.set_healthy(false);
        registry
            .register(Arc::new(StubDataSource::new("a", DataSourceType::Database)))
            .await
            .unwrap();
        registry.register(down).await.unwrap();

        let stats = registry.statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.by_type[&DataSourceType::Database], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_emits_health_events() {
        let registry = Arc::new(DataSourceRegistry::new());
        let events = recorder(&registry);
        let stub = Arc::new(StubDataSource::new("svc", DataSourceType::RestApi));
        registry.register(stub.clone()).await.unwrap();
        registry
            .start_health_monitor(Duration::from_secs(30))
            .await;

        stub.set_healthy(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(events
            .lock()
            .contains(&(RegistryEventType::HealthLost, "svc".to_string())));

        registry.shutdown().await;
        assert_eq!(registry.size(), 0);
        assert_eq!(stub.shutdown_count(), 1);
    }
}
