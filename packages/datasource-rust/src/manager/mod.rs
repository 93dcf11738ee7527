//! Single entry point over every configured data source.
//!
//! [`DataSourceManager`] owns a [`DataSourceRegistry`] and a
//! [`DataSourceFactory`], keeps a per-type index ("type groups") used for
//! round-robin load balancing and failover, runs the periodic metrics sweep,
//! and dispatches async queries through a tower pipeline.

pub mod config;
pub mod events;
pub mod lifecycle;
pub mod middleware;
pub mod pipeline;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use apex_data_core::clock::now_millis;
use apex_data_core::{
    DataSourceConfiguration, DataSourceError, DataSourceType, Params, QueryContext, Record,
    Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tower::ServiceExt;
use tracing::Instrument;

pub use config::ManagerConfig;
pub use events::{ManagerEvent, ManagerListener, ManagerStatistics};
pub use lifecycle::LifecycleState;
pub use pipeline::{build_query_pipeline, AsyncQuery, QueryHandle, QueryPipeline, QueryService};

use self::lifecycle::Lifecycle;
use crate::factory::DataSourceFactory;
use crate::registry::{DataSourceRegistry, RegistryEvent, RegistryListener};
use crate::traits::ExternalDataSource;
use crate::worker::{BackgroundRunnable, BackgroundWorker, WorkerSchedule};

/// Coordinates adapters: creation, lookup, load balancing, failover, async
/// queries and shutdown.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct DataSourceManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    factory: DataSourceFactory,
    registry: Arc<DataSourceRegistry>,
    type_groups: RwLock<BTreeMap<DataSourceType, Vec<String>>>,
    cursors: DashMap<DataSourceType, AtomicUsize>,
    listeners: RwLock<Vec<Arc<dyn ManagerListener>>>,
    lifecycle: Lifecycle,
    pipeline: QueryPipeline,
    sweep: tokio::sync::Mutex<Option<BackgroundWorker<MetricsSweep>>>,
}

impl Default for DataSourceManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl DataSourceManager {
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_factory(config, DataSourceFactory::new())
    }

    #[must_use]
    pub fn with_factory(config: ManagerConfig, factory: DataSourceFactory) -> Self {
        let pipeline = build_query_pipeline(config.max_concurrent_queries);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                factory,
                registry: Arc::new(DataSourceRegistry::new()),
                type_groups: RwLock::new(BTreeMap::new()),
                cursors: DashMap::new(),
                listeners: RwLock::new(Vec::new()),
                lifecycle: Lifecycle::new(),
                pipeline,
                sweep: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Factory used for every configuration; register custom providers here
    /// before calling [`initialize`](Self::initialize).
    #[must_use]
    pub fn factory(&self) -> &DataSourceFactory {
        &self.inner.factory
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Creates and registers one adapter per enabled configuration, then
    /// starts the health monitor and the metrics sweep.
    ///
    /// All or nothing: if any adapter fails to build, everything built so
    /// far is shut down and the manager stays stopped.
    ///
    /// # Errors
    ///
    /// `CONFIGURATION_ERROR` if the manager is already running, or wrapping
    /// the first creation failure.
    pub async fn initialize(&self, configs: &[DataSourceConfiguration]) -> Result<()> {
        let inner = &self.inner;
        if !inner.lifecycle.try_start() {
            return Err(
                DataSourceError::configuration("DataSourceManager is already initialized")
                    .with_operation("initialize"),
            );
        }
        tracing::info!(configs = configs.len(), "initializing data source manager");

        let bridge: Arc<dyn RegistryListener> = Arc::new(RegistryBridge {
            manager: Arc::downgrade(inner),
        });
        inner.registry.add_listener(bridge);

        if let Err(err) = self.register_all(configs).await {
            tracing::error!(error = %err, "data source manager initialization failed; rolling back");
            inner.registry.shutdown().await;
            inner.clear_indexes();
            inner.lifecycle.set_stopped();
            return Err(DataSourceError::configuration(format!(
                "Failed to initialize data source manager: {}",
                err.message()
            ))
            .with_operation("initialize")
            .with_cause(err));
        }

        inner
            .registry
            .start_health_monitor(inner.config.health_check_interval)
            .await;
        *inner.sweep.lock().await = Some(BackgroundWorker::start(
            "manager-metrics-sweep",
            MetricsSweep {
                manager: Arc::downgrade(inner),
            },
            WorkerSchedule::every(inner.config.metrics_interval),
        ));

        let count = inner.registry.size();
        tracing::info!(count, "data source manager initialized");
        inner.emit(&ManagerEvent::Initialized { count });
        Ok(())
    }

    async fn register_all(&self, configs: &[DataSourceConfiguration]) -> Result<()> {
        let enabled: Vec<DataSourceConfiguration> =
            configs.iter().filter(|c| c.enabled).cloned().collect();
        let skipped = configs.len() - enabled.len();
        if skipped > 0 {
            tracing::info!(skipped, "skipping disabled data source configurations");
        }

        let built = self.inner.factory.create_data_sources(&enabled).await?;
        let mut pending = built.into_iter();
        while let Some(source) = pending.next() {
            if let Err(err) = self.inner.registry.register(source).await {
                for rest in pending {
                    if let Err(e) = rest.shutdown().await {
                        tracing::warn!(source = %rest.name(), error = %e, "shutdown during rollback failed");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stops background tasks, drains async queries, and shuts down every
    /// adapter. Adapter shutdown errors are logged, never returned. Calling
    /// it again is a no-op.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.lifecycle.begin_stop() {
            tracing::debug!(
                state = ?inner.lifecycle.state(),
                "data source manager not running; shutdown skipped"
            );
            return;
        }
        tracing::info!("shutting down data source manager");

        let sweep = inner.sweep.lock().await.take();
        if let Some(mut sweep) = sweep {
            if !sweep.stop(inner.config.task_stop_grace).await {
                tracing::warn!("metrics sweep did not stop in time");
            }
        }

        let in_flight = inner.lifecycle.in_flight_count();
        if in_flight > 0 {
            tracing::info!(in_flight, "waiting for async queries");
        }
        inner.lifecycle.drain(inner.config.query_drain_timeout).await;

        inner.registry.shutdown().await;
        inner.factory.clear_cache().await;
        inner.clear_indexes();
        inner.lifecycle.set_stopped();
        tracing::info!("data source manager shut down");
    }

    // -- membership ---------------------------------------------------------

    /// Builds, initializes and registers one adapter.
    ///
    /// # Errors
    ///
    /// `CONFIGURATION_ERROR` when the manager is not running; otherwise
    /// whatever creation raises.
    pub async fn add_data_source(
        &self,
        config: &DataSourceConfiguration,
    ) -> Result<Arc<dyn ExternalDataSource>> {
        self.ensure_running("add_data_source")?;
        let source = self.inner.factory.create_data_source(config).await?;
        self.inner.registry.register(Arc::clone(&source)).await?;
        Ok(source)
    }

    /// Registers an adapter that was built elsewhere.
    ///
    /// # Errors
    ///
    /// `CONFIGURATION_ERROR` when the manager is not running or the adapter's
    /// name is blank.
    pub async fn register_data_source(&self, source: Arc<dyn ExternalDataSource>) -> Result<()> {
        self.ensure_running("register_data_source")?;
        self.inner.registry.register(source).await
    }

    /// Unregisters and shuts down `name`. Returns `false` when the manager is
    /// stopped or nothing was registered under that name.
    pub async fn remove_data_source(&self, name: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        self.inner.registry.unregister(name).await
    }

    fn ensure_running(&self, operation: &str) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        Err(
            DataSourceError::configuration("DataSourceManager is not running")
                .with_operation(operation),
        )
    }

    // -- lookup -------------------------------------------------------------

    #[must_use]
    pub fn get_data_source(&self, name: &str) -> Option<Arc<dyn ExternalDataSource>> {
        self.inner.registry.get(name)
    }

    /// Members of the type group, in group order.
    #[must_use]
    pub fn get_data_sources_by_type(
        &self,
        source_type: DataSourceType,
    ) -> Vec<Arc<dyn ExternalDataSource>> {
        self.inner
            .group(source_type)
            .iter()
            .filter_map(|name| self.inner.registry.get(name))
            .collect()
    }

    #[must_use]
    pub fn get_all_data_source_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Round-robin pick within the type group. An unhealthy pick is skipped
    /// in favor of the next healthy member in rotation order. Returns `None`
    /// when the group is empty or nobody in it is healthy.
    pub async fn get_data_source_with_load_balancing(
        &self,
        source_type: DataSourceType,
    ) -> Option<Arc<dyn ExternalDataSource>> {
        let group = self.inner.group(source_type);
        if group.is_empty() {
            return None;
        }
        let start = self
            .inner
            .cursors
            .entry(source_type)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);

        for offset in 0..group.len() {
            let name = &group[(start + offset) % group.len()];
            let Some(source) = self.inner.registry.get(name) else {
                continue;
            };
            if source.is_healthy().await {
                if offset > 0 {
                    tracing::debug!(
                        skipped = offset,
                        source = %name,
                        "load balancer skipped unhealthy data sources"
                    );
                }
                return Some(source);
            }
        }
        tracing::warn!(source_type = %source_type, "no healthy data source for load balancing");
        None
    }

    // -- queries ------------------------------------------------------------

    /// Runs `query` on each healthy member of the type group in order and
    /// returns the first success.
    ///
    /// # Errors
    ///
    /// `CONNECTION_ERROR` when the group has no healthy member;
    /// `EXECUTION_ERROR` wrapping the last failure when every member fails.
    pub async fn query_with_failover(
        &self,
        source_type: DataSourceType,
        query: &str,
        params: &Params,
    ) -> Result<Vec<Record>> {
        let context = QueryContext::new(source_type.config_value(), "query_with_failover");
        let mut candidates = Vec::new();
        for source in self.get_data_sources_by_type(source_type) {
            if source.is_healthy().await {
                candidates.push(source);
            }
        }
        if candidates.is_empty() {
            return Err(DataSourceError::connection(format!(
                "No healthy data sources available for type: {source_type}"
            ))
            .with_operation("query_with_failover"));
        }

        let mut last_error = None;
        for source in candidates {
            let attempt = context.for_source(source.name());
            match source.query(query, params).instrument(attempt.span()).await {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    tracing::warn!(
                        source = %attempt.source_name,
                        correlation_id = %context.correlation_id,
                        error = %err,
                        "query failed; trying next data source"
                    );
                    last_error = Some(err);
                }
            }
        }

        let aggregate = DataSourceError::execution(format!(
            "All data sources failed for type: {source_type}"
        ))
        .with_operation("query_with_failover");
        Err(match last_error {
            Some(cause) => aggregate.with_cause(cause),
            None => aggregate,
        })
    }

    /// Dispatches `query` against `name` onto the async-query pipeline.
    ///
    /// The returned handle resolves to the rows, or to `TIMEOUT_ERROR` after
    /// [`ManagerConfig::query_timeout`], or to a retryable `EXECUTION_ERROR`
    /// when too many queries are already in flight.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND_ERROR` for an unknown name; `CONFIGURATION_ERROR` when the
    /// manager is not running.
    pub fn query_async(&self, name: &str, query: &str, params: &Params) -> Result<QueryHandle> {
        self.ensure_running("query_async")?;
        let Some(source) = self.inner.registry.get(name) else {
            return Err(DataSourceError::not_found(format!("Data source not found: {name}"))
                .in_context(name, "query_async"));
        };

        let request = AsyncQuery {
            source,
            query: query.to_string(),
            params: params.clone(),
            timeout: self.inner.config.query_timeout,
            context: QueryContext::new(name, "query_async"),
        };
        let guard = self.inner.lifecycle.in_flight_guard();
        let id = guard.id();
        let pipeline = self.inner.pipeline.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            pipeline.oneshot(request).await
        });
        self.inner.lifecycle.track(id, &task);
        Ok(QueryHandle::new(name, task))
    }

    // -- maintenance --------------------------------------------------------

    /// Refreshes every adapter. Failures are returned keyed by name.
    pub async fn refresh_all(&self) -> BTreeMap<String, DataSourceError> {
        let failures = self.inner.registry.refresh_all().await;
        self.inner.emit(&ManagerEvent::RefreshCompleted {
            failures: failures.len(),
        });
        failures
    }

    pub async fn get_statistics(&self) -> ManagerStatistics {
        let registry = self.inner.registry.statistics().await;
        let metrics = self
            .inner
            .registry
            .names()
            .into_iter()
            .filter_map(|name| {
                let source = self.inner.registry.get(&name)?;
                Some((name, source.metrics().snapshot()))
            })
            .collect();
        ManagerStatistics {
            registry,
            metrics,
            type_groups: self.inner.type_groups.read().len(),
            running: self.is_running(),
            timestamp: now_millis(),
        }
    }

    // -- listeners ----------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn ManagerListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Removes `listener` by identity. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ManagerListener>) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }
}

impl ManagerInner {
    fn group(&self, source_type: DataSourceType) -> Vec<String> {
        self.type_groups
            .read()
            .get(&source_type)
            .cloned()
            .unwrap_or_default()
    }

    fn rebuild_type_groups(&self) {
        let groups: BTreeMap<DataSourceType, Vec<String>> = DataSourceType::ALL
            .iter()
            .filter_map(|&kind| {
                let names = self.registry.names_by_type(kind);
                (!names.is_empty()).then_some((kind, names))
            })
            .collect();
        tracing::trace!(groups = groups.len(), "rebuilt type groups");
        *self.type_groups.write() = groups;
    }

    fn clear_indexes(&self) {
        self.type_groups.write().clear();
        self.cursors.clear();
    }

    /// Delivers `event` to every listener. A panicking listener is logged
    /// and skipped.
    fn emit(&self, event: &ManagerEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let delivered =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if delivered.is_err() {
                tracing::error!(event = ?event, "manager listener panicked");
            }
        }
    }

    /// Publishes per-source gauges. Returns how many sources were published.
    async fn publish_metrics(&self) -> usize {
        let mut published = 0;
        for name in self.registry.names() {
            let Some(source) = self.registry.get(&name) else {
                continue;
            };
            let snapshot = source.metrics().snapshot();
            let healthy = source.is_healthy().await;
            let kind = source.source_type().config_value();

            #[allow(clippy::cast_precision_loss)]
            let total = snapshot.total_requests as f64;
            metrics::gauge!("datasource_requests_total", "source" => name.clone(), "type" => kind)
                .set(total);
            metrics::gauge!("datasource_success_rate", "source" => name.clone(), "type" => kind)
                .set(snapshot.success_rate);
            metrics::gauge!("datasource_avg_response_ms", "source" => name.clone(), "type" => kind)
                .set(snapshot.average_response_time);
            metrics::gauge!("datasource_cache_hit_rate", "source" => name.clone(), "type" => kind)
                .set(snapshot.cache_hit_rate);
            metrics::gauge!("datasource_healthy", "source" => name.clone(), "type" => kind)
                .set(if healthy { 1.0 } else { 0.0 });

            tracing::trace!(
                source = %name,
                requests = snapshot.total_requests,
                success_rate = snapshot.success_rate,
                avg_response_ms = snapshot.average_response_time,
                healthy,
                "collected data source metrics"
            );
            published += 1;
        }
        tracing::debug!(sources = published, "metrics sweep complete");
        published
    }
}

// ---------------------------------------------------------------------------
// Background plumbing
// ---------------------------------------------------------------------------

/// Forwards registry events to manager listeners and keeps the type groups
/// in step with registrations.
struct RegistryBridge {
    manager: Weak<ManagerInner>,
}

impl RegistryListener for RegistryBridge {
    fn on_event(&self, event: &RegistryEvent) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        manager.rebuild_type_groups();
        manager.emit(&ManagerEvent::from(event));
    }
}

struct MetricsSweep {
    manager: Weak<ManagerInner>,
}

#[async_trait]
impl BackgroundRunnable for MetricsSweep {
    type Task = ();

    async fn run(&mut self, (): ()) {
        self.on_tick().await;
    }

    async fn on_tick(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.publish_metrics().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
