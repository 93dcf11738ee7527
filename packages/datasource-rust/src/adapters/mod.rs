//! Backend adapters implementing [`ExternalDataSource`](crate::traits::ExternalDataSource).

pub mod cache;
pub mod database;
pub mod file_system;
pub mod message_queue;
pub mod rest;

use std::future::Future;
use std::sync::Arc;

use apex_data_core::{
    ConnectionState, ConnectionStatus, DataSourceConfiguration, DataSourceError,
    DataSourceMetrics, Result,
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::time::Instant;

pub use cache::CacheDataSource;
pub use database::DatabaseDataSource;
pub use file_system::FileSystemDataSource;
pub use message_queue::MessageQueueDataSource;
pub use rest::RestApiDataSource;

/// State every adapter carries: its configuration, counters and status.
pub(crate) struct AdapterCore {
    config: ArcSwap<DataSourceConfiguration>,
    metrics: Arc<DataSourceMetrics>,
    status: Mutex<ConnectionStatus>,
}

impl AdapterCore {
    pub(crate) fn new() -> Self {
        Self {
            config: ArcSwap::from_pointee(DataSourceConfiguration::default()),
            metrics: Arc::new(DataSourceMetrics::new()),
            status: Mutex::new(ConnectionStatus::not_initialized()),
        }
    }

    pub(crate) fn config(&self) -> Arc<DataSourceConfiguration> {
        self.config.load_full()
    }

    pub(crate) fn set_config(&self, config: &DataSourceConfiguration) {
        self.config.store(Arc::new(config.clone()));
    }

    pub(crate) fn name(&self) -> String {
        self.config.load().name.clone()
    }

    pub(crate) fn metrics(&self) -> Arc<DataSourceMetrics> {
        Arc::clone(&self.metrics)
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status.lock().clone()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.status.lock().state()
    }

    pub(crate) fn set_status(&self, next: ConnectionStatus) {
        self.status.lock().update(next);
    }

    /// Marks the adapter connecting and counts the attempt.
    pub(crate) fn begin_connect(&self) {
        self.metrics.record_connection_attempt();
        self.set_status(ConnectionStatus::connecting());
    }

    pub(crate) fn connect_succeeded(&self, message: &str) {
        self.metrics.record_successful_connection();
        self.set_status(ConnectionStatus::connected(Some(message)));
    }

    pub(crate) fn connect_failed(&self, err: &DataSourceError) {
        self.metrics.record_connection_failure();
        self.set_status(ConnectionStatus::error(Some(err.message()), Some(err)));
    }

    /// Fails with a retryable `CONNECTION_ERROR` unless the adapter is connected.
    pub(crate) fn ensure_operational(&self, operation: &str) -> Result<()> {
        let state = self.state();
        if state == ConnectionState::Connected {
            return Ok(());
        }
        Err(DataSourceError::connection(format!("Data source is not available ({state})"))
            .in_context(&self.name(), operation))
    }

    /// Runs `fut`, folding its latency and outcome into the metrics and
    /// tagging any error with the source name and operation.
    pub(crate) async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = elapsed_ms(started);
        match result {
            Ok(value) => {
                self.metrics.record_successful_request(elapsed);
                Ok(value)
            }
            Err(err) => {
                self.metrics.record_failed_request(elapsed);
                let err = err.in_context(&self.name(), operation);
                tracing::debug!(
                    source = %self.name(),
                    operation,
                    kind = ?err.kind(),
                    elapsed_ms = elapsed,
                    "data source call failed"
                );
                Err(err)
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Binds positional `get_data` parameters to `parameter-names`; extra
/// parameters fall back to `param0`, `param1`, ...
pub(crate) fn bind_positional(
    names: &[String],
    params: &[apex_data_core::Value],
) -> apex_data_core::Params {
    params
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let key = names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("param{i}"));
            (key, value.clone())
        })
        .collect()
}

/// Cache key for `get_data`: data type plus the rendered parameters.
pub(crate) fn data_cache_key(data_type: &str, params: &[apex_data_core::Value]) -> String {
    let mut key = String::from(data_type);
    for p in params {
        key.push(':');
        key.push_str(&p.to_plain_string());
    }
    key
}

/// Substitutes `{name}` placeholders with parameter values.
pub(crate) fn substitute_braces(template: &str, params: &apex_data_core::Params) -> String {
    let mut out = template.to_string();
    for (name, value) in params {
        out = out.replace(&format!("{{{name}}}"), &value.to_plain_string());
    }
    out
}
