//! Scriptable in-memory adapter for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apex_data_core::{
    ConnectionStatus, DataSourceConfiguration, DataSourceError, DataSourceMetrics, DataSourceType,
    ErrorKind, Params, Record, Result, Value,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::traits::ExternalDataSource;

pub(crate) struct StubDataSource {
    config: ArcSwap<DataSourceConfiguration>,
    kind: DataSourceType,
    metrics: Arc<DataSourceMetrics>,
    healthy: AtomicBool,
    failure: Mutex<Option<ErrorKind>>,
    delay: Mutex<Duration>,
    queries: AtomicU32,
    shutdowns: AtomicU32,
    refreshes: AtomicU32,
    fail_shutdown: AtomicBool,
}

impl StubDataSource {
    pub(crate) fn new(name: &str, kind: DataSourceType) -> Self {
        Self::with_config(DataSourceConfiguration::new(name, kind))
    }

    pub(crate) fn with_config(config: DataSourceConfiguration) -> Self {
        let kind = config.data_source_type().unwrap_or(DataSourceType::Custom);
        Self {
            config: ArcSwap::from_pointee(config),
            kind,
            metrics: Arc::new(DataSourceMetrics::new()),
            healthy: AtomicBool::new(true),
            failure: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            queries: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
            fail_shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn fail_with(&self, kind: ErrorKind) {
        *self.failure.lock() = Some(kind);
    }

    pub(crate) fn recover(&self) {
        *self.failure.lock() = None;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn fail_on_shutdown(&self) {
        self.fail_shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn query_count(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_count(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn outcome(&self) -> Result<()> {
        match *self.failure.lock() {
            Some(kind) => Err(DataSourceError::new(kind, format!("{} failed", self.name()))
                .with_retryable(kind.is_retryable_by_default())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExternalDataSource for StubDataSource {
    fn configuration(&self) -> Arc<DataSourceConfiguration> {
        self.config.load_full()
    }

    fn source_type(&self) -> DataSourceType {
        self.kind
    }

    fn metrics(&self) -> Arc<DataSourceMetrics> {
        self.metrics.clone()
    }

    fn connection_status(&self) -> ConnectionStatus {
        if self.healthy.load(Ordering::SeqCst) {
            ConnectionStatus::connected(None)
        } else {
            ConnectionStatus::error(None, None)
        }
    }

    async fn initialize(&self, config: &DataSourceConfiguration) -> Result<()> {
        self.config.store(Arc::new(config.clone()));
        self.outcome()
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(DataSourceError::general("shutdown refused"));
        }
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn test_connection(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn get_data(&self, data_type: &str, params: &[Value]) -> Result<Option<Value>> {
        let rows = self.query(data_type, &Params::new()).await?;
        Ok(rows.into_iter().next().map(|mut row| {
            row.insert("params".into(), Value::Array(params.to_vec()));
            Value::Map(row)
        }))
    }

    async fn query(&self, query: &str, _params: &Params) -> Result<Vec<Record>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.outcome()?;
        self.metrics.record_successful_request(0);
        Ok(vec![Record::from([
            ("source".to_string(), Value::from(self.name())),
            ("query".to_string(), Value::from(query)),
        ])])
    }

    async fn batch_update(&self, statements: &[String]) -> Result<Vec<u64>> {
        self.outcome()?;
        Ok(vec![1; statements.len()])
    }

    async fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }
}
