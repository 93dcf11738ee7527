use std::sync::Arc;

use apex_data_core::{
    ConnectionStatus, DataSourceConfiguration, DataSourceMetrics, DataSourceType, Params, Record,
    Result, Value,
};
use async_trait::async_trait;

/// Uniform capability set over one physical backend.
///
/// Implementations: database, file system, message queue, REST, cache, and
/// anything a [`CustomDataSourceProvider`] builds. Every call either returns
/// a value or a `DataSourceError`; backend-native errors never cross this
/// boundary.
#[async_trait]
pub trait ExternalDataSource: Send + Sync {
    /// Configuration the adapter was initialized with.
    fn configuration(&self) -> Arc<DataSourceConfiguration>;

    /// Backend category.
    fn source_type(&self) -> DataSourceType;

    /// Running counters, shared with any cache the adapter owns.
    fn metrics(&self) -> Arc<DataSourceMetrics>;

    /// Snapshot of the current connection status.
    fn connection_status(&self) -> ConnectionStatus;

    fn name(&self) -> String {
        self.configuration().name.clone()
    }

    /// Whether this adapter serves `data_type`. Adapters without a configured
    /// data type serve everything.
    fn supports_data_type(&self, data_type: &str) -> bool {
        self.configuration()
            .data_type
            .as_deref()
            .is_none_or(|own| own.eq_ignore_ascii_case(data_type))
    }

    /// Binds the adapter to `config` and connects.
    async fn initialize(&self, config: &DataSourceConfiguration) -> Result<()>;

    /// Releases every resource. Safe to call more than once.
    async fn shutdown(&self) -> Result<()>;

    async fn is_healthy(&self) -> bool;

    /// Lightweight reachability check. Never fails, only reports.
    async fn test_connection(&self) -> bool;

    /// Keyed lookup of one item of `data_type`.
    async fn get_data(&self, data_type: &str, params: &[Value]) -> Result<Option<Value>>;

    async fn query(&self, query: &str, params: &Params) -> Result<Vec<Record>>;

    /// First row of [`query`](Self::query), if any.
    async fn query_for_object(&self, query: &str, params: &Params) -> Result<Option<Record>> {
        Ok(self.query(query, params).await?.into_iter().next())
    }

    /// Runs each query without parameters, in order. Stops at the first failure.
    async fn batch_query(&self, queries: &[String]) -> Result<Vec<Vec<Record>>> {
        let empty = Params::new();
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.query(query, &empty).await?);
        }
        Ok(results)
    }

    /// Applies write statements and returns one affected-count per statement.
    async fn batch_update(&self, statements: &[String]) -> Result<Vec<u64>>;

    /// Drops cached state and re-checks connectivity.
    async fn refresh(&self) -> Result<()>;
}

/// Builds adapters for `custom` configurations, keyed by the configuration's
/// `implementation` value.
pub trait CustomDataSourceProvider: Send + Sync {
    /// Returns an uninitialized adapter; the factory initializes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot build an adapter for `config`.
    fn create(&self, config: &DataSourceConfiguration)
        -> anyhow::Result<Arc<dyn ExternalDataSource>>;
}

impl<F> CustomDataSourceProvider for F
where
    F: Fn(&DataSourceConfiguration) -> anyhow::Result<Arc<dyn ExternalDataSource>> + Send + Sync,
{
    fn create(
        &self,
        config: &DataSourceConfiguration,
    ) -> anyhow::Result<Arc<dyn ExternalDataSource>> {
        self(config)
    }
}
