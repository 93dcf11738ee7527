//! Builds adapters from configurations.
//!
//! [`DataSourceFactory`] is the single construction point for every
//! [`ExternalDataSource`]: it dispatches on the parsed [`DataSourceType`],
//! initializes the adapter, and wraps it in a [`ResilientDataSource`] when the
//! configuration enables a circuit breaker. Physical database connections are
//! shared through one [`ConnectionFactory`] owned by the factory.

pub mod connection;
pub mod url;

use std::sync::Arc;

use apex_data_core::{DataSourceConfiguration, DataSourceError, DataSourceType, Result};
use dashmap::DashMap;

pub use connection::{classify_sql_error, ConnectionFactory, ConnectionProvider, ProviderKind};
pub use url::{build_database_url, merge_parameters, DatabaseUrl, MemoryMode, SqlDialect};

use crate::adapters::{
    CacheDataSource, DatabaseDataSource, FileSystemDataSource, MessageQueueDataSource,
    RestApiDataSource,
};
use crate::resilience::ResilientDataSource;
use crate::traits::{CustomDataSourceProvider, ExternalDataSource};

/// Creates, initializes and wraps adapters.
pub struct DataSourceFactory {
    connections: Arc<ConnectionFactory>,
    http: reqwest::Client,
    custom_providers: DashMap<String, Arc<dyn CustomDataSourceProvider>>,
}

impl DataSourceFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_connection_factory(Arc::new(ConnectionFactory::new()))
    }

    #[must_use]
    pub fn with_connection_factory(connections: Arc<ConnectionFactory>) -> Self {
        Self {
            connections,
            http: reqwest::Client::new(),
            custom_providers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn connection_factory(&self) -> &Arc<ConnectionFactory> {
        &self.connections
    }

    /// Registers `provider` for custom configurations whose `implementation`
    /// equals `key` (case-insensitive). Replaces any earlier provider.
    pub fn register_custom_provider(
        &self,
        key: impl AsRef<str>,
        provider: Arc<dyn CustomDataSourceProvider>,
    ) {
        let key = key.as_ref().trim().to_ascii_lowercase();
        tracing::debug!(implementation = %key, "registered custom data source provider");
        self.custom_providers.insert(key, provider);
    }

    /// Builds and initializes one adapter.
    ///
    /// # Errors
    ///
    /// `CONFIGURATION_ERROR` when the configuration is invalid or names an
    /// unknown custom implementation; otherwise whatever the adapter's
    /// `initialize` raises.
    pub async fn create_data_source(
        &self,
        config: &DataSourceConfiguration,
    ) -> Result<Arc<dyn ExternalDataSource>> {
        config.validate().map_err(|e| e.with_source(config.name.clone()))?;
        let Some(kind) = config.data_source_type() else {
            return Err(DataSourceError::configuration(format!(
                "Unsupported data source type: {}",
                config.type_name
            ))
            .with_source(config.name.clone()));
        };

        let adapter: Arc<dyn ExternalDataSource> = match kind {
            DataSourceType::Database => {
                Arc::new(DatabaseDataSource::new(Arc::clone(&self.connections)))
            }
            DataSourceType::RestApi => Arc::new(RestApiDataSource::new(self.http.clone())),
            DataSourceType::MessageQueue => Arc::new(MessageQueueDataSource::new()),
            DataSourceType::FileSystem => Arc::new(FileSystemDataSource::new()),
            DataSourceType::Cache => Arc::new(CacheDataSource::new()),
            DataSourceType::Custom => self.build_custom(config)?,
        };

        if let Err(err) = adapter.initialize(config).await {
            if let Err(cleanup) = adapter.shutdown().await {
                tracing::warn!(
                    source = %config.name,
                    error = %cleanup,
                    "shutdown after failed initialize also failed"
                );
            }
            return Err(err);
        }
        tracing::info!(
            source = %config.name,
            kind = %kind.display_name(),
            circuit_breaker = config.circuit_breaker_enabled(),
            "created data source"
        );

        if config.circuit_breaker_enabled() {
            return Ok(Arc::new(ResilientDataSource::wrap(adapter)));
        }
        Ok(adapter)
    }

    fn build_custom(&self, config: &DataSourceConfiguration) -> Result<Arc<dyn ExternalDataSource>> {
        let Some(implementation) = config
            .implementation
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
        else {
            return Err(
                DataSourceError::configuration("Custom data source requires implementation")
                    .with_source(config.name.clone()),
            );
        };
        let provider = self
            .custom_providers
            .get(&implementation.to_ascii_lowercase())
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| {
                DataSourceError::configuration(format!(
                    "No custom provider registered for: {implementation}"
                ))
                .with_source(config.name.clone())
            })?;
        provider.create(config).map_err(|e| {
            DataSourceError::configuration(format!(
                "Custom provider '{implementation}' failed: {e:#}"
            ))
            .with_source(config.name.clone())
        })
    }

    /// Builds every configuration, or none of them.
    ///
    /// When one configuration fails, adapters already built by this call are
    /// shut down before the error is returned.
    ///
    /// # Errors
    ///
    /// The first failure encountered.
    pub async fn create_data_sources(
        &self,
        configs: &[DataSourceConfiguration],
    ) -> Result<Vec<Arc<dyn ExternalDataSource>>> {
        let mut built = Vec::with_capacity(configs.len());
        for config in configs {
            match self.create_data_source(config).await {
                Ok(adapter) => built.push(adapter),
                Err(err) => {
                    tracing::warn!(
                        source = %config.name,
                        error = %err,
                        rollback = built.len(),
                        "data source creation failed; shutting down the ones already built"
                    );
                    for adapter in built {
                        if let Err(e) = adapter.shutdown().await {
                            tracing::warn!(source = %adapter.name(), error = %e, "shutdown during rollback failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(built)
    }

    /// Whether `type_name` parses to a known backend category.
    #[must_use]
    pub fn is_type_supported(&self, type_name: &str) -> bool {
        DataSourceType::from_config_value(type_name).is_some()
    }

    #[must_use]
    pub fn supported_types(&self) -> Vec<DataSourceType> {
        DataSourceType::ALL.to_vec()
    }

    /// Closes every cached database connection.
    pub async fn clear_cache(&self) {
        self.connections.clear_cache().await;
    }

    /// Closes cached connections and forgets custom providers.
    pub async fn shutdown(&self) {
        self.connections.clear_cache().await;
        self.custom_providers.clear();
        tracing::debug!("data source factory shut down");
    }
}

impl Default for DataSourceFactory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
