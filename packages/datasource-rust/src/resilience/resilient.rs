//! Circuit-breaker decorator for adapters.
//!
//! The factory wraps an adapter in [`ResilientDataSource`] when its
//! configuration enables the breaker.

use std::sync::Arc;

use apex_data_core::{
    ConnectionStatus, DataSourceConfiguration, DataSourceError, DataSourceMetrics, DataSourceType,
    ErrorKind, Params, Record, Result, Value,
};
use async_trait::async_trait;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
use crate::traits::ExternalDataSource;

/// Routes every query-path call of an adapter through a [`CircuitBreaker`].
///
/// Lifecycle and health calls go straight to the inner adapter so that a
/// tripped breaker never hides the adapter's own health. When the breaker
/// rejects a call and a `fallback-response` is configured, the fallback is
/// returned instead of the error.
pub struct ResilientDataSource {
    inner: Arc<dyn ExternalDataSource>,
    breaker: CircuitBreaker,
}

impl ResilientDataSource {
    #[must_use]
    pub fn new(inner: Arc<dyn ExternalDataSource>, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// Wraps `inner` using the circuit-breaker block of its own configuration.
    #[must_use]
    pub fn wrap(inner: Arc<dyn ExternalDataSource>) -> Self {
        let config = inner.configuration();
        let breaker = CircuitBreaker::new(
            config.name.clone(),
            config.circuit_breaker.clone().unwrap_or_default(),
        );
        Self::new(inner, breaker)
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn ExternalDataSource> {
        &self.inner
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    #[must_use]
    pub fn breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.breaker.metrics()
    }

    fn fallback(&self) -> Option<serde_json::Value> {
        let text = self.breaker.config().fallback_response.as_deref()?;
        Some(serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.into())))
    }

    fn records_fallback(&self, err: DataSourceError) -> Result<Vec<Record>> {
        if err.kind() != ErrorKind::CircuitBreaker {
            return Err(err);
        }
        let Some(json) = self.fallback() else {
            return Err(err);
        };
        tracing::debug!(source = %self.breaker.name(), "serving circuit-breaker fallback");
        Ok(match Value::from(json) {
            Value::Array(items) => items.into_iter().map(into_record).collect(),
            other => vec![into_record(other)],
        })
    }
}

fn into_record(value: Value) -> Record {
    match value {
        Value::Map(map) => map,
        other => Record::from([("value".to_string(), other)]),
    }
}

#[async_trait]
impl ExternalDataSource for ResilientDataSource {
    fn configuration(&self) -> Arc<DataSourceConfiguration> {
        self.inner.configuration()
    }

    fn source_type(&self) -> DataSourceType {
        self.inner.source_type()
    }

    fn metrics(&self) -> Arc<DataSourceMetrics> {
        self.inner.metrics()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection_status()
    }

    fn supports_data_type(&self, data_type: &str) -> bool {
        self.inner.supports_data_type(data_type)
    }

    async fn initialize(&self, config: &DataSourceConfiguration) -> Result<()> {
        self.inner.initialize(config).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }

    async fn test_connection(&self) -> bool {
        self.inner.test_connection().await
    }

    async fn get_data(&self, data_type: &str, params: &[Value]) -> Result<Option<Value>> {
        match self
            .breaker
            .call(|| self.inner.get_data(data_type, params))
            .await
        {
            Err(err) if err.kind() == ErrorKind::CircuitBreaker => {
                match self.fallback() {
                    Some(json) => Ok(Some(Value::from(json))),
                    None => Err(err),
                }
            }
            other => other,
        }
    }

    async fn query(&self, query: &str, params: &Params) -> Result<Vec<Record>> {
        match self.breaker.call(|| self.inner.query(query, params)).await {
            Ok(rows) => Ok(rows),
            Err(err) => self.records_fallback(err),
        }
    }

    async fn query_for_object(&self, query: &str, params: &Params) -> Result<Option<Record>> {
        Ok(self.query(query, params).await?.into_iter().next())
    }

    async fn batch_query(&self, queries: &[String]) -> Result<Vec<Vec<Record>>> {
        self.breaker.call(|| self.inner.batch_query(queries)).await
    }

    async fn batch_update(&self, statements: &[String]) -> Result<Vec<u64>> {
        self.breaker.call(|| self.inner.batch_update(statements)).await
    }

    async fn refresh(&self) -> Result<()> {
        self.breaker.reset();
        self.inner.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use apex_data_core::CircuitBreakerConfig;

    use super::*;
    use crate::testing::StubDataSource;

    fn wrapped(stub: &Arc<StubDataSource>, fallback: Option<&str>) -> ResilientDataSource {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            fallback_response: fallback.map(str::to_string),
            ..CircuitBreakerConfig::default()
        };
        ResilientDataSource::new(stub.clone(), CircuitBreaker::new("stub", config))
    }

    #[tokio::test]
    async fn open_breaker_skips_the_adapter() {
        let stub = Arc::new(StubDataSource::new("stub", DataSourceType::Database));
        stub.fail_with(ErrorKind::Execution);
        let ds = wrapped(&stub, None);

        for _ in 0..2 {
            assert_eq!(
                ds.query("q", &Params::new()).await.unwrap_err().kind(),
                ErrorKind::Execution
            );
        }
        assert_eq!(ds.breaker_state(), CircuitState::Open);
        assert_eq!(
            ds.query("q", &Params::new()).await.unwrap_err().kind(),
            ErrorKind::CircuitBreaker
        );
        assert_eq!(stub.query_count(), 2);

        // Health bypasses the breaker.
        assert!(ds.is_healthy().await);
    }

    #[tokio::test]
    async fn fallback_response_is_served_while_open() {
        let stub = Arc::new(StubDataSource::new("stub", DataSourceType::RestApi));
        stub.fail_with(ErrorKind::Connection);
        let ds = wrapped(&stub, Some(r#"[{"id": 0, "name": "unknown"}]"#));

        for _ in 0..2 {
            assert!(ds.query("q", &Params::new()).await.is_err());
        }
        let rows = ds.query("q", &Params::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], Value::from("unknown"));
    }

    #[tokio::test]
    async fn refresh_resets_the_breaker() {
        let stub = Arc::new(StubDataSource::new("stub", DataSourceType::Database));
        stub.fail_with(ErrorKind::Execution);
        let ds = wrapped(&stub, None);
        for _ in 0..2 {
            let _ = ds.query("q", &Params::new()).await;
        }
        stub.recover();
        ds.refresh().await.unwrap();
        assert_eq!(ds.breaker_state(), CircuitState::Closed);
        assert!(ds.query("q", &Params::new()).await.is_ok());
    }
}
