//! Relational adapter over a shared [`ConnectionProvider`].

use std::sync::Arc;

use apex_data_core::{
    ConnectionStatus, DataSourceConfiguration, DataSourceError, DataSourceMetrics, DataSourceType,
    Params, Record, Result, Value,
};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{bind_positional, data_cache_key, AdapterCore};
use crate::factory::{classify_sql_error, ConnectionFactory, ConnectionProvider, SqlDialect};
use crate::resilience::{CacheLookup, TtlCache};
use crate::traits::ExternalDataSource;

const UPDATE_KEYWORDS: [&str; 6] = ["UPDATE", "INSERT", "DELETE", "CREATE", "DROP", "ALTER"];

pub struct DatabaseDataSource {
    core: AdapterCore,
    connections: Arc<ConnectionFactory>,
    provider: RwLock<Option<Arc<dyn ConnectionProvider>>>,
    cache: RwLock<Option<Arc<TtlCache<Value>>>>,
}

impl DatabaseDataSource {
    #[must_use]
    pub fn new(connections: Arc<ConnectionFactory>) -> Self {
        Self {
            core: AdapterCore::new(),
            connections,
            provider: RwLock::new(None),
            cache: RwLock::new(None),
        }
    }

    fn provider(&self, operation: &str) -> Result<Arc<dyn ConnectionProvider>> {
        self.core.ensure_operational(operation)?;
        self.provider.read().clone().ok_or_else(|| {
            DataSourceError::connection("Database connection not initialized")
                .in_context(&self.core.name(), operation)
        })
    }

    fn cache(&self) -> Option<Arc<TtlCache<Value>>> {
        self.cache.read().clone()
    }

    async fn ping(&self, provider: &dyn ConnectionProvider) -> Result<()> {
        let config = self.core.config();
        let health_query = config.health_check.as_ref().and_then(|h| h.query.as_deref());
        let outcome = match health_query {
            Some(q) => provider.fetch_all(q, Vec::new()).await.map(|_| ()),
            None => provider.ping().await,
        };
        outcome.map_err(|e| classify_sql_error(e, &config.name, "test_connection"))
    }

    /// Reloads a stale `get_data` entry off the caller's path.
    fn schedule_refresh(
        &self,
        provider: Arc<dyn ConnectionProvider>,
        cache: Arc<TtlCache<Value>>,
        key: String,
        sql: String,
        params: Params,
    ) {
        let name = self.core.name();
        tokio::spawn(async move {
            match load_first(provider.as_ref(), &sql, &params).await {
                Ok(Some(value)) => cache.put(key, value),
                Ok(None) => {
                    cache.remove(&key);
                }
                Err(err) => {
                    tracing::warn!(source = %name, key = %key, error = %err, "refresh-ahead reload failed");
                }
            }
        });
    }
}

async fn run_statement(
    provider: &dyn ConnectionProvider,
    sql: &str,
    params: &Params,
) -> std::result::Result<Vec<Record>, RunError> {
    let (statement, values) = rewrite_named(sql, params, provider.dialect())?;
    if is_update(&statement) {
        provider.execute(&statement, values).await?;
        return Ok(Vec::new());
    }
    Ok(provider.fetch_all(&statement, values).await?)
}

async fn load_first(
    provider: &dyn ConnectionProvider,
    sql: &str,
    params: &Params,
) -> std::result::Result<Option<Value>, RunError> {
    Ok(run_statement(provider, sql, params)
        .await?
        .into_iter()
        .next()
        .map(Value::Map))
}

/// Failure of one statement before it is tagged with a source name.
#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Binding(#[from] DataSourceError),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

impl RunError {
    fn classify(self, source: &str, operation: &str) -> DataSourceError {
        match self {
            Self::Binding(e) => e.in_context(source, operation),
            Self::Sql(e) => classify_sql_error(e, source, operation),
        }
    }
}

/// Whether `sql` is a write that returns no rows.
fn is_update(sql: &str) -> bool {
    let first = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    UPDATE_KEYWORDS.contains(&first.as_str()) && !sql.to_ascii_uppercase().contains("RETURNING")
}

/// Rewrites `:name` placeholders into the dialect's positional form and
/// collects the bound values in order.
///
/// Quoted text and `::` casts are left alone.
fn rewrite_named(sql: &str, params: &Params, dialect: SqlDialect) -> Result<(String, Vec<Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            ':' if chars.peek().is_some_and(|&(_, n)| n == ':') => {
                chars.next();
                out.push_str("::");
            }
            ':' if chars
                .peek()
                .is_some_and(|&(_, n)| n.is_ascii_alphabetic() || n == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, n)) = chars.peek() {
                    if !(n.is_ascii_alphanumeric() || n == '_') {
                        break;
                    }
                    end = j + n.len_utf8();
                    chars.next();
                }
                let name = &sql[start..end];
                let value = params.get(name).cloned().ok_or_else(|| {
                    DataSourceError::data_format(format!(
                        "No value supplied for SQL parameter '{name}'"
                    ))
                })?;
                values.push(value);
                out.push_str(&dialect.placeholder(values.len()));
            }
            _ => out.push(c),
        }
    }
    Ok((out, values))
}

#[async_trait]
impl ExternalDataSource for DatabaseDataSource {
    fn configuration(&self) -> Arc<DataSourceConfiguration> {
        self.core.config()
    }

    fn source_type(&self) -> DataSourceType {
        DataSourceType::Database
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

        let provider = match self.connections.get_or_create(config).await {
            Ok(p) => p,
            Err(err) => {
                let err = err.in_context(&config.name, "initialize");
                self.core.connect_failed(&err);
                return Err(err);
            }
        };

        if config.cache_enabled() {
            if let Some(cache_config) = &config.cache {
                *self.cache.write() = Some(Arc::new(TtlCache::new(
                    cache_config,
                    Some(self.core.metrics()),
                )));
            }
        }
        let target = provider.target().redacted();
        *self.provider.write() = Some(provider);
        self.core
            .connect_succeeded(&format!("Connected to {target}"));
        tracing::info!(source = %config.name, url = %target, "database data source initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.core.set_status(ConnectionStatus::shutting_down());
        if let Some(cache) = self.cache.write().take() {
            cache.clear();
        }
        if self.provider.write().take().is_some() {
            self.connections.remove_from_cache(&self.core.config()).await;
        }
        self.core.set_status(ConnectionStatus::shutdown());
        tracing::debug!(source = %self.core.name(), "database data source shut down");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        if !self.core.status().is_operational() {
            return false;
        }
        self.test_connection().await
    }

    async fn test_connection(&self) -> bool {
        let Some(provider) = self.provider.read().clone() else {
            return false;
        };
        match self.ping(provider.as_ref()).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(source = %self.core.name(), error = %err, "database connection test failed");
                false
            }
        }
    }

    async fn get_data(&self, data_type: &str, params: &[Value]) -> Result<Option<Value>> {
        let provider = self.provider("get_data")?;
        let config = self.core.config();
        let Some(sql) = config
            .queries
            .get(data_type)
            .or_else(|| config.queries.get("default"))
            .cloned()
        else {
            return Err(DataSourceError::configuration(format!(
                "No query configured for data type: {data_type}"
            ))
            .in_context(&config.name, "get_data"));
        };
        let bound = bind_positional(&config.parameter_names, params);
        let key = data_cache_key(data_type, params);
        let cache = self.cache();

        if let Some(cache) = &cache {
            match cache.lookup(&key) {
                CacheLookup::Hit(value) => return Ok(Some(value)),
                CacheLookup::Stale(value) => {
                    self.schedule_refresh(provider, Arc::clone(cache), key, sql, bound);
                    return Ok(Some(value));
                }
                CacheLookup::Miss => {}
            }
        }

        let value = self
            .core
            .timed("get_data", async {
                load_first(provider.as_ref(), &sql, &bound)
                    .await
                    .map_err(|e| e.classify(&config.name, "get_data"))
            })
            .await?;
        if let (Some(cache), Some(value)) = (&cache, &value) {
            cache.put(key, value.clone());
        }
        Ok(value)
    }

    async fn query(&self, query: &str, params: &Params) -> Result<Vec<Record>> {
        let provider = self.provider("query")?;
        let config = self.core.config();
        let sql = config.queries.get(query).map_or(query, String::as_str);
        let rows = self
            .core
            .timed("query", async {
                run_statement(provider.as_ref(), sql, params)
                    .await
                    .map_err(|e| e.classify(&config.name, "query"))
            })
            .await?;
        self.core.metrics().record_records_processed(rows.len() as u64);
        Ok(rows)
    }

    async fn batch_update(&self, statements: &[String]) -> Result<Vec<u64>> {
        let provider = self.provider("batch_update")?;
        let name = self.core.name();
        let counts = self
            .core
            .timed("batch_update", async {
                provider
                    .execute_batch(statements)
                    .await
                    .map_err(|e| classify_sql_error(e, &name, "batch_update"))
            })
            .await?;
        self.core
            .metrics()
            .record_records_processed(counts.iter().sum());
        Ok(counts)
    }

    async fn refresh(&self) -> Result<()> {
        if let Some(cache) = self.cache() {
            cache.clear();
        }
        let Some(provider) = self.provider.read().clone() else {
            return Err(DataSourceError::connection("Database connection not initialized")
                .in_context(&self.core.name(), "refresh"));
        };
        self.core.begin_connect();
        match self.ping(provider.as_ref()).await {
            Ok(()) => {
                self.core.connect_succeeded("Connection refreshed");
                Ok(())
            }
            Err(err) => {
                let err = DataSourceError::connection(format!(
                    "Database is not available: {}",
                    err.message()
                ))
                .in_context(&self.core.name(), "refresh")
                .with_cause(err);
                self.core.connect_failed(&err);
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
