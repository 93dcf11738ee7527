//! Physical database connections, built once per configuration signature.
//!
//! Two [`ConnectionProvider`] implementations share one interface: a pooled
//! provider over an `sqlx` `AnyPool`, and a pool-less provider that opens a
//! connection per call (keeping one connection for in-memory databases,
//! which would otherwise vanish between calls). The pool is used unless the
//! configuration disables it or the pool cannot be built.

use std::sync::Arc;
use std::time::Duration;

use apex_data_core::{DataSourceConfiguration, DataSourceError, Record, Value};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool, Column, Connection, Row};
use tokio::sync::Mutex;

use super::url::{build_database_url, DatabaseUrl, MemoryMode, SqlDialect};

/// Which implementation backs a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Pooled,
    Simple,
}

/// A way to run SQL against one database.
///
/// Errors are backend-native; adapters classify them with
/// [`classify_sql_error`] at their boundary.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn target(&self) -> &DatabaseUrl;

    fn dialect(&self) -> SqlDialect {
        self.target().dialect
    }

    async fn fetch_all(&self, sql: &str, params: Vec<Value>) -> sqlx::Result<Vec<Record>>;

    /// Runs a write and returns the affected row count.
    async fn execute(&self, sql: &str, params: Vec<Value>) -> sqlx::Result<u64>;

    /// Runs every statement in one transaction; any failure rolls back all of them.
    async fn execute_batch(&self, statements: &[String]) -> sqlx::Result<Vec<u64>>;

    /// Opens (or borrows) a connection and checks it is usable.
    async fn ping(&self) -> sqlx::Result<()>;

    async fn close(&self);
}

// ---------------------------------------------------------------------------
// Row and parameter conversion
// ---------------------------------------------------------------------------

fn prepare(sql: &str, params: Vec<Value>) -> Query<'_, Any, AnyArguments<'_>> {
    params.into_iter().fold(sqlx::query(sql), |q, value| match value {
        Value::Null => q.bind(Option::<String>::None),
        Value::Bool(b) => q.bind(b),
        Value::Int(i) => q.bind(i),
        Value::Float(f) => q.bind(f),
        Value::String(s) => q.bind(s),
        Value::Bytes(b) => q.bind(b),
        nested @ (Value::Array(_) | Value::Map(_)) => q.bind(nested.to_json().to_string()),
    })
}

fn decode_row(row: &AnyRow) -> Record {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), decode_column(row, col.ordinal())))
        .collect()
}

/// Tries the supported column types from most to least specific.
fn decode_column(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, Value::Int);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Value::Null, Value::Float);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(Value::Null, Value::Bool);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(Value::Null, Value::Bytes);
    }
    Value::Null
}

// ---------------------------------------------------------------------------
// Pooled provider
// ---------------------------------------------------------------------------

pub struct PooledConnectionProvider {
    pool: AnyPool,
    target: DatabaseUrl,
    validation_query: Option<String>,
}

impl PooledConnectionProvider {
    /// Builds a lazily-connecting pool; no connection is opened here.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the URL cannot be parsed into pool options.
    pub fn new(config: &DataSourceConfiguration, target: DatabaseUrl) -> sqlx::Result<Self> {
        let pool_config = config
            .connection
            .as_ref()
            .and_then(|c| c.connection_pool.clone())
            .unwrap_or_default();

        let mut options = AnyPoolOptions::new()
            .max_connections(pool_config.max_size.max(1))
            .min_connections(pool_config.min_size.min(pool_config.max_size.max(1)))
            .acquire_timeout(Duration::from_millis(pool_config.connection_timeout))
            .idle_timeout(Some(Duration::from_millis(pool_config.idle_timeout)))
            .max_lifetime(Some(Duration::from_millis(pool_config.max_lifetime)))
            .test_before_acquire(pool_config.test_on_borrow);

        match target.memory {
            // Every pooled connection would see its own private database.
            MemoryMode::Private => {
                options = options
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None);
            }
            MemoryMode::Shared if target.keep_alive() => {
                options = options
                    .min_connections(pool_config.min_size.max(1))
                    .idle_timeout(None)
                    .max_lifetime(None);
            }
            _ => {}
        }

        let pool = options.connect_lazy(&target.url)?;
        Ok(Self {
            pool,
            target,
            validation_query: pool_config.validation_query,
        })
    }
}

#[async_trait]
impl ConnectionProvider for PooledConnectionProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Pooled
    }

    fn target(&self) -> &DatabaseUrl {
        &self.target
    }

    async fn fetch_all(&self, sql: &str, params: Vec<Value>) -> sqlx::Result<Vec<Record>> {
        let rows = prepare(sql, params).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute(&self, sql: &str, params: Vec<Value>) -> sqlx::Result<u64> {
        Ok(prepare(sql, params)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn execute_batch(&self, statements: &[String]) -> sqlx::Result<Vec<u64>> {
        let mut tx = self.pool.begin().await?;
        let mut counts = Vec::with_capacity(statements.len());
        for statement in statements {
            match sqlx::query(statement).execute(&mut *tx).await {
                Ok(done) => counts.push(done.rows_affected()),
                Err(err) => {
                    let _ = tx.rollback().await;
                    return Err(err);
                }
            }
        }
        tx.commit().await?;
        Ok(counts)
    }

    async fn ping(&self) -> sqlx::Result<()> {
        match &self.validation_query {
            Some(q) => sqlx::query(q).execute(&self.pool).await.map(|_| ()),
            None => self.pool.acquire().await?.ping().await,
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Simple provider
// ---------------------------------------------------------------------------

pub struct SimpleConnectionProvider {
    target: DatabaseUrl,
    /// Held for in-memory targets only.
    resident: Mutex<Option<AnyConnection>>,
}

impl SimpleConnectionProvider {
    #[must_use]
    pub fn new(target: DatabaseUrl) -> Self {
        Self {
            target,
            resident: Mutex::new(None),
        }
    }

    async fn with_connection<T, F>(&self, f: F) -> sqlx::Result<T>
    where
        F: for<'c> FnOnce(
                &'c mut AnyConnection,
            ) -> futures_util::future::BoxFuture<'c, sqlx::Result<T>>
            + Send,
        T: Send,
    {
        if self.target.memory == MemoryMode::None {
            let mut conn = AnyConnection::connect(&self.target.url).await?;
            let result = f(&mut conn).await;
            let _ = conn.close().await;
            return result;
        }
        let mut resident = self.resident.lock().await;
        if resident.is_none() {
            *resident = Some(AnyConnection::connect(&self.target.url).await?);
        }
        match resident.as_mut() {
            Some(conn) => f(conn).await,
            None => Err(sqlx::Error::PoolClosed),
        }
    }
}

#[async_trait]
impl ConnectionProvider for SimpleConnectionProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Simple
    }

    fn target(&self) -> &DatabaseUrl {
        &self.target
    }

    async fn fetch_all(&self, sql: &str, params: Vec<Value>) -> sqlx::Result<Vec<Record>> {
        let sql = sql.to_owned();
        self.with_connection(move |conn| {
            Box::pin(async move {
                let rows = prepare(&sql, params).fetch_all(&mut *conn).await?;
                Ok(rows.iter().map(decode_row).collect())
            })
        })
        .await
    }

    async fn execute(&self, sql: &str, params: Vec<Value>) -> sqlx::Result<u64> {
        let sql = sql.to_owned();
        self.with_connection(move |conn| {
            Box::pin(async move {
                Ok(prepare(&sql, params)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected())
            })
        })
        .await
    }

    async fn execute_batch(&self, statements: &[String]) -> sqlx::Result<Vec<u64>> {
        let statements = statements.to_vec();
        self.with_connection(move |conn| {
            Box::pin(async move {
                let mut tx = conn.begin().await?;
                let mut counts = Vec::with_capacity(statements.len());
                for statement in &statements {
                    match sqlx::query(statement).execute(&mut *tx).await {
                        Ok(done) => counts.push(done.rows_affected()),
                        Err(err) => {
                            let _ = tx.rollback().await;
                            return Err(err);
                        }
                    }
                }
                tx.commit().await?;
                Ok(counts)
            })
        })
        .await
    }

    async fn ping(&self) -> sqlx::Result<()> {
        self.with_connection(|conn| Box::pin(async move { conn.ping().await }))
            .await
    }

    async fn close(&self) {
        if let Some(conn) = self.resident.lock().await.take() {
            let _ = conn.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Maps a driver error onto the data-layer taxonomy.
///
/// SQLSTATE class `08` is a connection failure and class `28` an
/// authentication failure; decode problems are data-format errors.
#[must_use]
pub fn classify_sql_error(err: sqlx::Error, source: &str, operation: &str) -> DataSourceError {
    let message = err.to_string();
    let classified = match &err {
        sqlx::Error::Configuration(_) => DataSourceError::configuration(message),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DataSourceError::connection(message),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if code.len() == 5 && code.starts_with("08") => {
                DataSourceError::connection(message)
            }
            Some(code) if code.len() == 5 && code.starts_with("28") => {
                DataSourceError::authentication(message)
            }
            _ => DataSourceError::execution(message),
        },
        sqlx::Error::RowNotFound => DataSourceError::not_found(message),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::Encode(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. } => DataSourceError::data_format(message),
        _ => DataSourceError::execution(message),
    };
    classified
        .with_source(source)
        .with_operation(operation)
        .with_cause(err)
}

// ---------------------------------------------------------------------------
// ConnectionFactory
// ---------------------------------------------------------------------------

/// Builds and caches one [`ConnectionProvider`] per configuration signature.
///
/// Repeat requests with the same signature return the cached provider
/// without re-testing it. Entries leave the cache only through
/// [`remove_from_cache`](Self::remove_from_cache) or
/// [`clear_cache`](Self::clear_cache).
pub struct ConnectionFactory {
    cache: DashMap<String, Arc<dyn ConnectionProvider>>,
}

impl ConnectionFactory {
    #[must_use]
    pub fn new() -> Self {
        sqlx::any::install_default_drivers();
        Self {
            cache: DashMap::new(),
        }
    }

    /// `name:sourceType:host:port:database`.
    #[must_use]
    pub fn cache_key(config: &DataSourceConfiguration) -> String {
        let conn = config.connection.as_ref();
        format!(
            "{}:{}:{}:{}:{}",
            config.name,
            config.source_type.as_deref().unwrap_or_default(),
            conn.and_then(|c| c.host.as_deref()).unwrap_or_default(),
            conn.and_then(|c| c.port).map(|p| p.to_string()).unwrap_or_default(),
            conn.and_then(|c| c.database.as_deref()).unwrap_or_default(),
        )
    }

    /// Returns the cached provider for `config`, building and testing a new
    /// one on a miss.
    ///
    /// # Errors
    ///
    /// `CONFIGURATION_ERROR` for unusable configurations, `CONNECTION_ERROR`
    /// when the connectivity test fails. Failed providers are never cached.
    pub async fn get_or_create(
        &self,
        config: &DataSourceConfiguration,
    ) -> apex_data_core::Result<Arc<dyn ConnectionProvider>> {
        let key = Self::cache_key(config);
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(source = %config.name, "reusing cached connection provider");
            return Ok(Arc::clone(cached.value()));
        }

        let target = build_database_url(config)?;
        let provider = Self::build_provider(config, target);
        Self::test_provider(config, provider.as_ref()).await?;

        let winner = Arc::clone(
            self.cache
                .entry(key)
                .or_insert_with(|| Arc::clone(&provider))
                .value(),
        );
        if Arc::ptr_eq(&winner, &provider) {
            tracing::info!(
                source = %config.name,
                url = %provider.target().redacted(),
                kind = ?provider.kind(),
                cached = self.cache.len(),
                "created connection provider"
            );
        } else {
            provider.close().await;
        }
        Ok(winner)
    }

    fn build_provider(
        config: &DataSourceConfiguration,
        target: DatabaseUrl,
    ) -> Arc<dyn ConnectionProvider> {
        let pooling = config
            .connection
            .as_ref()
            .and_then(|c| c.connection_pool.as_ref())
            .is_none_or(|p| p.enabled);
        if !pooling {
            return Arc::new(SimpleConnectionProvider::new(target));
        }
        match PooledConnectionProvider::new(config, target.clone()) {
            Ok(pooled) => Arc::new(pooled),
            Err(err) => {
                tracing::warn!(
                    source = %config.name,
                    error = %err,
                    "connection pool unavailable; falling back to one connection per request"
                );
                Arc::new(SimpleConnectionProvider::new(target))
            }
        }
    }

    async fn test_provider(
        config: &DataSourceConfiguration,
        provider: &dyn ConnectionProvider,
    ) -> apex_data_core::Result<()> {
        let timeout = config
            .connection
            .as_ref()
            .map_or(Duration::from_secs(30), |c| c.timeout_duration());
        let outcome = tokio::time::timeout(timeout, provider.ping()).await;
        let failure = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => {
                let classified = classify_sql_error(err, &config.name, "test_connection");
                if classified.kind() == apex_data_core::ErrorKind::Configuration {
                    classified
                } else {
                    DataSourceError::connection(format!(
                        "Connection test failed for '{}': {}",
                        config.name,
                        classified.message()
                    ))
                    .with_source(config.name.clone())
                    .with_operation("test_connection")
                    .with_cause(classified)
                }
            }
            Err(_) => DataSourceError::connection(format!(
                "Connection test timed out after {}ms for '{}'",
                timeout.as_millis(),
                config.name
            ))
            .with_source(config.name.clone())
            .with_operation("test_connection"),
        };
        provider.close().await;
        Err(failure)
    }

    /// Evicts the provider for `config` and closes it. Returns whether an
    /// entry existed.
    pub async fn remove_from_cache(&self, config: &DataSourceConfiguration) -> bool {
        match self.cache.remove(&Self::cache_key(config)) {
            Some((_, provider)) => {
                provider.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes and evicts every cached provider.
    pub async fn clear_cache(&self) {
        let keys: Vec<String> = self.cache.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, provider)) = self.cache.remove(&key) {
                provider.close().await;
            }
        }
    }

    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use apex_data_core::{ConnectionConfig, ConnectionPoolConfig, DataSourceType, ErrorKind};

    use super::*;

    fn sqlite_config(name: &str, database: &str) -> DataSourceConfiguration {
        DataSourceConfiguration {
            source_type: Some("h2".into()),
            connection: Some(ConnectionConfig {
                database: Some(database.into()),
                ..ConnectionConfig::default()
            }),
            ..DataSourceConfiguration::new(name, DataSourceType::Database)
        }
    }

    #[tokio::test]
    async fn caches_by_signature() {
        let factory = ConnectionFactory::new();
        let config = sqlite_config("cache-test", "mem:cache_test");

        let first = factory.get_or_create(&config).await.unwrap();
        let second = factory.get_or_create(&config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), ProviderKind::Pooled);
        assert_eq!(factory.cached_count(), 1);

        assert!(factory.remove_from_cache(&config).await);
        assert!(!factory.remove_from_cache(&config).await);
        assert_eq!(factory.cached_count(), 0);
    }

    #[tokio::test]
    async fn shared_memory_database_survives_between_calls() {
        let factory = ConnectionFactory::new();
        let provider = factory
            .get_or_create(&sqlite_config("shared", "mem:shared_survives"))
            .await
            .unwrap();

        provider
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL)", vec![])
            .await
            .unwrap();
        provider
            .execute(
                "INSERT INTO t (id, name, score) VALUES (?, ?, ?)",
                vec![Value::Int(1), Value::from("a"), Value::Float(1.5)],
            )
            .await
            .unwrap();

        let rows = provider.fetch_all("SELECT * FROM t", vec![]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], Value::Int(1));
        assert_eq!(rows[0]["name"], Value::from("a"));
        assert_eq!(rows[0]["score"], Value::Float(1.5));
        factory.clear_cache().await;
    }

    #[tokio::test]
    async fn unpooled_provider_keeps_in_memory_database() {
        let mut config = sqlite_config("simple", "mem");
        if let Some(conn) = config.connection.as_mut() {
            conn.connection_pool = Some(ConnectionPoolConfig {
                enabled: false,
                ..ConnectionPoolConfig::default()
            });
        }
        let factory = ConnectionFactory::new();
        let provider = factory.get_or_create(&config).await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::Simple);

        provider.execute("CREATE TABLE k (v TEXT)", vec![]).await.unwrap();
        let counts = provider
            .execute_batch(&[
                "INSERT INTO k VALUES ('x')".to_string(),
                "INSERT INTO k VALUES ('y')".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(counts, vec![1, 1]);

        let failed = provider
            .execute_batch(&[
                "INSERT INTO k VALUES ('z')".to_string(),
                "INSERT INTO missing VALUES (1)".to_string(),
            ])
            .await;
        assert!(failed.is_err());
        let rows = provider.fetch_all("SELECT v FROM k", vec![]).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn unpooled_provider_opens_a_connection_per_call_for_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.db").display().to_string();
        let mut config = sqlite_config("simple-file", &path);
        if let Some(conn) = config.connection.as_mut() {
            conn.connection_pool = Some(ConnectionPoolConfig {
                enabled: false,
                ..ConnectionPoolConfig::default()
            });
        }
        let factory = ConnectionFactory::new();
        let provider = factory.get_or_create(&config).await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::Simple);
        assert_eq!(provider.target().memory, MemoryMode::None);

        provider
            .execute("CREATE TABLE orders (id INTEGER, item TEXT)", vec![])
            .await
            .unwrap();
        let inserted = provider
            .execute(
                "INSERT INTO orders (id, item) VALUES (?, ?)",
                vec![Value::Int(7), Value::from("lamp")],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        let counts = provider
            .execute_batch(&["INSERT INTO orders VALUES (8, 'desk')".to_string()])
            .await
            .unwrap();
        assert_eq!(counts, vec![1]);

        let rows = provider
            .fetch_all("SELECT item FROM orders WHERE id >= ? ORDER BY id", vec![Value::Int(7)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["item"], Value::from("desk"));
        provider.ping().await.unwrap();
        factory.clear_cache().await;
    }

    #[tokio::test]
    async fn failed_connectivity_test_is_not_cached() {
        let mut config = sqlite_config("broken", "/nonexistent-dir/for/sure/db.sqlite");
        if let Some(conn) = config.connection.as_mut() {
            conn.timeout = 2_000;
            conn.connection_pool = Some(ConnectionPoolConfig {
                connection_timeout: 1_000,
                ..ConnectionPoolConfig::default()
            });
        }
        let factory = ConnectionFactory::new();
        let err = match factory.get_or_create(&config).await {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_retryable());
        assert_eq!(factory.cached_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_type_is_configuration_error() {
        let mut config = sqlite_config("oracle", "orcl");
        config.source_type = Some("oracle".into());
        let factory = ConnectionFactory::new();
        let err = match factory.get_or_create(&config).await {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retryable());
    }

    #[test]
    fn cache_key_format() {
        let config = sqlite_config("orders", "mem:orders");
        assert_eq!(ConnectionFactory::cache_key(&config), "orders:h2:::mem:orders");
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = classify_sql_error(sqlx::Error::RowNotFound, "db", "query");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.source_name(), Some("db"));
        let err = classify_sql_error(sqlx::Error::PoolTimedOut, "db", "query");
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
