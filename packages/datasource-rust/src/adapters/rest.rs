//! REST adapter: queries are endpoint templates resolved against a base URL.

use std::sync::Arc;

use apex_data_core::{
    ConnectionStatus, DataSourceConfiguration, DataSourceError, DataSourceMetrics, DataSourceType,
    Params, Record, Result, Value,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder};

use super::{bind_positional, data_cache_key, substitute_braces, AdapterCore};
use crate::resilience::{CacheLookup, TtlCache};
use crate::traits::ExternalDataSource;

const USER_AGENT: &str = concat!("apex-datasource/", env!("CARGO_PKG_VERSION"));

pub struct RestApiDataSource {
    core: AdapterCore,
    http: reqwest::Client,
    cache: RwLock<Option<Arc<TtlCache<Value>>>>,
}

impl RestApiDataSource {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            core: AdapterCore::new(),
            http,
            cache: RwLock::new(None),
        }
    }

    fn cache(&self) -> Option<Arc<TtlCache<Value>>> {
        self.cache.read().clone()
    }

    /// Reloads a stale `get_data` entry off the caller's path.
    fn schedule_refresh(&self, cache: Arc<TtlCache<Value>>, key: String, url: String) {
        let http = self.http.clone();
        let config = self.core.config();
        tokio::spawn(async move {
            match call(&http, &config, Method::GET, &url).await {
                Ok(Value::Null) => {
                    cache.remove(&key);
                }
                Ok(value) => cache.put(key, value),
                Err(err) => {
                    tracing::warn!(source = %config.name, key = %key, error = %err, "refresh-ahead reload failed");
                }
            }
        });
    }

    /// Calls the health endpoint; any 2xx is healthy.
    async fn check_health(&self) -> Result<()> {
        let config = self.core.config();
        let url = health_url(&config)?;
        call(&self.http, &config, Method::GET, &url).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

fn base_url(config: &DataSourceConfiguration) -> Result<&str> {
    config
        .connection
        .as_ref()
        .and_then(|c| c.base_url.as_deref())
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            DataSourceError::configuration("REST API data source requires baseUrl configuration")
        })
}

/// Joins `endpoint` onto the base URL unless it is already absolute.
fn resolve_url(config: &DataSourceConfiguration, endpoint: &str) -> Result<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let base = base_url(config)?;
    Ok(match (base.ends_with('/'), endpoint.starts_with('/')) {
        (true, true) => format!("{base}{}", &endpoint[1..]),
        (false, false) => format!("{base}/{endpoint}"),
        _ => format!("{base}{endpoint}"),
    })
}

fn health_url(config: &DataSourceConfiguration) -> Result<String> {
    match config.health_check.as_ref().and_then(|h| h.endpoint.as_deref()) {
        Some(endpoint) => resolve_url(config, endpoint),
        None => Ok(format!("{}/health", base_url(config)?.trim_end_matches('/'))),
    }
}

/// Named query first, then named endpoint, else the text itself.
fn resolve_named<'a>(config: &'a DataSourceConfiguration, query: &'a str) -> &'a str {
    config
        .queries
        .get(query)
        .or_else(|| config.endpoints.get(query))
        .map_or(query, String::as_str)
}

fn with_headers(config: &DataSourceConfiguration, mut request: RequestBuilder) -> RequestBuilder {
    if let Some(connection) = &config.connection {
        request = request.timeout(connection.timeout_duration());
        for (name, value) in &connection.headers {
            request = request.header(name, value);
        }
    }
    request = request
        .header(ACCEPT, "application/json")
        .header(reqwest::header::USER_AGENT, USER_AGENT);

    let Some(auth) = &config.authentication else {
        return request;
    };
    match auth.auth_type.to_ascii_lowercase().as_str() {
        "basic" => {
            if let Some(user) = &auth.username {
                request = request.basic_auth(user, auth.password.as_deref());
            }
        }
        "bearer" | "token" => {
            if let Some(token) = &auth.token {
                request = request.header(&auth.token_header, format!("{}{token}", auth.token_prefix));
            }
        }
        "api-key" | "apikey" => {
            if let Some(key) = &auth.api_key {
                request = request.header(&auth.api_key_header, key);
            }
        }
        _ => {}
    }
    request
}

fn classify_http_error(err: &reqwest::Error) -> DataSourceError {
    let message = format!("REST API call failed: {err}");
    if err.is_timeout() {
        DataSourceError::timeout(message)
    } else if err.is_connect() {
        DataSourceError::connection(message)
    } else if err.is_builder() {
        DataSourceError::configuration(message)
    } else if err.is_decode() {
        DataSourceError::data_format(message)
    } else {
        DataSourceError::execution(message)
    }
}

/// Sends one request and parses the body. Non-2xx is a retryable
/// `EXECUTION_ERROR`.
async fn call(
    http: &reqwest::Client,
    config: &DataSourceConfiguration,
    method: Method,
    url: &str,
) -> Result<Value> {
    tracing::trace!(source = %config.name, %method, url, "rest call");
    let response = with_headers(config, http.request(method, url))
        .send()
        .await
        .map_err(|e| classify_http_error(&e).with_cause(e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(DataSourceError::execution(format!(
            "API call failed with status: {}",
            status.as_u16()
        ))
        .with_retryable(true));
    }
    let body = response
        .text()
        .await
        .map_err(|e| classify_http_error(&e).with_cause(e))?;
    Ok(parse_body(&body))
}

/// JSON bodies become structured values; anything else is kept as text.
fn parse_body(body: &str) -> Value {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(json) => Value::from(json),
        Err(_) => Value::String(body.to_string()),
    }
}

fn into_records(value: Value) -> Vec<Record> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().map(into_record).collect(),
        other => vec![into_record(other)],
    }
}

fn into_record(value: Value) -> Record {
    match value {
        Value::Map(record) => record,
        other => Record::from([("value".to_string(), other)]),
    }
}

// ---------------------------------------------------------------------------
// ExternalDataSource
// ---------------------------------------------------------------------------

#[async_trait]
impl ExternalDataSource for RestApiDataSource {
    fn configuration(&self) -> Arc<DataSourceConfiguration> {
        self.core.config()
    }

    fn source_type(&self) -> DataSourceType {
        DataSourceType::RestApi
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
        if let Err(err) = base_url(config) {
            let err = err.in_context(&config.name, "initialize");
            self.core.connect_failed(&err);
            return Err(err);
        }
        if config.cache_enabled() {
            if let Some(cache_config) = &config.cache {
                *self.cache.write() = Some(Arc::new(TtlCache::new(
                    cache_config,
                    Some(self.core.metrics()),
                )));
            }
        }
        // Reachability is checked on demand, not here.
        self.core.connect_succeeded("REST API data source initialized");
        tracing::info!(source = %config.name, "rest api data source initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.core.set_status(ConnectionStatus::shutting_down());
        if let Some(cache) = self.cache.write().take() {
            cache.clear();
        }
        self.core.set_status(ConnectionStatus::shutdown());
        tracing::debug!(source = %self.core.name(), "rest api data source shut down");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.core.status().is_operational() && self.test_connection().await
    }

    async fn test_connection(&self) -> bool {
        match self.check_health().await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(source = %self.core.name(), error = %err, "rest api connection test failed");
                false
            }
        }
    }

    async fn get_data(&self, data_type: &str, params: &[Value]) -> Result<Option<Value>> {
        self.core.ensure_operational("get_data")?;
        let config = self.core.config();
        let Some(template) = config
            .endpoints
            .get(data_type)
            .or_else(|| config.endpoints.get("default"))
        else {
            return Err(DataSourceError::configuration(format!(
                "No endpoint defined for data type: {data_type}"
            ))
            .in_context(&config.name, "get_data"));
        };
        let bound = bind_positional(&config.parameter_names, params);
        let endpoint = substitute_braces(template, &bound);
        let url = resolve_url(&config, &endpoint).map_err(|e| e.in_context(&config.name, "get_data"))?;
        let key = data_cache_key(data_type, params);
        let cache = self.cache();
        if let Some(cache) = &cache {
            match cache.lookup(&key) {
                CacheLookup::Hit(value) => return Ok(Some(value)),
                CacheLookup::Stale(value) => {
                    self.schedule_refresh(Arc::clone(cache), key, url);
                    return Ok(Some(value));
                }
                CacheLookup::Miss => {}
            }
        }

        let value = self
            .core
            .timed("get_data", call(&self.http, &config, Method::GET, &url))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        if let Some(cache) = &cache {
            cache.put(key, value.clone());
        }
        Ok(Some(value))
    }

    async fn query(&self, query: &str, params: &Params) -> Result<Vec<Record>> {
        self.core.ensure_operational("query")?;
        let config = self.core.config();
        let endpoint = substitute_braces(resolve_named(&config, query), params);
        let records = self
            .core
            .timed("query", async {
                let url = resolve_url(&config, &endpoint)?;
                let body = call(&self.http, &config, Method::GET, &url).await?;
                Ok::<_, DataSourceError>(into_records(body))
            })
            .await?;
        self.core
            .metrics()
            .record_records_processed(records.len() as u64);
        Ok(records)
    }

    /// POSTs to each endpoint in order; stops at the first failure.
    async fn batch_update(&self, statements: &[String]) -> Result<Vec<u64>> {
        self.core.ensure_operational("batch_update")?;
        let config = self.core.config();
        self.core
            .timed("batch_update", async {
                let mut counts = Vec::with_capacity(statements.len());
                for statement in statements {
                    let url = resolve_url(&config, resolve_named(&config, statement))?;
                    call(&self.http, &config, Method::POST, &url).await?;
                    counts.push(1);
                }
                Ok::<_, DataSourceError>(counts)
            })
            .await
    }

    async fn refresh(&self) -> Result<()> {
        if let Some(cache) = self.cache() {
            cache.clear();
        }
        match self.check_health().await {
            Ok(()) => {
                self.core.connect_succeeded("REST API refreshed");
                tracing::info!(source = %self.core.name(), "rest api data source refreshed");
                Ok(())
            }
            Err(err) => {
                let err = DataSourceError::connection("REST API is not available")
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

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use apex_data_core::{AuthenticationConfig, CacheConfig, ConnectionConfig, ErrorKind};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(server: &MockServer) -> DataSourceConfiguration {
        DataSourceConfiguration {
            connection: Some(ConnectionConfig {
                base_url: Some(server.uri()),
                ..ConnectionConfig::default()
            }),
            endpoints: BTreeMap::from([("user".to_string(), "/users/{id}".to_string())]),
            queries: BTreeMap::from([("all-users".to_string(), "users".to_string())]),
            parameter_names: vec!["id".into()],
            ..DataSourceConfiguration::new("users-api", DataSourceType::RestApi)
        }
    }

    async fn adapter(config: &DataSourceConfiguration) -> RestApiDataSource {
        let ds = RestApiDataSource::new(reqwest::Client::new());
        ds.initialize(config).await.unwrap();
        ds
    }

    #[test]
    fn url_joining() {
        let mut cfg = DataSourceConfiguration::new("api", DataSourceType::RestApi);
        cfg.connection = Some(ConnectionConfig {
            base_url: Some("http://api.local/v1/".into()),
            ..ConnectionConfig::default()
        });
        assert_eq!(resolve_url(&cfg, "/users").unwrap(), "http://api.local/v1/users");
        assert_eq!(resolve_url(&cfg, "users").unwrap(), "http://api.local/v1/users");
        assert_eq!(resolve_url(&cfg, "https://other/x").unwrap(), "https://other/x");
        assert_eq!(health_url(&cfg).unwrap(), "http://api.local/v1/health");
    }

    #[tokio::test]
    async fn missing_base_url_is_a_configuration_error() {
        let ds = RestApiDataSource::new(reqwest::Client::new());
        let cfg = DataSourceConfiguration::new("api", DataSourceType::RestApi);
        let err = ds.initialize(&cfg).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn query_maps_arrays_and_objects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"id": 1, "name": "ada"}, {"id": 2, "name": "grace"}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 2, "name": "grace"})))
            .mount(&server)
            .await;
        let ds = adapter(&config(&server)).await;

        let all = ds.query("all-users", &Params::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["name"], Value::from("ada"));

        let mut params = Params::new();
        params.insert("id".into(), Value::Int(2));
        let one = ds.query("user", &params).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0]["id"], Value::Int(2));
        assert_eq!(ds.metrics().records_processed(), 3);
    }

    #[tokio::test]
    async fn non_success_status_is_retryable_execution_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let ds = adapter(&config(&server)).await;
        let err = ds.query("/broken", &Params::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.is_retryable());
        assert_eq!(err.message(), "API call failed with status: 503");
        assert_eq!(err.operation(), Some("query"));
        assert_eq!(ds.metrics().failed_requests(), 1);
    }

    #[tokio::test]
    async fn get_data_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7})))
            .expect(1)
            .mount(&server)
            .await;
        let mut cfg = config(&server);
        cfg.cache = Some(CacheConfig {
            enabled: true,
            ..CacheConfig::default()
        });
        let ds = adapter(&cfg).await;

        let first = ds.get_data("user", &[Value::Int(7)]).await.unwrap().unwrap();
        let second = ds.get_data("user", &[Value::Int(7)]).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(ds.metrics().cache_hits(), 1);
        assert_eq!(ds.metrics().cache_misses(), 1);

        let err = ds.get_data("orders", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn authentication_headers_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secure"))
            .and(header("X-API-Key", "s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("Authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let mut cfg = config(&server);
        cfg.authentication = Some(AuthenticationConfig {
            auth_type: "api-key".into(),
            api_key: Some("s3cret".into()),
            ..AuthenticationConfig::default()
        });
        let ds = adapter(&cfg).await;
        assert_eq!(ds.query("/secure", &Params::new()).await.unwrap().len(), 1);

        cfg.authentication = Some(AuthenticationConfig {
            auth_type: "bearer".into(),
            token: Some("abc".into()),
            ..AuthenticationConfig::default()
        });
        let ds = adapter(&cfg).await;
        assert_eq!(ds.query("/token", &Params::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_update_posts_each_entry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/run"))
            .respond_with(ResponseTemplate::new(204))
            .expect(2)
            .mount(&server)
            .await;
        let ds = adapter(&config(&server)).await;
        let counts = ds
            .batch_update(&["/jobs/run".to_string(), "jobs/run".to_string()])
            .await
            .unwrap();
        assert_eq!(counts, vec![1, 1]);
    }

    #[tokio::test]
    async fn health_and_refresh_follow_the_health_endpoint() {
        let server = MockServer::start().await;
        let ds = adapter(&config(&server)).await;
        assert!(!ds.test_connection().await);
        let err = ds.refresh().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(err.message(), "REST API is not available");

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(ds.test_connection().await);
        ds.refresh().await.unwrap();
        assert!(ds.is_healthy().await);

        ds.shutdown().await.unwrap();
        assert!(!ds.is_healthy().await);
        assert!(ds.query("/health", &Params::new()).await.is_err());
    }
}
