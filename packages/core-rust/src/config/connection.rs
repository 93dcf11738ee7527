use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Connection parameters. Which fields matter depends on the backend type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConnectionConfig {
    // --- Database ---
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_enabled: bool,
    pub connection_pool: Option<ConnectionPoolConfig>,

    // --- HTTP ---
    pub base_url: Option<String>,
    /// Request timeout in milliseconds.
    pub timeout: u64,
    pub retry_attempts: u32,
    /// Delay between retries in milliseconds.
    pub retry_delay: u64,
    pub headers: BTreeMap<String, String>,

    // --- Message queue ---
    pub bootstrap_servers: Option<String>,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,

    // --- File system ---
    pub base_path: Option<String>,
    pub file_pattern: Option<String>,
    /// Poll interval in seconds. `None` or 0 disables polling.
    pub polling_interval: Option<u64>,
    pub encoding: String,

    pub custom_properties: BTreeMap<String, Value>,
}

impl ConnectionConfig {
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            database: None,
            schema: None,
            username: None,
            password: None,
            ssl_enabled: false,
            connection_pool: None,
            base_url: None,
            timeout: 30_000,
            retry_attempts: 3,
            retry_delay: 1_000,
            headers: BTreeMap::new(),
            bootstrap_servers: None,
            security_protocol: None,
            sasl_mechanism: None,
            base_path: None,
            file_pattern: None,
            polling_interval: None,
            encoding: "UTF-8".to_string(),
            custom_properties: BTreeMap::new(),
        }
    }
}

/// Pool sizing for database connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConnectionPoolConfig {
    /// `false` selects the pool-less implementation.
    pub enabled: bool,
    pub min_size: u32,
    pub max_size: u32,
    /// Milliseconds to wait for a free connection.
    pub connection_timeout: u64,
    /// Milliseconds before an idle connection is closed.
    pub idle_timeout: u64,
    /// Milliseconds before a connection is recycled.
    pub max_lifetime: u64,
    pub validation_query: Option<String>,
    pub test_on_borrow: bool,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 1,
            max_size: 10,
            connection_timeout: 30_000,
            idle_timeout: 600_000,
            max_lifetime: 1_800_000,
            validation_query: None,
            test_on_borrow: true,
        }
    }
}

/// Credentials attached to outgoing HTTP requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthenticationConfig {
    /// `none`, `basic`, `bearer` or `api-key`.
    #[serde(rename = "type")]
    pub auth_type: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub token_header: String,
    pub token_prefix: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            auth_type: "none".to_string(),
            username: None,
            password: None,
            token: None,
            token_header: "Authorization".to_string(),
            token_prefix: "Bearer ".to_string(),
            api_key: None,
            api_key_header: "X-API-Key".to_string(),
        }
    }
}

/// Periodic health probing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub log_failures: bool,
    /// Health endpoint for REST sources, relative to the base URL.
    pub endpoint: Option<String>,
    pub query: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            timeout_seconds: 10,
            failure_threshold: 3,
            success_threshold: 1,
            log_failures: true,
            endpoint: None,
            query: None,
        }
    }
}
