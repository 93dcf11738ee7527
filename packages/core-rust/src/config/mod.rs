//! Configuration value objects consumed by the data layer.
//!
//! Produced by an external loader (YAML or JSON) and read-only afterwards.
//! Every struct deserializes from kebab-case keys and fills unset fields
//! from its `Default` impl.

mod cache;
mod circuit_breaker;
mod connection;
mod file_format;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use cache::{CacheConfig, EvictionPolicy};
pub use circuit_breaker::CircuitBreakerConfig;
pub use connection::{
    AuthenticationConfig, ConnectionConfig, ConnectionPoolConfig, HealthCheckConfig,
};
pub use file_format::{FieldDefinition, FileFormatConfig};

use crate::error::{DataSourceError, Result};
use crate::types::{DataSourceType, Value};

/// Recipe for one backend instance, identified by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DataSourceConfiguration {
    pub name: String,
    pub description: Option<String>,
    /// Backend category as written in configuration (`database`, `rest-api`, ...).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Concrete technology inside the category (`postgresql`, `kafka`, `redis`, ...).
    pub source_type: Option<String>,
    /// Provider key for custom sources.
    pub implementation: Option<String>,
    pub enabled: bool,
    pub connection: Option<ConnectionConfig>,
    pub cache: Option<CacheConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub health_check: Option<HealthCheckConfig>,
    pub file_format: Option<FileFormatConfig>,
    pub authentication: Option<AuthenticationConfig>,
    /// Named queries; `default` is used when no other name matches.
    pub queries: BTreeMap<String, String>,
    /// Named REST endpoints.
    pub endpoints: BTreeMap<String, String>,
    /// Names bound, in order, to positional `get_data` parameters.
    pub parameter_names: Vec<String>,
    pub topics: Vec<String>,
    pub key_patterns: Vec<String>,
    pub tags: Vec<String>,
    pub data_type: Option<String>,
    pub custom_properties: BTreeMap<String, Value>,
}

impl DataSourceConfiguration {
    /// A minimal enabled configuration of the given type.
    #[must_use]
    pub fn new(name: impl Into<String>, data_source_type: DataSourceType) -> Self {
        Self {
            name: name.into(),
            type_name: data_source_type.config_value().to_string(),
            ..Self::default()
        }
    }

    /// The parsed backend category, if `type_name` is valid.
    #[must_use]
    pub fn data_source_type(&self) -> Option<DataSourceType> {
        DataSourceType::from_config_value(&self.type_name)
    }

    /// `source_type` lowercased, falling back to the category value.
    #[must_use]
    pub fn source_type_or_default(&self) -> String {
        self.source_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.type_name)
            .to_ascii_lowercase()
    }

    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.cache.as_ref().is_some_and(|c| c.enabled)
    }

    #[must_use]
    pub fn circuit_breaker_enabled(&self) -> bool {
        self.circuit_breaker.as_ref().is_some_and(|c| c.enabled)
    }

    /// Loader-independent structural checks.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIGURATION_ERROR` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(DataSourceError::configuration(msg).with_operation("validate"));

        if self.name.trim().is_empty() {
            return fail("Data source name is required".to_string());
        }
        if self.type_name.trim().is_empty() {
            return fail("Data source type is required".to_string());
        }
        let Some(kind) = self.data_source_type() else {
            return fail(format!("Invalid data source type: {}", self.type_name));
        };

        match kind {
            DataSourceType::Database if self.connection.is_none() => fail(
                "Connection configuration is required for database data sources".to_string(),
            ),
            DataSourceType::RestApi
                if self
                    .connection
                    .as_ref()
                    .and_then(|c| c.base_url.as_deref())
                    .is_none_or(|url| url.trim().is_empty()) =>
            {
                fail("Base URL is required for REST API data sources".to_string())
            }
            DataSourceType::Custom
                if self
                    .implementation
                    .as_deref()
                    .is_none_or(|i| i.trim().is_empty()) =>
            {
                fail("Implementation class is required for custom data sources".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl Default for DataSourceConfiguration {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            type_name: String::new(),
            source_type: None,
            implementation: None,
            enabled: true,
            connection: None,
            cache: None,
            circuit_breaker: None,
            health_check: None,
            file_format: None,
            authentication: None,
            queries: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            parameter_names: Vec::new(),
            topics: Vec::new(),
            key_patterns: Vec::new(),
            tags: Vec::new(),
            data_type: None,
            custom_properties: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
