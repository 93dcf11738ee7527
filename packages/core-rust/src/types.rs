use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single row returned by an adapter: column or field name to value.
///
/// Uses `BTreeMap` so records print and serialize in a stable key order.
pub type Record = BTreeMap<String, Value>;

/// Named query parameters (`:name` in SQL, `{name}` in path templates).
pub type Params = BTreeMap<String, Value>;

/// Generic runtime value moved through the data layer.
///
/// Covers every JSON-compatible type plus raw binary data. Serializes
/// untagged, so a `Value` round-trips through JSON as the plain JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null / absent.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit IEEE 754 float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Nested object with deterministic key order.
    Map(BTreeMap<String, Value>),
    /// Binary data (not directly representable in JSON).
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrows the inner string of a [`Value::String`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, converting floats without a fractional part.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Borrows the inner map of a [`Value::Map`].
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Renders the value the way it appears inside a query template or a
    /// cache key: strings unquoted, everything else as compact JSON.
    #[must_use]
    pub fn to_plain_string(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::String(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            other => other.to_json().to_string(),
        }
    }

    /// Converts into a `serde_json::Value`. Bytes become an array of numbers.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Bytes(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
            }
        }
    }

    /// Loose equality used by query filters: compares the plain string
    /// renderings so that `"42"` in a query matches an integer column.
    #[must_use]
    pub fn matches_text(&self, text: &str) -> bool {
        self.to_plain_string() == text
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Self::Map(record)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_plain_string())
    }
}

// ---------------------------------------------------------------------------
// DataSourceType
// ---------------------------------------------------------------------------

/// Category of physical backend an adapter wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSourceType {
    /// Relational database reached through a connection pool.
    Database,
    /// HTTP/JSON endpoint.
    RestApi,
    /// Broker-backed message stream.
    MessageQueue,
    /// Directory of data files.
    FileSystem,
    /// In-process key/value cache.
    Cache,
    /// Provider-supplied implementation.
    Custom,
}

impl DataSourceType {
    /// Every variant, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Database,
        Self::RestApi,
        Self::MessageQueue,
        Self::FileSystem,
        Self::Cache,
        Self::Custom,
    ];

    /// The value used for this type in configuration files.
    #[must_use]
    pub fn config_value(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::RestApi => "rest-api",
            Self::MessageQueue => "message-queue",
            Self::FileSystem => "file-system",
            Self::Cache => "cache",
            Self::Custom => "custom",
        }
    }

    /// Human-readable name.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Database => "Database",
            Self::RestApi => "REST API",
            Self::MessageQueue => "Message Queue",
            Self::FileSystem => "File System",
            Self::Cache => "Cache",
            Self::Custom => "Custom",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Database => "Relational database data source",
            Self::RestApi => "REST API web service data source",
            Self::MessageQueue => "Message queue data source",
            Self::FileSystem => "File system data source",
            Self::Cache => "Cache data source",
            Self::Custom => "Custom data source implementation",
        }
    }

    /// Whether the backend pushes changes as they happen.
    #[must_use]
    pub fn supports_real_time(self) -> bool {
        matches!(self, Self::RestApi | Self::MessageQueue)
    }

    /// Parses a configuration value, ignoring case and surrounding whitespace.
    ///
    /// Returns `None` for blank or unknown values.
    #[must_use]
    pub fn from_config_value(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|t| t.config_value().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
