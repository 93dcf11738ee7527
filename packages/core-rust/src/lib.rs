//! Apex data layer core: configuration values, the error taxonomy,
//! per-source metrics and connection status.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod status;
pub mod types;

pub use config::{
    AuthenticationConfig, CacheConfig, CircuitBreakerConfig, ConnectionConfig,
    ConnectionPoolConfig, DataSourceConfiguration, EvictionPolicy, FieldDefinition,
    FileFormatConfig, HealthCheckConfig,
};
pub use context::QueryContext;
pub use error::{DataSourceError, ErrorKind, Result};
pub use metrics::{DataSourceMetrics, MetricsSnapshot};
pub use status::{ConnectionState, ConnectionStatus};
pub use types::{DataSourceType, Params, Record, Value};
