//! Apex data layer: one capability set over databases, files, message
//! queues, REST APIs and caches, with circuit breaking, TTL caching, a
//! health-monitored registry and a load-balancing manager.

pub mod adapters;
pub mod factory;
pub mod manager;
pub mod registry;
pub mod resilience;
pub mod telemetry;
pub mod traits;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use factory::{ConnectionFactory, DataSourceFactory};
pub use manager::{
    DataSourceManager, ManagerConfig, ManagerEvent, ManagerListener, ManagerStatistics,
    QueryHandle,
};
pub use registry::{
    DataSourceRegistry, RegistryEvent, RegistryEventType, RegistryListener, RegistryStatistics,
};
pub use resilience::{CircuitBreaker, CircuitState, ResilientDataSource, TtlCache};
pub use traits::{CustomDataSourceProvider, ExternalDataSource};
