use std::time::Duration;

use crate::registry::DEFAULT_HEALTH_CHECK_INTERVAL;

/// Tuning for [`DataSourceManager`](super::DataSourceManager) background
/// tasks and the async-query pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Period of the registry health monitor.
    pub health_check_interval: Duration,
    /// Period (and initial delay) of the metrics sweep.
    pub metrics_interval: Duration,
    /// Maximum async queries in flight before new ones are shed.
    pub max_concurrent_queries: usize,
    /// Upper bound on a single async query.
    pub query_timeout: Duration,
    /// How long shutdown waits for in-flight async queries before aborting them.
    pub query_drain_timeout: Duration,
    /// How long shutdown waits for each background task.
    pub task_stop_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            metrics_interval: Duration::from_secs(60),
            max_concurrent_queries: 10,
            query_timeout: Duration::from_secs(30),
            query_drain_timeout: Duration::from_secs(10),
            task_stop_grace: Duration::from_secs(5),
        }
    }
}
