//! Manager event and statistics payloads.

use std::collections::BTreeMap;

use apex_data_core::MetricsSnapshot;
use serde::Serialize;

use crate::registry::{RegistryEvent, RegistryEventType, RegistryStatistics};

/// Lifecycle event emitted by the manager. Serializes with an `eventType`
/// tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerEvent {
    Initialized { count: usize },
    DataSourceAdded { name: String },
    DataSourceRemoved { name: String },
    HealthRestored { name: String },
    HealthLost { name: String },
    RefreshCompleted { failures: usize },
}

impl ManagerEvent {
    /// Name of the affected data source, for per-source events.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::DataSourceAdded { name }
            | Self::DataSourceRemoved { name }
            | Self::HealthRestored { name }
            | Self::HealthLost { name } => Some(name),
            Self::Initialized { .. } | Self::RefreshCompleted { .. } => None,
        }
    }
}

impl From<&RegistryEvent> for ManagerEvent {
    fn from(event: &RegistryEvent) -> Self {
        let name = event.name.clone();
        match event.event_type {
            RegistryEventType::Registered => Self::DataSourceAdded { name },
            RegistryEventType::Unregistered => Self::DataSourceRemoved { name },
            RegistryEventType::HealthRestored => Self::HealthRestored { name },
            RegistryEventType::HealthLost => Self::HealthLost { name },
        }
    }
}

/// Receives manager events synchronously. Panics are caught and logged.
pub trait ManagerListener: Send + Sync {
    fn on_event(&self, event: &ManagerEvent);
}

impl<F> ManagerListener for F
where
    F: Fn(&ManagerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ManagerEvent) {
        self(event);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatistics {
    pub registry: RegistryStatistics,
    pub metrics: BTreeMap<String, MetricsSnapshot>,
    pub type_groups: usize,
    pub running: bool,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use apex_data_core::DataSourceType;

    use super::*;

    #[test]
    fn registry_events_map_onto_manager_events() {
        let event = RegistryEvent {
            event_type: RegistryEventType::HealthLost,
            name: "orders".into(),
            source_type: DataSourceType::Database,
            timestamp: 0,
        };
        let mapped = ManagerEvent::from(&event);
        assert_eq!(mapped, ManagerEvent::HealthLost { name: "orders".into() });
        assert_eq!(mapped.name(), Some("orders"));
        assert_eq!(ManagerEvent::Initialized { count: 2 }.name(), None);
    }

    #[test]
    fn serializes_with_event_type_tag() {
        let json = serde_json::to_value(ManagerEvent::DataSourceAdded { name: "a".into() }).unwrap();
        assert_eq!(json["eventType"], "DATA_SOURCE_ADDED");
        assert_eq!(json["name"], "a");
    }
}
