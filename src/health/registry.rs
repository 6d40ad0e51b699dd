use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Last report of one monitored component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    #[serde(skip)]
    pub component: String,
    pub healthy: bool,
    pub details: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Ok,
    Error,
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: AggregateStatus,
    pub components: BTreeMap<String, HealthRecord>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == AggregateStatus::Ok
    }
}

/// Component name -> latest health record, shared by the probes that write
/// it and the endpoint that reads it.
///
/// Cloning is cheap and yields a handle to the same table. Reads and writes
/// take the same lock, so a snapshot never contains a half-written record.
/// An empty registry reports `ok`: before any probe has run there is nothing
/// known to be broken, and the endpoint must answer from the first instant.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, HealthRecord>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the record for `component`. Last write wins.
    pub fn update(&self, component: &str, healthy: bool, details: impl Into<String>) {
        let record = HealthRecord {
            component: component.to_string(),
            healthy,
            details: details.into(),
            observed_at: Utc::now(),
        };

        // Poisoning is ignored: the insert below is the only mutation.
        let mut components = self
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        components.insert(record.component.clone(), record);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let status = if components.values().all(|c| c.healthy) {
            AggregateStatus::Ok
        } else {
            AggregateStatus::Error
        };

        HealthSnapshot { status, components }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_registry_is_ok() {
        let snapshot = HealthRegistry::new().snapshot();
        assert_eq!(snapshot.status, AggregateStatus::Ok);
        assert!(snapshot.components.is_empty());
    }

    #[test]
    fn database_recovers() {
        let registry = HealthRegistry::new();

        registry.update("database", false, "timeout");
        assert_eq!(registry.snapshot().status, AggregateStatus::Error);

        registry.update("database", true, "");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.status, AggregateStatus::Ok);
        assert_eq!(snapshot.components["database"].details, "");
    }

    #[test]
    fn last_update_wins() {
        let registry = HealthRegistry::new();
        let calls = [
            ("database", true, "Connected"),
            ("recording", false, "workspace missing"),
            ("database", false, "Connection failed"),
            ("recording", true, "Recording active"),
            ("database", true, "Connected again"),
        ];
        for (component, healthy, details) in calls {
            registry.update(component, healthy, details);
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.components.len(), 2);
        assert!(snapshot.components["database"].healthy);
        assert_eq!(snapshot.components["database"].details, "Connected again");
        assert_eq!(snapshot.components["recording"].details, "Recording active");
        assert!(snapshot.is_healthy());
    }

    #[test]
    fn one_unhealthy_component_fails_the_aggregate() {
        let registry = HealthRegistry::new();
        registry.update("database", true, "Connected");
        registry.update("recording", false, "disk full");
        assert!(!registry.snapshot().is_healthy());
    }

    #[test]
    fn concurrent_writers_keep_every_component() {
        let registry = HealthRegistry::new();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let component = format!("probe-{i}");
                    for n in 0..200 {
                        registry.update(&component, n % 2 == 1, format!("cycle {n}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.components.len(), 8);
        for record in snapshot.components.values() {
            assert!(record.healthy);
            assert_eq!(record.details, "cycle 199");
        }
    }

    #[test]
    fn snapshot_serializes_without_component_field() {
        let registry = HealthRegistry::new();
        registry.update("database", false, "timeout");

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["components"]["database"]["healthy"], false);
        assert_eq!(json["components"]["database"]["details"], "timeout");
        assert!(json["components"]["database"].get("component").is_none());
    }
}
