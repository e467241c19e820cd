//! Health tracking for the scheduler, storage and individual jobs.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Operational but needs attention, e.g. a job paused by a failure
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall service health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded, e.g. paused jobs
    Degraded,
    /// At least one component is unhealthy
    Unhealthy,
}

/// Component health registry.
pub struct HealthCheck {
    components: RwLock<HashMap<String, ComponentStatus>>,
    ready: RwLock<bool>,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            ready: RwLock::new(false),
        }
    }

    /// Component name used for a job.
    pub fn job_component(job_id: &ulid::Ulid) -> String {
        format!("job:{}", job_id)
    }

    pub fn register_component(&self, name: &str) {
        self.components
            .write()
            .insert(name.to_string(), ComponentStatus::Unknown);
    }

    pub fn remove_component(&self, name: &str) {
        self.components.write().remove(name);
    }

    pub fn mark_healthy(&self, name: &str) {
        self.components
            .write()
            .insert(name.to_string(), ComponentStatus::Healthy);
    }

    pub fn mark_degraded(&self, name: &str, reason: &str) {
        self.components.write().insert(
            name.to_string(),
            ComponentStatus::Degraded(reason.to_string()),
        );
    }

    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        self.components.write().insert(
            name.to_string(),
            ComponentStatus::Unhealthy(reason.to_string()),
        );
    }

    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).cloned()
    }

    pub fn get_all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Unhealthy wins over degraded, which wins over healthy.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();
        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }
        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Mark the service ready to accept jobs.
    pub fn set_ready(&self, ready: bool) {
        *self.ready.write() = ready;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.read() && self.is_operational()
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_lifecycle() {
        let health = HealthCheck::new();
        health.register_component("scheduler");
        health.register_component("storage");
        assert_eq!(
            health.get_component_status("scheduler"),
            Some(ComponentStatus::Unknown)
        );

        health.mark_healthy("scheduler");
        health.mark_healthy("storage");
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        let job = HealthCheck::job_component(&ulid::Ulid::nil());
        health.mark_degraded(&job, "paused after storage failure");
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
        assert!(health.is_operational());

        health.mark_unhealthy("storage", "unreachable");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        assert!(!health.is_operational());

        health.remove_component(&job);
        assert_eq!(health.get_all_statuses().len(), 2);
    }

    #[test]
    fn test_readiness() {
        let health = HealthCheck::default();
        assert!(!health.is_ready());
        health.set_ready(true);
        assert!(health.is_ready());
        health.mark_unhealthy("scheduler", "down");
        assert!(!health.is_ready());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(ComponentStatus::Degraded("slow".into())).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["reason"], "slow");
        assert_eq!(serde_json::to_value(HealthStatus::Healthy).unwrap(), "healthy");
    }
}
