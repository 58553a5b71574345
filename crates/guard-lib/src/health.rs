//! Component health for the `/healthz` and `/readyz` endpoints
//!
//! Every [`Component`] of the guard is tracked from the moment the registry
//! is created. The firewall and ingest only ever degrade: a parked firewall
//! change is retried and a bad poll is followed by the next one, so neither
//! takes the agent out of service. The classifier and tracker are critical:
//! without them no flow can be judged, and the agent reports not ready.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, with failures pending retry
    Degraded,
    Unhealthy,
}

/// Parts of the guard that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Classifier,
    Tracker,
    Firewall,
    Ingest,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Classifier,
        Component::Tracker,
        Component::Firewall,
        Component::Ingest,
    ];

    /// An unhealthy critical component makes the agent not ready
    pub fn is_critical(self) -> bool {
        matches!(self, Component::Classifier | Component::Tracker)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Classifier => "classifier",
            Component::Tracker => "tracker",
            Component::Firewall => "firewall",
            Component::Ingest => "ingest",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix time of the last status change
    pub since: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: chrono::Utc::now().timestamp(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status across components
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct State {
    components: BTreeMap<Component, ComponentHealth>,
    /// Set once startup has finished and cleared on shutdown
    started: bool,
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<State>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// All components healthy, agent not yet started
    pub fn new() -> Self {
        let components = Component::ALL
            .iter()
            .map(|c| (*c, ComponentHealth::new(ComponentStatus::Healthy, None)))
            .collect();
        Self {
            state: Arc::new(RwLock::new(State {
                components,
                started: false,
            })),
        }
    }

    /// Record a status. The timestamp only moves when the status changes.
    async fn set(&self, component: Component, status: ComponentStatus, message: Option<String>) {
        let mut state = self.state.write().await;
        let entry = state
            .components
            .entry(component)
            .or_insert_with(|| ComponentHealth::new(status, None));
        if entry.status != status {
            *entry = ComponentHealth::new(status, message);
        } else {
            entry.message = message;
        }
    }

    pub async fn set_healthy(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, component: Component, message: impl Into<String>) {
        self.set(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.set(component, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    pub async fn status_of(&self, component: Component) -> Option<ComponentStatus> {
        self.state
            .read()
            .await
            .components
            .get(&component)
            .map(|h| h.status)
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.started = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: state.components.clone(),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        if !state.started {
            return ReadinessResponse {
                ready: false,
                reason: Some("Agent not yet started".to_string()),
            };
        }

        let failed = state.components.iter().find(|(component, health)| {
            component.is_critical() && health.status == ComponentStatus::Unhealthy
        });
        match failed {
            Some((component, health)) => ReadinessResponse {
                ready: false,
                reason: Some(match &health.message {
                    Some(message) => format!("{} unhealthy: {}", component, message),
                    None => format!("{} unhealthy", component),
                }),
            },
            None => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_components_start_healthy_but_not_ready() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), Component::ALL.len());
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_firewall_degraded_keeps_agent_ready() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry
            .set_degraded(Component::Firewall, "2 actions pending retry")
            .await;

        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_unhealthy_classifier_not_ready() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry
            .set_unhealthy(Component::Classifier, "classifier is uninitialized")
            .await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("classifier unhealthy: classifier is uninitialized")
        );
    }

    #[tokio::test]
    async fn test_unhealthy_ingest_keeps_agent_ready() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry.set_unhealthy(Component::Ingest, "flow file gone").await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_since_only_moves_on_status_change() {
        let registry = HealthRegistry::new();
        registry.set_degraded(Component::Ingest, "first").await;
        let since = registry.health().await.components[&Component::Ingest].since;

        registry.set_degraded(Component::Ingest, "second").await;
        let health = registry.health().await.components[&Component::Ingest].clone();
        assert_eq!(health.since, since);
        assert_eq!(health.message.as_deref(), Some("second"));
    }

    #[test]
    fn test_component_names_serialize_lowercase() {
        let json = serde_json::to_string(&Component::Firewall).unwrap();
        assert_eq!(json, "\"firewall\"");
        assert_eq!(Component::Tracker.to_string(), "tracker");
    }
}
