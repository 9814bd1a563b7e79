use chrono::{DateTime, Utc};
use maestro_config::AgentDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Registered,
    Starting,
    Healthy,
    Degraded,
    Failed,
    Stopped,
}

/// One agent's registration, owned exclusively by the orchestrator.
#[derive(Clone)]
pub struct AgentRegistration {
    pub descriptor: Arc<AgentDescriptor>,
    pub status: AgentStatus,
    pub restart_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub active_executions: u32,
    pub status_reason: Option<String>,
}

impl AgentRegistration {
    pub fn new(descriptor: Arc<AgentDescriptor>) -> Self {
        Self {
            descriptor,
            status: AgentStatus::Registered,
            restart_count: 0,
            last_heartbeat: None,
            active_executions: 0,
            status_reason: None,
        }
    }
}

/// The registration map. Written only by the orchestrator supervisor;
/// everyone else reads snapshots.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<HashMap<String, AgentRegistration>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, registration: AgentRegistration) {
        let name = registration.descriptor.name.clone();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(name, registration);
    }

    pub fn remove(&self, agent_name: &str) -> Option<AgentRegistration> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(agent_name)
    }

    pub fn get(&self, agent_name: &str) -> Option<AgentRegistration> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(agent_name).cloned()
    }

    pub fn snapshot(&self) -> Vec<AgentRegistration> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<AgentRegistration> = inner.values().cloned().collect();
        all.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        all
    }

    pub fn set_status(&self, agent_name: &str, status: AgentStatus, reason: Option<String>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(registration) = inner.get_mut(agent_name) {
            registration.status = status;
            registration.status_reason = reason;
        }
    }

    pub fn record_heartbeat(&self, agent_name: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(registration) = inner.get_mut(agent_name) {
            registration.last_heartbeat = Some(at);
        }
    }

    pub fn set_restart_count(&self, agent_name: &str, count: u32) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(registration) = inner.get_mut(agent_name) {
            registration.restart_count = count;
        }
    }

    /// Swap the descriptor after a hot reload, resetting restart bookkeeping.
    pub fn replace_descriptor(&self, agent_name: &str, descriptor: Arc<AgentDescriptor>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(registration) = inner.get_mut(agent_name) {
            registration.descriptor = descriptor;
            registration.restart_count = 0;
        }
    }

    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.keys().cloned().collect()
    }
}
