use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_config::AgentDescriptor;
use maestro_core::{AgentMode, MaestroResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// The capability every execution discipline exposes to the orchestrator.
#[async_trait]
pub trait Discipline: Send + Sync {
    fn mode(&self) -> AgentMode;

    /// Begin serving an agent: subscribe its queue / register its handler /
    /// arm its schedule.
    async fn activate(&self, descriptor: Arc<AgentDescriptor>) -> MaestroResult<()>;

    /// Stop serving an agent, draining in-flight work. Queues are retained.
    async fn deactivate(&self, agent_name: &str) -> MaestroResult<()>;

    /// Liveness signal for the orchestrator's health supervision.
    async fn last_heartbeat(&self, agent_name: &str) -> Option<DateTime<Utc>>;

    /// Cancel a running execution. Returns whether one was found.
    async fn cancel(&self, execution_id: Uuid) -> bool;

    /// Stop everything this discipline serves and flush durable state.
    async fn shutdown(&self) -> MaestroResult<()>;
}

/// Per-agent liveness timestamps, written by the discipline that serves the
/// agent and snapshot-read by the health monitor.
#[derive(Default)]
pub struct HeartbeatBoard {
    beats: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl HeartbeatBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self, agent_name: &str) {
        let mut beats = self.beats.write().unwrap_or_else(|e| e.into_inner());
        beats.insert(agent_name.to_string(), Utc::now());
    }

    pub fn get(&self, agent_name: &str) -> Option<DateTime<Utc>> {
        let beats = self.beats.read().unwrap_or_else(|e| e.into_inner());
        beats.get(agent_name).copied()
    }

    pub fn remove(&self, agent_name: &str) {
        let mut beats = self.beats.write().unwrap_or_else(|e| e.into_inner());
        beats.remove(agent_name);
    }

    pub fn agents(&self) -> Vec<String> {
        let beats = self.beats.read().unwrap_or_else(|e| e.into_inner());
        beats.keys().cloned().collect()
    }
}
