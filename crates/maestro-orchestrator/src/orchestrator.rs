use crate::health::{HealthConfig, HealthMonitor};
use crate::registry::{AgentRegistration, AgentRegistry, AgentStatus};
use chrono::Utc;
use maestro_bus::DispatchBus;
use maestro_config::{AgentDescriptor, ConfigRegistry, ReloadEvent};
use maestro_core::{
    AgentMode, ExecutionRecord, ExecutionStatus, MaestroError, MaestroResult, TaskEvent,
};
use maestro_pools::Discipline;
use maestro_state::StateStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Operator submission input.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub agent_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub trace_id: Option<Uuid>,
}

/// Operator submission output: the record exists (QUEUED) before the event
/// is published.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub execution_id: Uuid,
    pub trace_id: Uuid,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReceipt {
    pub cancelled: bool,
    pub previous_status: ExecutionStatus,
}

/// The orchestration supervisor.
pub struct Orchestrator {
    config_registry: Arc<ConfigRegistry>,
    bus: Arc<dyn DispatchBus>,
    store: Arc<StateStore>,
    agents: Arc<AgentRegistry>,
    disciplines: Arc<HashMap<AgentMode, Arc<dyn Discipline>>>,
    drain_timeout: Duration,
    shutdown_timeout: Duration,
    health_config: HealthConfig,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config_registry: Arc<ConfigRegistry>,
        bus: Arc<dyn DispatchBus>,
        store: Arc<StateStore>,
        disciplines: Vec<Arc<dyn Discipline>>,
    ) -> Self {
        let disciplines: HashMap<AgentMode, Arc<dyn Discipline>> = disciplines
            .into_iter()
            .map(|discipline| (discipline.mode(), discipline))
            .collect();
        Self {
            config_registry,
            bus,
            store,
            agents: Arc::new(AgentRegistry::new()),
            disciplines: Arc::new(disciplines),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            shutdown_timeout: Duration::from_secs(30),
            health_config: HealthConfig::default(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_health_config(mut self, config: HealthConfig) -> Self {
        self.health_config = config;
        self
    }

    /// Register and activate every enabled descriptor, then start health
    /// supervision and the reload listener.
    pub async fn start(self: &Arc<Self>) -> MaestroResult<()> {
        for descriptor in self.config_registry.list_enabled() {
            self.register_and_activate(descriptor).await;
        }

        let monitor = HealthMonitor::new(
            Arc::clone(&self.agents),
            Arc::clone(&self.disciplines),
            Arc::clone(&self.config_registry),
            self.health_config.clone(),
        );
        let health_handle = tokio::spawn(monitor.run());

        let reload_self = Arc::clone(self);
        let mut reload_rx = self.config_registry.subscribe_reload();
        let reload_handle = tokio::spawn(async move {
            loop {
                match reload_rx.recv().await {
                    Ok(event) => reload_self.handle_reload(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reload notifications lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.push(health_handle);
        background.push(reload_handle);
        info!(agents = self.agents.snapshot().len(), "Orchestrator started");
        Ok(())
    }

    /// REGISTERED -> STARTING -> HEALTHY (or FAILED with reason).
    pub async fn register_and_activate(&self, descriptor: Arc<AgentDescriptor>) {
        let name = descriptor.name.clone();
        self.agents
            .insert(AgentRegistration::new(Arc::clone(&descriptor)));
        self.agents.set_status(&name, AgentStatus::Starting, None);

        let Some(discipline) = self.disciplines.get(&descriptor.mode) else {
            error!(agent = %name, mode = %descriptor.mode, "No discipline available");
            self.agents.set_status(
                &name,
                AgentStatus::Failed,
                Some(format!("no discipline for mode '{}'", descriptor.mode)),
            );
            return;
        };

        match discipline.activate(Arc::clone(&descriptor)).await {
            Ok(()) => {
                self.agents.set_status(&name, AgentStatus::Healthy, None);
                self.agents.record_heartbeat(&name, Utc::now());
                info!(agent = %name, mode = %descriptor.mode, "Agent activated");
            }
            Err(e) => {
                error!(agent = %name, error = %e, "Activation failed");
                self.agents
                    .set_status(&name, AgentStatus::Failed, Some(e.to_string()));
            }
        }
    }

    /// Create the QUEUED record, then publish on the mode's routing key.
    pub async fn submit(&self, request: SubmitRequest) -> MaestroResult<SubmitReceipt> {
        let descriptor = self
            .config_registry
            .get(&request.agent_name)
            .ok_or_else(|| {
                MaestroError::NotFound(format!("agent '{}'", request.agent_name))
            })?;

        if let Some(registration) = self.agents.get(&request.agent_name) {
            if matches!(
                registration.status,
                AgentStatus::Failed | AgentStatus::Stopped
            ) {
                return Err(MaestroError::Permanent(format!(
                    "agent '{}' is {:?}",
                    request.agent_name, registration.status
                )));
            }
        }

        let trace_id = request.trace_id.unwrap_or_else(Uuid::new_v4);
        let record = ExecutionRecord::new(&request.agent_name, trace_id);
        self.store.append_execution(&record).await?;

        let mut payload = request.payload;
        if !payload.is_object() {
            payload = serde_json::json!({ "prompt": payload });
        }
        if let (Some(object), Some(timeout)) = (payload.as_object_mut(), request.timeout_seconds)
        {
            object.insert("timeout_seconds".to_string(), serde_json::json!(timeout));
        }

        let route = descriptor.mode.submission_route(&request.agent_name);
        let max_retries = match descriptor.mode {
            AgentMode::Autonomous => descriptor.retry().max_retries,
            _ => 3,
        };
        let event = TaskEvent::new(route.clone(), payload)
            .with_trace_id(trace_id)
            .with_agent(&request.agent_name)
            .with_execution_id(record.execution_id)
            .with_priority(request.priority.unwrap_or(4))
            .with_max_retries(max_retries);

        if let Err(e) = self.bus.publish(&route, &event, true).await {
            let mut failed = record.clone();
            failed.mark_failed(format!("publish failed: {e}"));
            let _ = self.store.update_execution(&failed).await;
            return Err(e);
        }

        info!(
            agent = %request.agent_name,
            execution_id = %record.execution_id,
            trace_id = %trace_id,
            route = %route,
            "Task submitted"
        );
        Ok(SubmitReceipt {
            execution_id: record.execution_id,
            trace_id,
            status: ExecutionStatus::Queued,
        })
    }

    /// Cancel an execution: terminal records are left alone; RUNNING work
    /// gets its context cancelled through the owning discipline.
    pub async fn cancel(&self, execution_id: Uuid) -> MaestroResult<CancelReceipt> {
        let record = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| MaestroError::NotFound(format!("execution {execution_id}")))?;
        let previous_status = record.status;

        if record.is_terminal() {
            return Ok(CancelReceipt {
                cancelled: false,
                previous_status,
            });
        }

        let mut cancelled_record = record;
        cancelled_record.mark_cancelled();
        self.store.update_execution(&cancelled_record).await?;

        if previous_status == ExecutionStatus::Running {
            for discipline in self.disciplines.values() {
                if discipline.cancel(execution_id).await {
                    break;
                }
            }
        }

        info!(execution_id = %execution_id, previous = %previous_status, "Execution cancelled");
        Ok(CancelReceipt {
            cancelled: true,
            previous_status,
        })
    }

    /// Apply a hot-reload notification: drain the old activation, then
    /// activate the new descriptor with restart bookkeeping reset.
    pub async fn handle_reload(&self, event: ReloadEvent) {
        match event {
            ReloadEvent::Updated(name) => {
                let Some(descriptor) = self.config_registry.get(&name) else {
                    return;
                };
                match self.agents.get(&name) {
                    None => {
                        info!(agent = %name, "New descriptor discovered");
                        self.register_and_activate(descriptor).await;
                    }
                    Some(existing) => {
                        info!(agent = %name, "Descriptor changed, restarting activation");
                        self.drain_and_stop(&name, existing.descriptor.mode).await;
                        self.agents.replace_descriptor(&name, Arc::clone(&descriptor));
                        self.agents.set_status(&name, AgentStatus::Starting, None);
                        if let Some(discipline) = self.disciplines.get(&descriptor.mode) {
                            match discipline.activate(descriptor).await {
                                Ok(()) => {
                                    self.agents.set_status(&name, AgentStatus::Healthy, None);
                                    self.agents.record_heartbeat(&name, Utc::now());
                                }
                                Err(e) => self.agents.set_status(
                                    &name,
                                    AgentStatus::Failed,
                                    Some(e.to_string()),
                                ),
                            }
                        }
                    }
                }
            }
            ReloadEvent::Removed(name) => {
                if let Some(existing) = self.agents.get(&name) {
                    info!(agent = %name, "Descriptor removed, stopping agent");
                    self.drain_and_stop(&name, existing.descriptor.mode).await;
                    self.agents.set_status(&name, AgentStatus::Stopped, None);
                    // Registration goes away; durable state and the
                    // continuous queue are retained.
                    self.agents.remove(&name);
                }
            }
        }
    }

    async fn drain_and_stop(&self, agent_name: &str, mode: AgentMode) {
        if let Some(discipline) = self.disciplines.get(&mode) {
            match tokio::time::timeout(self.drain_timeout, discipline.deactivate(agent_name)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(agent = %agent_name, error = %e, "Deactivation failed"),
                Err(_) => warn!(
                    agent = %agent_name,
                    timeout_s = self.drain_timeout.as_secs(),
                    "Drain timed out, abandoning in-flight work"
                ),
            }
        }
    }

    pub fn agents(&self) -> Vec<AgentRegistration> {
        self.agents.snapshot()
    }

    pub fn agent_registry(&self) -> Arc<AgentRegistry> {
        Arc::clone(&self.agents)
    }

    /// Broadcast stop, wait up to the shutdown timeout for in-flight work,
    /// then mark everything stopped. Continuous state is flushed by its
    /// discipline's shutdown.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            for handle in background.drain(..) {
                handle.abort();
            }
        }

        for discipline in self.disciplines.values() {
            match tokio::time::timeout(self.shutdown_timeout, discipline.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Discipline shutdown failed"),
                Err(_) => warn!(
                    timeout_s = self.shutdown_timeout.as_secs(),
                    "Discipline shutdown timed out, cancelling remaining work"
                ),
            }
        }

        for name in self.agents.names() {
            self.agents.set_status(&name, AgentStatus::Stopped, None);
        }
        info!("Orchestrator stopped");
    }
}
