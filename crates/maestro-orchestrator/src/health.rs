use crate::registry::{AgentRegistry, AgentStatus};
use chrono::Utc;
use maestro_config::ConfigRegistry;
use maestro_core::AgentMode;
use maestro_pools::Discipline;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Health supervision tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often registrations are checked.
    pub interval: Duration,
    /// A heartbeat older than this marks the agent DEGRADED.
    pub stale_after: Duration,
    /// Consecutive restarts allowed before the agent goes FAILED.
    pub max_restarts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(180),
            max_restarts: 3,
        }
    }
}

/// Periodic heartbeat checker with bounded restarts.
///
/// Healthy heartbeats reset the restart counter; each stale check schedules
/// an immediate restart, and the fourth consecutive failure parks the agent
/// FAILED until an operator or a descriptor reload intervenes.
pub struct HealthMonitor {
    agents: Arc<AgentRegistry>,
    disciplines: Arc<HashMap<AgentMode, Arc<dyn Discipline>>>,
    config_registry: Arc<ConfigRegistry>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        agents: Arc<AgentRegistry>,
        disciplines: Arc<HashMap<AgentMode, Arc<dyn Discipline>>>,
        config_registry: Arc<ConfigRegistry>,
        config: HealthConfig,
    ) -> Self {
        Self {
            agents,
            disciplines,
            config_registry,
            config,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.check_all().await;
        }
    }

    /// One supervision pass over every supervised registration.
    pub async fn check_all(&self) {
        for registration in self.agents.snapshot() {
            if !matches!(
                registration.status,
                AgentStatus::Healthy | AgentStatus::Degraded
            ) {
                continue;
            }
            let name = registration.descriptor.name.clone();
            let mode = registration.descriptor.mode;
            let Some(discipline) = self.disciplines.get(&mode) else {
                continue;
            };

            let beat = discipline.last_heartbeat(&name).await;
            if let Some(at) = beat {
                self.agents.record_heartbeat(&name, at);
            }
            let stale = match beat {
                Some(at) => {
                    let age = Utc::now() - at;
                    age.to_std().unwrap_or_default() > self.config.stale_after
                }
                None => true,
            };

            if !stale {
                if registration.status == AgentStatus::Degraded
                    || registration.restart_count > 0
                {
                    info!(agent = %name, "Heartbeat recovered");
                    self.agents.set_status(&name, AgentStatus::Healthy, None);
                    self.agents.set_restart_count(&name, 0);
                }
                continue;
            }

            warn!(
                agent = %name,
                restart_count = registration.restart_count,
                "Heartbeat stale, agent degraded"
            );
            self.agents.set_status(
                &name,
                AgentStatus::Degraded,
                Some("heartbeat stale".to_string()),
            );

            if registration.restart_count >= self.config.max_restarts {
                warn!(agent = %name, "Restart budget exhausted, agent failed");
                self.agents.set_status(
                    &name,
                    AgentStatus::Failed,
                    Some(format!(
                        "no heartbeat after {} restarts",
                        registration.restart_count
                    )),
                );
                let _ = discipline.deactivate(&name).await;
                continue;
            }

            self.agents
                .set_restart_count(&name, registration.restart_count + 1);
            let descriptor = self
                .config_registry
                .get(&name)
                .unwrap_or_else(|| Arc::clone(&registration.descriptor));
            if let Err(e) = discipline.deactivate(&name).await {
                warn!(agent = %name, error = %e, "Restart deactivation failed");
            }
            match discipline.activate(descriptor).await {
                Ok(()) => {
                    info!(
                        agent = %name,
                        restart = registration.restart_count + 1,
                        "Agent restarted"
                    );
                    // Healthy again once the next pass sees a fresh beat.
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, "Restart activation failed");
                }
            }
        }
    }
}
