//! Isolated one-shot executions over a shared competing-consumer queue.

use crate::discipline::{Discipline, HeartbeatBoard};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_bus::{DispatchBus, EventHandler, HandlerOutcome, SubscribeOptions};
use maestro_config::{AgentDescriptor, ConfigRegistry};
use maestro_core::{
    routing, AgentMode, ExecutionRecord, ExecutionStatus, MaestroError, MaestroResult, TaskEvent,
};
use maestro_llm::{CompletionRequest, ProviderFactory};
use maestro_state::StateStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue-level retry cap; the per-event `max_retries` (set from the
/// descriptor at submission time) lowers it further.
const POOL_MAX_RETRIES: u32 = 3;
const DEFAULT_PREFETCH: usize = 4;

/// The autonomous discipline: each event runs in a fresh, isolated context
/// with no access to other agents' state.
pub struct AutonomousPool {
    bus: Arc<dyn DispatchBus>,
    worker: Arc<AutonomousWorker>,
    prefetch: usize,
    started: AtomicBool,
}

impl AutonomousPool {
    pub fn new(
        bus: Arc<dyn DispatchBus>,
        store: Arc<StateStore>,
        providers: Arc<dyn ProviderFactory>,
        registry: Arc<ConfigRegistry>,
    ) -> Self {
        let worker = Arc::new(AutonomousWorker {
            bus: Arc::clone(&bus),
            store,
            providers,
            registry,
            heartbeats: HeartbeatBoard::new(),
            active: Mutex::new(HashMap::new()),
        });
        Self {
            bus,
            worker,
            prefetch: DEFAULT_PREFETCH,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    async fn ensure_subscribed(&self) -> MaestroResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let options = SubscribeOptions::new(
            routing::QUEUE_AUTONOMOUS,
            vec![routing::AUTONOMOUS_SUBMITTED.to_string()],
        )
        .with_prefetch(self.prefetch)
        .with_max_retries(POOL_MAX_RETRIES);
        self.bus
            .subscribe(options, Arc::clone(&self.worker) as Arc<dyn EventHandler>)
            .await
    }
}

#[async_trait]
impl Discipline for AutonomousPool {
    fn mode(&self) -> AgentMode {
        AgentMode::Autonomous
    }

    async fn activate(&self, descriptor: Arc<AgentDescriptor>) -> MaestroResult<()> {
        if descriptor.mode != AgentMode::Autonomous {
            return Err(MaestroError::ConfigInvalid(format!(
                "agent '{}' is not autonomous",
                descriptor.name
            )));
        }
        self.ensure_subscribed().await?;
        self.worker.heartbeats.beat(&descriptor.name);
        info!(agent = %descriptor.name, "Autonomous agent activated");
        Ok(())
    }

    async fn deactivate(&self, agent_name: &str) -> MaestroResult<()> {
        // The shared queue keeps running; the orchestrator stops routing to
        // this agent and the handler rejects unknown descriptors.
        self.worker.heartbeats.remove(agent_name);
        info!(agent = %agent_name, "Autonomous agent deactivated");
        Ok(())
    }

    async fn last_heartbeat(&self, agent_name: &str) -> Option<DateTime<Utc>> {
        self.worker.heartbeats.get(agent_name)
    }

    async fn cancel(&self, execution_id: Uuid) -> bool {
        let sender = {
            let active = self.worker.active.lock().unwrap_or_else(|e| e.into_inner());
            active.get(&execution_id).cloned()
        };
        match sender {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    async fn shutdown(&self) -> MaestroResult<()> {
        if self.started.load(Ordering::SeqCst) {
            self.bus.unsubscribe(routing::QUEUE_AUTONOMOUS).await?;
        }
        Ok(())
    }
}

struct AutonomousWorker {
    bus: Arc<dyn DispatchBus>,
    store: Arc<StateStore>,
    providers: Arc<dyn ProviderFactory>,
    registry: Arc<ConfigRegistry>,
    heartbeats: HeartbeatBoard,
    active: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

enum CallOutcome {
    Success(maestro_llm::Completion),
    Provider(maestro_llm::LlmError),
    TimedOut(u64),
    Cancelled,
}

impl AutonomousWorker {
    async fn fail_execution(&self, record: &mut ExecutionRecord, error: &MaestroError) {
        record.mark_failed(error.to_string());
        if let Err(e) = self.store.update_execution(record).await {
            warn!(execution_id = %record.execution_id, error = %e, "Could not persist failed record");
        }
    }

    async fn run(&self, event: TaskEvent) -> HandlerOutcome {
        let Some(agent_name) = event.agent_name.clone() else {
            return HandlerOutcome::Fatal(MaestroError::Permanent(
                "event carries no agent_name".into(),
            ));
        };

        let Some(descriptor) = self.registry.get(&agent_name) else {
            return HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "unknown agent '{agent_name}'"
            )));
        };
        if descriptor.mode != AgentMode::Autonomous {
            return HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "agent '{agent_name}' is {}, not autonomous",
                descriptor.mode
            )));
        }
        self.heartbeats.beat(&agent_name);

        let execution_id = event.execution_id.unwrap_or_else(Uuid::new_v4);
        let mut record = match self.store.get_execution(execution_id).await {
            Ok(Some(existing)) if existing.is_terminal() => {
                // Redelivered event: keep the terminal record, re-announce
                // the completion so downstream waiters are not starved.
                if existing.status == ExecutionStatus::Completed {
                    if let Some(result) = existing.result.clone() {
                        let completed = TaskEvent::derived(
                            &event,
                            routing::AUTONOMOUS_COMPLETED,
                            result,
                        )
                        .with_execution_id(execution_id);
                        if let Err(e) = self
                            .bus
                            .publish(routing::AUTONOMOUS_COMPLETED, &completed, true)
                            .await
                        {
                            warn!(error = %e, "Could not re-announce completed execution");
                        }
                    }
                }
                debug!(execution_id = %execution_id, "Duplicate delivery for terminal execution");
                return HandlerOutcome::Ok;
            }
            Ok(Some(existing)) => existing,
            Ok(None) => {
                let mut record = ExecutionRecord::new(&agent_name, event.trace_id);
                record.execution_id = execution_id;
                record.submitted_at = event.timestamp;
                record
            }
            Err(e) => return HandlerOutcome::Retryable(e),
        };

        record.mark_running();
        record.retries = event.retry_count;
        match self.store.update_execution(&record).await {
            Ok(true) => {}
            Ok(false) => return HandlerOutcome::Ok,
            Err(e) => return HandlerOutcome::Retryable(e),
        }

        let Some(prompt) = event.payload["prompt"]
            .as_str()
            .or_else(|| event.payload["message"].as_str())
            .map(str::to_string)
        else {
            let err = MaestroError::Permanent("payload carries no prompt".into());
            self.fail_execution(&mut record, &err).await;
            return HandlerOutcome::Fatal(err);
        };

        let provider = match self.providers.create(&descriptor.llm) {
            Ok(provider) => provider,
            Err(e) => {
                self.fail_execution(&mut record, &e).await;
                return HandlerOutcome::Fatal(e);
            }
        };

        // Isolated context: nothing but the descriptor's prompt and this
        // event's payload.
        let request = CompletionRequest::new(
            &descriptor.llm,
            vec![maestro_core::ChatMessage::user(prompt)],
        )
        .with_system_prompt(descriptor.system_prompt.clone());

        let timeout_seconds = event.payload["timeout_seconds"]
            .as_u64()
            .unwrap_or(descriptor.resource_limits.max_execution_time_seconds);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(execution_id, cancel_tx);
        }

        let outcome = tokio::select! {
            result = tokio::time::timeout(
                Duration::from_secs(timeout_seconds),
                provider.complete(&request),
            ) => match result {
                Ok(Ok(completion)) => CallOutcome::Success(completion),
                Ok(Err(err)) => CallOutcome::Provider(err),
                Err(_) => CallOutcome::TimedOut(timeout_seconds),
            },
            _ = cancel_rx.changed() => CallOutcome::Cancelled,
        };

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(&execution_id);
        }
        self.heartbeats.beat(&agent_name);

        match outcome {
            CallOutcome::Success(completion) => {
                let result = serde_json::json!({
                    "answer": completion.text,
                    "model": completion.model,
                });
                record.mark_completed(result.clone());
                if let Err(e) = self.store.update_execution(&record).await {
                    return HandlerOutcome::Retryable(e);
                }
                let completed =
                    TaskEvent::derived(&event, routing::AUTONOMOUS_COMPLETED, result)
                        .with_execution_id(execution_id);
                if let Err(e) = self
                    .bus
                    .publish(routing::AUTONOMOUS_COMPLETED, &completed, true)
                    .await
                {
                    return HandlerOutcome::Retryable(e);
                }
                info!(agent = %agent_name, execution_id = %execution_id, "Autonomous task completed");
                HandlerOutcome::Ok
            }
            CallOutcome::Provider(err) if err.is_transient() => {
                let effective_max = event.max_retries.min(POOL_MAX_RETRIES);
                let core_err: MaestroError = err.into();
                record.retries = event.retry_count + 1;
                if event.retry_count >= effective_max {
                    // Final attempt: the bus dead-letters and announces the
                    // failure; the record goes terminal here.
                    self.fail_execution(&mut record, &core_err).await;
                } else if let Err(e) = self.store.update_execution(&record).await {
                    warn!(execution_id = %execution_id, error = %e, "Could not persist retry count");
                }
                HandlerOutcome::Retryable(core_err)
            }
            CallOutcome::Provider(err) => {
                let core_err: MaestroError = err.into();
                self.fail_execution(&mut record, &core_err).await;
                HandlerOutcome::Fatal(core_err)
            }
            CallOutcome::TimedOut(seconds) => {
                record.mark_timeout();
                if let Err(e) = self.store.update_execution(&record).await {
                    warn!(execution_id = %execution_id, error = %e, "Could not persist timeout");
                }
                let timeout_event = TaskEvent::derived(
                    &event,
                    routing::AUTONOMOUS_TIMEOUT,
                    serde_json::json!({"timeout_seconds": seconds}),
                )
                .with_execution_id(execution_id);
                if let Err(e) = self
                    .bus
                    .publish(routing::AUTONOMOUS_TIMEOUT, &timeout_event, true)
                    .await
                {
                    warn!(error = %e, "Could not publish timeout event");
                }
                warn!(agent = %agent_name, execution_id = %execution_id, seconds, "Autonomous task timed out");
                HandlerOutcome::Ok
            }
            CallOutcome::Cancelled => {
                // The orchestrator already transitioned the record; the
                // in-flight provider call is abandoned.
                info!(agent = %agent_name, execution_id = %execution_id, "Autonomous task cancelled");
                HandlerOutcome::Ok
            }
        }
    }
}

#[async_trait]
impl EventHandler for AutonomousWorker {
    async fn handle(&self, event: TaskEvent) -> HandlerOutcome {
        self.run(event).await
    }
}
