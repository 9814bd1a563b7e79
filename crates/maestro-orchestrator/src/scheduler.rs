//! Time-triggered submissions and their one-shot execution.
//!
//! For every SCHEDULED agent the service runs a ticker (cron or fixed
//! interval) that creates a QUEUED execution record and publishes a
//! `scheduled.task.<name>` event, exactly like an operator submission. The
//! service also consumes `scheduler.ticks` and executes each tick with the
//! schedule's timeout; expiry publishes `scheduled.task.<name>.timeout` and
//! records TIMEOUT.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use maestro_bus::{DispatchBus, EventHandler, HandlerOutcome, SubscribeOptions};
use maestro_config::{AgentDescriptor, ConfigRegistry, ScheduleKind};
use maestro_core::{
    routing, AgentMode, ChatMessage, ExecutionRecord, MaestroError, MaestroResult, TaskEvent,
};
use maestro_llm::{CompletionRequest, ProviderFactory};
use maestro_pools::{Discipline, HeartbeatBoard};
use maestro_state::StateStore;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEARTBEAT_REFRESH: Duration = Duration::from_secs(30);
const DEFAULT_TICK_PROMPT: &str = "Run your scheduled task.";

/// The scheduled discipline: tick emission plus one-shot tick execution.
pub struct SchedulerService {
    inner: Arc<SchedulerWorker>,
    started: AtomicBool,
    tickers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    refresher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(
        bus: Arc<dyn DispatchBus>,
        store: Arc<StateStore>,
        providers: Arc<dyn ProviderFactory>,
        registry: Arc<ConfigRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerWorker {
                bus,
                store,
                providers,
                registry,
                heartbeats: HeartbeatBoard::new(),
                active: Mutex::new(HashMap::new()),
            }),
            started: AtomicBool::new(false),
            tickers: Mutex::new(HashMap::new()),
            refresher: Mutex::new(None),
        }
    }

    async fn ensure_subscribed(&self) -> MaestroResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let options = SubscribeOptions::new(
            routing::QUEUE_SCHEDULER,
            vec!["scheduled.task.*".to_string()],
        )
        .with_prefetch(4);
        self.inner
            .bus
            .subscribe(options, Arc::clone(&self.inner) as Arc<dyn EventHandler>)
            .await?;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_REFRESH);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for name in inner.heartbeats.agents() {
                    inner.heartbeats.beat(&name);
                }
            }
        });
        *self.refresher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    fn spawn_ticker(&self, descriptor: Arc<AgentDescriptor>) -> MaestroResult<()> {
        let Some(schedule) = descriptor.schedule_config.clone() else {
            return Err(MaestroError::ConfigInvalid(format!(
                "scheduled agent '{}' has no schedule_config",
                descriptor.name
            )));
        };
        let inner = Arc::clone(&self.inner);
        let name = descriptor.name.clone();

        let handle = match schedule.kind {
            ScheduleKind::Interval => {
                let seconds = schedule.interval_seconds.unwrap_or(60).max(1);
                let descriptor = Arc::clone(&descriptor);
                tokio::spawn(async move {
                    let mut ticker =
                        tokio::time::interval(Duration::from_secs(seconds));
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        inner.emit_tick(&descriptor).await;
                    }
                })
            }
            ScheduleKind::Cron => {
                let expression = schedule.cron.clone().unwrap_or_default();
                let parsed = parse_cron(&expression)?;
                let descriptor = Arc::clone(&descriptor);
                tokio::spawn(async move {
                    loop {
                        let Some(next) = parsed.upcoming(Utc).next() else {
                            warn!(agent = %descriptor.name, "Cron schedule has no upcoming fire times");
                            break;
                        };
                        let wait = (next - Utc::now()).to_std().unwrap_or_default();
                        tokio::time::sleep(wait).await;
                        inner.emit_tick(&descriptor).await;
                    }
                })
            }
        };

        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = tickers.insert(name, handle) {
            previous.abort();
        }
        Ok(())
    }
}

/// Accept 5-field cron expressions by prepending a seconds column; the cron
/// crate wants 6 or 7 fields.
fn parse_cron(expression: &str) -> MaestroResult<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| {
        MaestroError::ConfigInvalid(format!("invalid cron expression '{expression}': {e}"))
    })
}

#[async_trait]
impl Discipline for SchedulerService {
    fn mode(&self) -> AgentMode {
        AgentMode::Scheduled
    }

    async fn activate(&self, descriptor: Arc<AgentDescriptor>) -> MaestroResult<()> {
        if descriptor.mode != AgentMode::Scheduled {
            return Err(MaestroError::ConfigInvalid(format!(
                "agent '{}' is not scheduled",
                descriptor.name
            )));
        }
        self.ensure_subscribed().await?;
        self.spawn_ticker(Arc::clone(&descriptor))?;
        self.inner.heartbeats.beat(&descriptor.name);
        info!(agent = %descriptor.name, "Scheduled agent activated");
        Ok(())
    }

    async fn deactivate(&self, agent_name: &str) -> MaestroResult<()> {
        let removed = {
            let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
            tickers.remove(agent_name)
        };
        if let Some(handle) = removed {
            handle.abort();
        }
        self.inner.heartbeats.remove(agent_name);
        info!(agent = %agent_name, "Scheduled agent deactivated");
        Ok(())
    }

    async fn last_heartbeat(&self, agent_name: &str) -> Option<DateTime<Utc>> {
        self.inner.heartbeats.get(agent_name)
    }

    async fn cancel(&self, execution_id: Uuid) -> bool {
        let sender = {
            let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.get(&execution_id).cloned()
        };
        match sender {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    async fn shutdown(&self) -> MaestroResult<()> {
        {
            let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
            for (_, handle) in tickers.drain() {
                handle.abort();
            }
        }
        if let Some(handle) = self
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        if self.started.load(Ordering::SeqCst) {
            self.inner.bus.unsubscribe(routing::QUEUE_SCHEDULER).await?;
        }
        Ok(())
    }
}

struct SchedulerWorker {
    bus: Arc<dyn DispatchBus>,
    store: Arc<StateStore>,
    providers: Arc<dyn ProviderFactory>,
    registry: Arc<ConfigRegistry>,
    heartbeats: HeartbeatBoard,
    active: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl SchedulerWorker {
    /// A tick is a submission: QUEUED record first, then the event.
    async fn emit_tick(&self, descriptor: &AgentDescriptor) {
        let name = &descriptor.name;
        self.heartbeats.beat(name);

        let record = ExecutionRecord::new(name, Uuid::new_v4());
        if let Err(e) = self.store.append_execution(&record).await {
            warn!(agent = %name, error = %e, "Could not create tick record, skipping tick");
            return;
        }

        let mut payload = descriptor
            .schedule_config
            .as_ref()
            .and_then(|s| s.task_data.clone())
            .unwrap_or_else(|| serde_json::json!({}));
        if !payload.is_object() {
            payload = serde_json::json!({ "data": payload });
        }
        if let Some(object) = payload.as_object_mut() {
            object
                .entry("prompt".to_string())
                .or_insert_with(|| serde_json::json!(DEFAULT_TICK_PROMPT));
        }

        let route = routing::scheduled_task(name);
        let event = TaskEvent::new(route.clone(), payload)
            .with_trace_id(record.trace_id)
            .with_agent(name.clone())
            .with_execution_id(record.execution_id);
        match self.bus.publish(&route, &event, true).await {
            Ok(()) => debug!(agent = %name, execution_id = %record.execution_id, "Tick emitted"),
            Err(e) => warn!(agent = %name, error = %e, "Tick publish failed"),
        }
    }

    async fn fail_execution(&self, record: &mut ExecutionRecord, error: &MaestroError) {
        record.mark_failed(error.to_string());
        if let Err(e) = self.store.update_execution(record).await {
            warn!(execution_id = %record.execution_id, error = %e, "Could not persist failed record");
        }
    }

    async fn run(&self, event: TaskEvent) -> HandlerOutcome {
        let Some(agent_name) = event.agent_name.clone() else {
            return HandlerOutcome::Fatal(MaestroError::Permanent(
                "tick carries no agent_name".into(),
            ));
        };
        let Some(descriptor) = self.registry.get(&agent_name) else {
            return HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "unknown agent '{agent_name}'"
            )));
        };
        if descriptor.mode != AgentMode::Scheduled {
            return HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "agent '{agent_name}' is {}, not scheduled",
                descriptor.mode
            )));
        }
        self.heartbeats.beat(&agent_name);

        let execution_id = event.execution_id.unwrap_or_else(Uuid::new_v4);
        let mut record = match self.store.get_execution(execution_id).await {
            Ok(Some(existing)) if existing.is_terminal() => {
                debug!(execution_id = %execution_id, "Duplicate tick for terminal execution");
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
        match self.store.update_execution(&record).await {
            Ok(true) => {}
            Ok(false) => return HandlerOutcome::Ok,
            Err(e) => return HandlerOutcome::Retryable(e),
        }

        let prompt = event.payload["prompt"]
            .as_str()
            .unwrap_or(DEFAULT_TICK_PROMPT)
            .to_string();
        let provider = match self.providers.create(&descriptor.llm) {
            Ok(provider) => provider,
            Err(e) => {
                self.fail_execution(&mut record, &e).await;
                return HandlerOutcome::Fatal(e);
            }
        };
        let request = CompletionRequest::new(&descriptor.llm, vec![ChatMessage::user(prompt)])
            .with_system_prompt(descriptor.system_prompt.clone());

        let timeout_seconds = descriptor
            .schedule_config
            .as_ref()
            .map(|s| s.timeout_seconds)
            .unwrap_or(300);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(execution_id, cancel_tx);
        }

        enum TickOutcome {
            Success(maestro_llm::Completion),
            Provider(maestro_llm::LlmError),
            TimedOut,
            Cancelled,
        }
        let outcome = tokio::select! {
            result = tokio::time::timeout(
                Duration::from_secs(timeout_seconds),
                provider.complete(&request),
            ) => match result {
                Ok(Ok(completion)) => TickOutcome::Success(completion),
                Ok(Err(err)) => TickOutcome::Provider(err),
                Err(_) => TickOutcome::TimedOut,
            },
            _ = cancel_rx.changed() => TickOutcome::Cancelled,
        };
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(&execution_id);
        }

        match outcome {
            TickOutcome::Success(completion) => {
                let result = serde_json::json!({
                    "answer": completion.text,
                    "model": completion.model,
                });
                record.mark_completed(result.clone());
                if let Err(e) = self.store.update_execution(&record).await {
                    return HandlerOutcome::Retryable(e);
                }
                let key = format!("scheduled.task.{agent_name}.completed");
                let completed = TaskEvent::derived(&event, key.clone(), result);
                if let Err(e) = self.bus.publish(&key, &completed, true).await {
                    return HandlerOutcome::Retryable(e);
                }
                debug!(agent = %agent_name, execution_id = %execution_id, "Scheduled tick completed");
                HandlerOutcome::Ok
            }
            TickOutcome::Provider(err) if err.is_transient() => {
                HandlerOutcome::Retryable(err.into())
            }
            TickOutcome::Provider(err) => {
                let core_err: MaestroError = err.into();
                self.fail_execution(&mut record, &core_err).await;
                HandlerOutcome::Fatal(core_err)
            }
            TickOutcome::TimedOut => {
                record.mark_timeout();
                if let Err(e) = self.store.update_execution(&record).await {
                    warn!(execution_id = %execution_id, error = %e, "Could not persist timeout");
                }
                let key = routing::scheduled_timeout(&agent_name);
                let timeout_event = TaskEvent::derived(
                    &event,
                    key.clone(),
                    serde_json::json!({"timeout_seconds": timeout_seconds}),
                );
                if let Err(e) = self.bus.publish(&key, &timeout_event, true).await {
                    warn!(error = %e, "Could not publish timeout event");
                }
                warn!(agent = %agent_name, execution_id = %execution_id, "Scheduled tick timed out");
                HandlerOutcome::Ok
            }
            TickOutcome::Cancelled => {
                info!(agent = %agent_name, execution_id = %execution_id, "Scheduled tick cancelled");
                HandlerOutcome::Ok
            }
        }
    }
}

#[async_trait]
impl EventHandler for SchedulerWorker {
    async fn handle(&self, event: TaskEvent) -> HandlerOutcome {
        self.run(event).await
    }
}

impl Drop for SchedulerService {
    fn drop(&mut self) {
        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in tickers.drain() {
            handle.abort();
        }
        if let Some(handle) = self
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
