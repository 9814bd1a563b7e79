//! Per-agent stateful event loops with durable conversation state.
//!
//! Each continuous agent gets its own queue consumed with prefetch 1, so
//! its handler is strictly serialized. State is cached in memory, persisted
//! on a save interval, on idle, and on shutdown, and reconstructed from the
//! durable tier after a crash (the broker redelivers unacked events).

use crate::discipline::{Discipline, HeartbeatBoard};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_bus::{DispatchBus, EventHandler, HandlerOutcome, SubscribeOptions};
use maestro_config::{AgentDescriptor, ConfigRegistry};
use maestro_core::{
    routing, AgentMode, ChatMessage, ExecutionRecord, MaestroError, MaestroResult, TaskEvent,
};
use maestro_llm::{CompletionRequest, ProviderFactory};
use maestro_state::{ContinuousAgentState, StateStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SAVE_ATTEMPTS: u32 = 3;
const DEFAULT_IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(60);

struct AgentSlot {
    state: ContinuousAgentState,
    dirty: bool,
    last_save: Instant,
}

struct RunnerInner {
    bus: Arc<dyn DispatchBus>,
    store: Arc<StateStore>,
    providers: Arc<dyn ProviderFactory>,
    registry: Arc<ConfigRegistry>,
    heartbeats: HeartbeatBoard,
    slots: RwLock<HashMap<String, Arc<Mutex<AgentSlot>>>>,
    active: StdRwLock<HashSet<String>>,
}

/// The continuous discipline runner.
pub struct ContinuousRunner {
    inner: Arc<RunnerInner>,
    idle_scan_interval: Duration,
    scanner: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ContinuousRunner {
    pub fn new(
        bus: Arc<dyn DispatchBus>,
        store: Arc<StateStore>,
        providers: Arc<dyn ProviderFactory>,
        registry: Arc<ConfigRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                bus,
                store,
                providers,
                registry,
                heartbeats: HeartbeatBoard::new(),
                slots: RwLock::new(HashMap::new()),
                active: StdRwLock::new(HashSet::new()),
            }),
            idle_scan_interval: DEFAULT_IDLE_SCAN_INTERVAL,
            scanner: std::sync::Mutex::new(None),
        }
    }

    /// Shorten the idle scan cadence (tests).
    pub fn with_idle_scan_interval(mut self, interval: Duration) -> Self {
        self.idle_scan_interval = interval;
        self
    }

    /// Start the background idle scanner / heartbeat refresher.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let interval = self.idle_scan_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.refresh_heartbeats();
                inner.scan_idle().await;
            }
        });
        *self.scanner.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}

#[async_trait]
impl Discipline for ContinuousRunner {
    fn mode(&self) -> AgentMode {
        AgentMode::Continuous
    }

    async fn activate(&self, descriptor: Arc<AgentDescriptor>) -> MaestroResult<()> {
        if descriptor.mode != AgentMode::Continuous {
            return Err(MaestroError::ConfigInvalid(format!(
                "agent '{}' is not continuous",
                descriptor.name
            )));
        }
        let name = descriptor.name.clone();
        // The dedicated task route plus any extra topic patterns from the
        // descriptor all land on the same FIFO queue.
        let mut patterns = vec![routing::continuous_task(&name)];
        patterns.extend(descriptor.subscriptions.iter().cloned());
        let options = SubscribeOptions::new(routing::continuous_queue(&name), patterns)
            .with_prefetch(1);
        self.inner
            .bus
            .subscribe(
                options,
                Arc::new(ContinuousHandler {
                    inner: Arc::clone(&self.inner),
                    agent: name.clone(),
                }) as Arc<dyn EventHandler>,
            )
            .await?;
        self.inner
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone());
        self.inner.heartbeats.beat(&name);
        info!(agent = %name, "Continuous agent activated");
        Ok(())
    }

    async fn deactivate(&self, agent_name: &str) -> MaestroResult<()> {
        // The queue is retained: it may hold unacked events for the next
        // activation. Only the consumer detaches.
        match self
            .inner
            .bus
            .unsubscribe(&routing::continuous_queue(agent_name))
            .await
        {
            Ok(()) | Err(MaestroError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.inner.flush_and_evict(agent_name).await;
        self.inner
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_name);
        self.inner.heartbeats.remove(agent_name);
        info!(agent = %agent_name, "Continuous agent deactivated");
        Ok(())
    }

    async fn last_heartbeat(&self, agent_name: &str) -> Option<DateTime<Utc>> {
        self.inner.heartbeats.get(agent_name)
    }

    async fn cancel(&self, _execution_id: Uuid) -> bool {
        // Continuous turns are serialized and short; there is no in-flight
        // registry to cancel into.
        false
    }

    async fn shutdown(&self) -> MaestroResult<()> {
        if let Some(handle) = self
            .scanner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        let agents: Vec<String> = {
            let active = self.inner.active.read().unwrap_or_else(|e| e.into_inner());
            active.iter().cloned().collect()
        };
        for agent in agents {
            let _ = self
                .inner
                .bus
                .unsubscribe(&routing::continuous_queue(&agent))
                .await;
            self.inner.flush_and_evict(&agent).await;
        }
        self.inner
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!("Continuous runner shut down, state flushed");
        Ok(())
    }
}

impl RunnerInner {
    fn refresh_heartbeats(&self) {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        for name in active.iter() {
            self.heartbeats.beat(name);
        }
    }

    /// Evict agents idle past their descriptor's idle timeout, saving dirty
    /// state first. Evicted agents reload lazily on their next event.
    async fn scan_idle(&self) {
        let snapshot: Vec<(String, Arc<Mutex<AgentSlot>>)> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
                .collect()
        };
        for (name, slot_arc) in snapshot {
            let idle_timeout = self
                .registry
                .get(&name)
                .map(|d| d.continuous().idle_timeout_seconds)
                .unwrap_or(900);
            let evict = {
                let slot = slot_arc.lock().await;
                let idle_for = Utc::now() - slot.state.last_activity;
                idle_for.num_seconds() >= idle_timeout as i64
            };
            if evict {
                debug!(agent = %name, "Idle timeout reached, flushing and evicting");
                self.flush_and_evict(&name).await;
            }
        }
    }

    async fn flush_and_evict(&self, agent_name: &str) {
        let removed = {
            let mut slots = self.slots.write().await;
            slots.remove(agent_name)
        };
        if let Some(slot_arc) = removed {
            let mut slot = slot_arc.lock().await;
            if slot.dirty {
                match self.store.save_continuous(&mut slot.state).await {
                    Ok(version) => {
                        debug!(agent = %agent_name, version, "Flushed continuous state");
                    }
                    Err(MaestroError::StaleVersion { .. }) => {
                        warn!(
                            agent = %agent_name,
                            "Another instance advanced the state; dropping local copy"
                        );
                    }
                    Err(e) => {
                        warn!(agent = %agent_name, error = %e, "Could not flush continuous state");
                    }
                }
            }
        }
    }

    async fn slot(&self, agent_name: &str) -> MaestroResult<Arc<Mutex<AgentSlot>>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(agent_name) {
                return Ok(Arc::clone(slot));
            }
        }
        let state = self
            .store
            .load_continuous(agent_name)
            .await?
            .unwrap_or_else(|| ContinuousAgentState::new(agent_name));
        let mut slots = self.slots.write().await;
        Ok(Arc::clone(slots.entry(agent_name.to_string()).or_insert_with(
            || {
                Arc::new(Mutex::new(AgentSlot {
                    state,
                    dirty: false,
                    last_save: Instant::now(),
                }))
            },
        )))
    }

    /// Conditional save with bounded reload-reapply-retry on version
    /// conflicts. `turn` is this event's (user, assistant) pair, re-applied
    /// onto the freshly loaded state after a conflict.
    async fn save_slot(
        &self,
        agent_name: &str,
        slot: &mut AgentSlot,
        turn: &(ChatMessage, ChatMessage),
        max_history: usize,
    ) -> MaestroResult<()> {
        let mut attempt = 0;
        loop {
            match self.store.save_continuous(&mut slot.state).await {
                Ok(_) => {
                    slot.dirty = false;
                    slot.last_save = Instant::now();
                    return Ok(());
                }
                Err(MaestroError::StaleVersion { stored, .. }) => {
                    attempt += 1;
                    if attempt >= SAVE_ATTEMPTS {
                        return Err(MaestroError::Permanent(format!(
                            "continuous state for '{agent_name}' stayed stale after {SAVE_ATTEMPTS} attempts (stored version {stored})"
                        )));
                    }
                    warn!(agent = %agent_name, attempt, "Stale continuous state, reloading and re-applying turn");
                    let mut fresh = self
                        .store
                        .load_continuous(agent_name)
                        .await?
                        .unwrap_or_else(|| ContinuousAgentState::new(agent_name));
                    fresh.record_turn(turn.0.clone(), turn.1.clone());
                    fresh.prune_conversation(max_history);
                    slot.state = fresh;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct ContinuousHandler {
    inner: Arc<RunnerInner>,
    agent: String,
}

impl ContinuousHandler {
    async fn process(&self, event: TaskEvent) -> HandlerOutcome {
        let inner = &self.inner;
        let Some(descriptor) = inner.registry.get(&self.agent) else {
            return HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "unknown agent '{}'",
                self.agent
            )));
        };
        if descriptor.mode != AgentMode::Continuous {
            return HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "agent '{}' is {}, not continuous",
                self.agent, descriptor.mode
            )));
        }
        let config = descriptor.continuous();

        let Some(prompt) = event.payload["prompt"]
            .as_str()
            .or_else(|| event.payload["message"].as_str())
            .map(str::to_string)
        else {
            return HandlerOutcome::Fatal(MaestroError::Permanent(
                "payload carries no prompt".into(),
            ));
        };

        // Idempotency on redelivery: a terminal record means this event
        // already produced its result.
        let mut record = match self.load_record(&event).await {
            Ok(Some(record)) if record.is_terminal() => {
                debug!(agent = %self.agent, "Duplicate delivery for terminal execution");
                return HandlerOutcome::Ok;
            }
            Ok(record) => record,
            Err(e) => return HandlerOutcome::Retryable(e),
        };
        if let Some(record) = record.as_mut() {
            record.mark_running();
            record.retries = event.retry_count;
            if let Err(e) = inner.store.update_execution(record).await {
                return HandlerOutcome::Retryable(e);
            }
        }

        let slot_arc = match inner.slot(&self.agent).await {
            Ok(slot) => slot,
            Err(e) => return HandlerOutcome::Retryable(e),
        };
        let mut slot = slot_arc.lock().await;

        let provider = match inner.providers.create(&descriptor.llm) {
            Ok(provider) => provider,
            Err(e) => {
                self.fail_record(record.as_mut(), &e).await;
                return HandlerOutcome::Fatal(e);
            }
        };

        let user_message = ChatMessage::user(prompt);
        let mut messages = slot.state.conversation.clone();
        messages.push(user_message.clone());
        let request = CompletionRequest::new(&descriptor.llm, messages)
            .with_system_prompt(descriptor.system_prompt.clone());

        let timeout = Duration::from_secs(descriptor.resource_limits.max_execution_time_seconds);
        let completion = match tokio::time::timeout(timeout, provider.complete(&request)).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(err)) if err.is_transient() => {
                return HandlerOutcome::Retryable(err.into());
            }
            Ok(Err(err)) => {
                let core_err: MaestroError = err.into();
                self.fail_record(record.as_mut(), &core_err).await;
                return HandlerOutcome::Fatal(core_err);
            }
            Err(_) => {
                return HandlerOutcome::Retryable(MaestroError::Timeout(timeout.as_secs()));
            }
        };

        let assistant_message = ChatMessage::assistant(completion.text.clone());
        slot.state
            .record_turn(user_message.clone(), assistant_message.clone());
        slot.state.prune_conversation(config.max_conversation_history);
        slot.dirty = true;
        inner.heartbeats.beat(&self.agent);

        let save_due = config.save_interval_seconds == 0
            || slot.last_save.elapsed() >= Duration::from_secs(config.save_interval_seconds);
        if save_due {
            let turn = (user_message, assistant_message);
            if let Err(e) = inner
                .save_slot(&self.agent, &mut slot, &turn, config.max_conversation_history)
                .await
            {
                return match e {
                    MaestroError::Permanent(_) => {
                        self.fail_record(record.as_mut(), &e).await;
                        HandlerOutcome::Fatal(e)
                    }
                    other => HandlerOutcome::Retryable(other),
                };
            }
        }

        let result = serde_json::json!({
            "reply": completion.text,
            "event_count": slot.state.event_count,
        });
        drop(slot);

        if let Some(record) = record.as_mut() {
            record.mark_completed(result.clone());
            if let Err(e) = inner.store.update_execution(record).await {
                warn!(agent = %self.agent, error = %e, "Could not persist completed record");
            }
        }

        let result_key = routing::continuous_result(&self.agent);
        let result_event = TaskEvent::derived(&event, result_key.clone(), result);
        if let Err(e) = inner.bus.publish(&result_key, &result_event, true).await {
            return HandlerOutcome::Retryable(e);
        }
        debug!(agent = %self.agent, "Continuous event processed");
        HandlerOutcome::Ok
    }

    async fn load_record(&self, event: &TaskEvent) -> MaestroResult<Option<ExecutionRecord>> {
        let Some(execution_id) = event.execution_id else {
            return Ok(None);
        };
        if let Some(existing) = self.inner.store.get_execution(execution_id).await? {
            return Ok(Some(existing));
        }
        let mut record = ExecutionRecord::new(&self.agent, event.trace_id);
        record.execution_id = execution_id;
        record.submitted_at = event.timestamp;
        Ok(Some(record))
    }

    async fn fail_record(&self, record: Option<&mut ExecutionRecord>, error: &MaestroError) {
        if let Some(record) = record {
            record.mark_failed(error.to_string());
            if let Err(e) = self.inner.store.update_execution(record).await {
                warn!(agent = %self.agent, error = %e, "Could not persist failed record");
            }
        }
    }
}

#[async_trait]
impl EventHandler for ContinuousHandler {
    async fn handle(&self, event: TaskEvent) -> HandlerOutcome {
        self.process(event).await
    }
}
