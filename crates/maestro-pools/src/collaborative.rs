//! Plan-driven multi-agent collaboration.
//!
//! A submission is planned into ordered executor steps, each published to
//! the executor's own route and awaited through the completion waiter. The
//! plan never advances past `current_step` until the step's terminal event
//! is observed or the step times out. Clarification requests suspend the
//! plan until a reply event arrives or the clarification window closes.

use crate::completion::CompletionWaiter;
use crate::discipline::{Discipline, HeartbeatBoard};
use crate::plan::{Clarification, PlanRunState, PlanStatus, PlanStep, StepStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_bus::{DispatchBus, EventHandler, HandlerOutcome, SubscribeOptions};
use maestro_config::{AgentDescriptor, CollaborativeConfig, ConfigRegistry};
use maestro_core::{
    routing, AgentMode, ExecutionRecord, ExecutionStatus, MaestroError, MaestroResult, TaskEvent,
};
use maestro_llm::{CompletionRequest, ProviderFactory};
use maestro_state::StateStore;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_PREFETCH: usize = 4;

/// The collaborative discipline pool.
pub struct CollaborativePool {
    bus: Arc<dyn DispatchBus>,
    worker: Arc<CollabWorker>,
    prefetch: usize,
    started: AtomicBool,
}

impl CollaborativePool {
    pub fn new(
        bus: Arc<dyn DispatchBus>,
        store: Arc<StateStore>,
        providers: Arc<dyn ProviderFactory>,
        registry: Arc<ConfigRegistry>,
    ) -> Self {
        let waiter = CompletionWaiter::new();
        let worker = Arc::new(CollabWorker {
            bus: Arc::clone(&bus),
            store,
            providers,
            registry,
            heartbeats: HeartbeatBoard::new(),
            waiter,
            active_plans: Mutex::new(HashSet::new()),
            step_timeout_override: None,
            clarification_timeout_override: None,
        });
        Self {
            bus,
            worker,
            prefetch: DEFAULT_PREFETCH,
            started: AtomicBool::new(false),
        }
    }

    /// Override the per-step wait (tests).
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        let worker = Arc::get_mut(&mut self.worker)
            .expect("with_step_timeout must be called before start");
        worker.step_timeout_override = Some(timeout);
        self
    }

    /// Override the clarification wait (tests).
    pub fn with_clarification_timeout(mut self, timeout: Duration) -> Self {
        let worker = Arc::get_mut(&mut self.worker)
            .expect("with_clarification_timeout must be called before start");
        worker.clarification_timeout_override = Some(timeout);
        self
    }

    async fn ensure_subscribed(&self) -> MaestroResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.worker.waiter.start(self.bus.as_ref()).await?;
        let options = SubscribeOptions::new(
            routing::QUEUE_COLLABORATIVE,
            vec![routing::COLLABORATIVE_SUBMITTED.to_string()],
        )
        .with_prefetch(self.prefetch);
        self.bus
            .subscribe(options, Arc::clone(&self.worker) as Arc<dyn EventHandler>)
            .await
    }
}

#[async_trait]
impl Discipline for CollaborativePool {
    fn mode(&self) -> AgentMode {
        AgentMode::Collaborative
    }

    async fn activate(&self, descriptor: Arc<AgentDescriptor>) -> MaestroResult<()> {
        if descriptor.mode != AgentMode::Collaborative {
            return Err(MaestroError::ConfigInvalid(format!(
                "agent '{}' is not collaborative",
                descriptor.name
            )));
        }
        self.ensure_subscribed().await?;
        self.worker.heartbeats.beat(&descriptor.name);
        info!(agent = %descriptor.name, "Collaborative agent activated");
        Ok(())
    }

    async fn deactivate(&self, agent_name: &str) -> MaestroResult<()> {
        self.worker.heartbeats.remove(agent_name);
        info!(agent = %agent_name, "Collaborative agent deactivated");
        Ok(())
    }

    async fn last_heartbeat(&self, agent_name: &str) -> Option<DateTime<Utc>> {
        self.worker.heartbeats.get(agent_name)
    }

    async fn cancel(&self, execution_id: Uuid) -> bool {
        // The plan loop polls its execution record between steps and aborts
        // once the orchestrator has marked it cancelled.
        let plans = self
            .worker
            .active_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        plans.contains(&execution_id)
    }

    async fn shutdown(&self) -> MaestroResult<()> {
        if self.started.load(Ordering::SeqCst) {
            self.bus.unsubscribe(routing::QUEUE_COLLABORATIVE).await?;
        }
        Ok(())
    }
}

struct CollabWorker {
    bus: Arc<dyn DispatchBus>,
    store: Arc<StateStore>,
    providers: Arc<dyn ProviderFactory>,
    registry: Arc<ConfigRegistry>,
    heartbeats: HeartbeatBoard,
    waiter: Arc<CompletionWaiter>,
    active_plans: Mutex<HashSet<Uuid>>,
    step_timeout_override: Option<Duration>,
    clarification_timeout_override: Option<Duration>,
}

#[derive(Deserialize)]
struct PlannerStep {
    description: String,
    #[serde(default)]
    agent: Option<String>,
}

impl CollabWorker {
    async fn fail_plan(
        &self,
        plan: &mut PlanRunState,
        record: &mut ExecutionRecord,
        event: &TaskEvent,
        reason: &str,
    ) {
        warn!(task_id = %plan.task_id, reason, "Plan failed");
        plan.status = PlanStatus::Failed;
        plan.touch();
        if let Err(e) = self.store.save_plan(&plan.task_id, plan).await {
            warn!(task_id = %plan.task_id, error = %e, "Could not persist failed plan");
        }
        record.mark_failed(reason.to_string());
        if let Err(e) = self.store.update_execution(record).await {
            warn!(execution_id = %record.execution_id, error = %e, "Could not persist failed record");
        }
        let failed = TaskEvent::derived(
            event,
            routing::COLLABORATIVE_FAILED,
            serde_json::json!({
                "task_id": plan.task_id,
                "error": reason,
                "partial_results": plan.ordered_results(),
            }),
        )
        .with_execution_id(record.execution_id);
        if let Err(e) = self
            .bus
            .publish(routing::COLLABORATIVE_FAILED, &failed, true)
            .await
        {
            warn!(error = %e, "Could not publish plan failure event");
        }
    }

    /// Build the ordered plan with the planner agent's provider.
    async fn build_plan(
        &self,
        descriptor: &AgentDescriptor,
        config: &CollaborativeConfig,
        task: &str,
    ) -> Result<Vec<PlanStep>, HandlerOutcome> {
        let provider = self
            .providers
            .create(&descriptor.llm)
            .map_err(HandlerOutcome::Fatal)?;

        let executors = if config.preferred_collaborators.is_empty() {
            self.registry
                .list_enabled()
                .iter()
                .map(|d| d.name.clone())
                .collect::<Vec<_>>()
        } else {
            config.preferred_collaborators.clone()
        };

        let planner_prompt = format!(
            "Break the following task into at most {} ordered steps.\n\
             Task: {}\n\
             Available executor agents: {}\n\
             Respond with only a JSON array of objects, each with \
             \"description\" and \"agent\" fields.",
            config.max_plan_steps,
            task,
            executors.join(", "),
        );
        let request = CompletionRequest::new(
            &descriptor.llm,
            vec![maestro_core::ChatMessage::user(planner_prompt)],
        )
        .with_system_prompt(descriptor.system_prompt.clone());

        let completion = match provider.complete(&request).await {
            Ok(completion) => completion,
            Err(err) if err.is_transient() => {
                return Err(HandlerOutcome::Retryable(err.into()))
            }
            Err(err) => return Err(HandlerOutcome::Fatal(err.into())),
        };

        let steps = parse_planner_output(&completion.text).ok_or_else(|| {
            HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "planner returned no parseable step list: {}",
                completion.text.chars().take(200).collect::<String>()
            )))
        })?;
        if steps.is_empty() {
            return Err(HandlerOutcome::Fatal(MaestroError::Permanent(
                "planner returned an empty plan".into(),
            )));
        }
        if steps.len() > config.max_plan_steps {
            return Err(HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "plan has {} steps, limit is {}",
                steps.len(),
                config.max_plan_steps
            ))));
        }

        let mut plan = Vec::with_capacity(steps.len());
        for step in steps {
            let executor = self.resolve_executor(step.agent.as_deref(), &step.description, config);
            match executor {
                Some(agent) => plan.push(PlanStep::new(step.description, agent)),
                None => {
                    return Err(HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                        "no executor available for step '{}'",
                        step.description
                    ))))
                }
            }
        }
        Ok(plan)
    }

    /// Use the planner's assignment when it names a known agent; otherwise
    /// infer from the preferred collaborators by name match, falling back to
    /// the first collaborator that exists.
    fn resolve_executor(
        &self,
        assigned: Option<&str>,
        description: &str,
        config: &CollaborativeConfig,
    ) -> Option<String> {
        if let Some(name) = assigned {
            if self.registry.get(name).is_some() {
                return Some(name.to_string());
            }
        }
        let lowered = description.to_lowercase();
        let mut fallback = None;
        for preferred in &config.preferred_collaborators {
            if self.registry.get(preferred).is_none() {
                continue;
            }
            if lowered.contains(preferred.as_str()) {
                return Some(preferred.clone());
            }
            fallback.get_or_insert_with(|| preferred.clone());
        }
        fallback
    }

    fn step_timeout(&self, descriptor: &AgentDescriptor) -> Duration {
        self.step_timeout_override.unwrap_or_else(|| {
            Duration::from_secs(descriptor.resource_limits.max_execution_time_seconds)
        })
    }

    fn clarification_timeout(&self, config: &CollaborativeConfig) -> Duration {
        self.clarification_timeout_override
            .unwrap_or_else(|| Duration::from_secs(config.clarification_timeout_seconds))
    }

    /// Publish one step to its executor's route and wait for the terminal
    /// event, bounded by the step timeout.
    async fn run_step(
        &self,
        plan_event: &TaskEvent,
        task_id: &str,
        step: &PlanStep,
        timeout: Duration,
    ) -> MaestroResult<Option<TaskEvent>> {
        let executor = self.registry.get(&step.agent).ok_or_else(|| {
            MaestroError::Permanent(format!("executor '{}' disappeared", step.agent))
        })?;

        let execution_id = Uuid::new_v4();
        let mut record = ExecutionRecord::new(&step.agent, plan_event.trace_id);
        record.execution_id = execution_id;
        self.store.append_execution(&record).await?;

        let route = executor.mode.submission_route(&step.agent);
        let step_event = TaskEvent::derived(
            plan_event,
            route.clone(),
            serde_json::json!({
                "prompt": step.description,
                "task_id": task_id,
            }),
        )
        .with_execution_id(execution_id)
        .with_agent(step.agent.clone());

        // Register before publishing so the completion cannot race the wait.
        let receiver = self.waiter.register_execution(execution_id);
        if let Err(e) = self.bus.publish(&route, &step_event, true).await {
            self.waiter.forget_execution(execution_id);
            return Err(e);
        }
        debug!(task_id, agent = %step.agent, execution_id = %execution_id, "Step dispatched");

        let outcome = CompletionWaiter::wait(receiver, timeout).await;
        if outcome.is_none() {
            self.waiter.forget_execution(execution_id);
        }
        Ok(outcome)
    }

    async fn cancelled(&self, execution_id: Uuid) -> bool {
        match self.store.get_execution(execution_id).await {
            Ok(Some(record)) => record.status == ExecutionStatus::Cancelled,
            _ => false,
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
        if descriptor.mode != AgentMode::Collaborative {
            return HandlerOutcome::Fatal(MaestroError::Permanent(format!(
                "agent '{agent_name}' is {}, not collaborative",
                descriptor.mode
            )));
        }
        let config = descriptor.collaborative();
        self.heartbeats.beat(&agent_name);

        let Some(task) = event.payload["task"]
            .as_str()
            .or_else(|| event.payload["prompt"].as_str())
            .or_else(|| event.payload["description"].as_str())
            .map(str::to_string)
        else {
            return HandlerOutcome::Fatal(MaestroError::Permanent(
                "payload carries no task description".into(),
            ));
        };

        let execution_id = event.execution_id.unwrap_or_else(Uuid::new_v4);
        let task_id = event.payload["task_id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| execution_id.to_string());

        // Idempotency: a terminal plan for this task means the work is done.
        let existing_plan: Option<PlanRunState> = match self.store.load_plan(&task_id).await {
            Ok(plan) => plan,
            Err(e) => return HandlerOutcome::Retryable(e),
        };
        if let Some(plan) = &existing_plan {
            if plan.status.is_terminal() {
                debug!(task_id = %task_id, status = ?plan.status, "Duplicate delivery for finished plan");
                return HandlerOutcome::Ok;
            }
        }

        let mut record = match self.store.get_execution(execution_id).await {
            Ok(Some(existing)) if existing.is_terminal() => return HandlerOutcome::Ok,
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
        if let Err(e) = self.store.update_execution(&record).await {
            return HandlerOutcome::Retryable(e);
        }

        {
            let mut plans = self.active_plans.lock().unwrap_or_else(|e| e.into_inner());
            plans.insert(execution_id);
        }
        let outcome = self
            .run_plan(event.clone(), descriptor, config, task, task_id, existing_plan, record)
            .await;
        {
            let mut plans = self.active_plans.lock().unwrap_or_else(|e| e.into_inner());
            plans.remove(&execution_id);
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_plan(
        &self,
        event: TaskEvent,
        descriptor: Arc<AgentDescriptor>,
        config: CollaborativeConfig,
        task: String,
        task_id: String,
        existing_plan: Option<PlanRunState>,
        mut record: ExecutionRecord,
    ) -> HandlerOutcome {
        let agent_name = descriptor.name.clone();

        // Resume an interrupted run from its persisted cursor; plan fresh
        // otherwise.
        let mut plan = match existing_plan {
            Some(plan) if !plan.plan.is_empty() => {
                info!(task_id = %task_id, current_step = plan.current_step, "Resuming interrupted plan");
                plan
            }
            _ => {
                let mut plan = PlanRunState::new(&task_id, event.trace_id);
                if let Err(e) = self.store.save_plan(&task_id, &plan).await {
                    return HandlerOutcome::Retryable(e);
                }
                let steps = match self.build_plan(&descriptor, &config, &task).await {
                    Ok(steps) => steps,
                    Err(HandlerOutcome::Fatal(err)) => {
                        self.fail_plan(&mut plan, &mut record, &event, &err.to_string())
                            .await;
                        return HandlerOutcome::Ok;
                    }
                    Err(other) => return other,
                };
                info!(task_id = %task_id, steps = steps.len(), "Plan created");
                plan.plan = steps;
                plan.status = PlanStatus::Running;
                plan.touch();
                if let Err(e) = self.store.save_plan(&task_id, &plan).await {
                    return HandlerOutcome::Retryable(e);
                }
                plan
            }
        };
        plan.status = PlanStatus::Running;

        let step_timeout = self.step_timeout(&descriptor);
        let mut index = plan.current_step;
        while index < plan.plan.len() {
            if self.cancelled(record.execution_id).await {
                info!(task_id = %task_id, "Plan cancelled by operator");
                plan.status = PlanStatus::Failed;
                plan.touch();
                if let Err(e) = self.store.save_plan(&task_id, &plan).await {
                    warn!(task_id = %task_id, error = %e, "Could not persist cancelled plan");
                }
                return HandlerOutcome::Ok;
            }
            self.heartbeats.beat(&agent_name);

            let mut step = plan.plan[index].clone();
            step.status = StepStatus::Running;
            plan.plan[index] = step.clone();

            let completion = match self.run_step(&event, &task_id, &step, step_timeout).await {
                Ok(completion) => completion,
                Err(e) if e.is_transient() => return HandlerOutcome::Retryable(e),
                Err(e) => {
                    self.fail_plan(&mut plan, &mut record, &event, &e.to_string())
                        .await;
                    return HandlerOutcome::Ok;
                }
            };

            let Some(step_event) = completion else {
                plan.plan[index].status = StepStatus::Failed;
                self.fail_plan(
                    &mut plan,
                    &mut record,
                    &event,
                    &format!("step {index} timed out after {}s", step_timeout.as_secs()),
                )
                .await;
                return HandlerOutcome::Ok;
            };

            if step_event.event_type.ends_with(".failed")
                || step_event.event_type.ends_with(".timeout")
            {
                plan.plan[index].status = StepStatus::Failed;
                let error = step_event.payload["error"]
                    .as_str()
                    .unwrap_or("step execution failed");
                self.fail_plan(
                    &mut plan,
                    &mut record,
                    &event,
                    &format!("step {index} ({}): {error}", step.agent),
                )
                .await;
                return HandlerOutcome::Ok;
            }

            if let Some(question) = step_event.payload["clarification_request"].as_str() {
                match self
                    .handle_clarification(&mut plan, &config, &task_id, question, index)
                    .await
                {
                    Ok(Some(reply)) => {
                        // Re-run the step with the reply folded in.
                        plan.plan[index].description =
                            format!("{}\n\nClarification: {}", step.description, reply);
                        plan.status = PlanStatus::Running;
                        plan.touch();
                        if let Err(e) = self.store.save_plan(&task_id, &plan).await {
                            return HandlerOutcome::Retryable(e);
                        }
                        continue;
                    }
                    Ok(None) => {
                        self.fail_plan(
                            &mut plan,
                            &mut record,
                            &event,
                            &format!("clarification for step {index} not answered in time"),
                        )
                        .await;
                        return HandlerOutcome::Ok;
                    }
                    Err(reason) => {
                        self.fail_plan(&mut plan, &mut record, &event, &reason).await;
                        return HandlerOutcome::Ok;
                    }
                }
            }

            plan.plan[index].status = StepStatus::Completed;
            plan.plan[index].result = Some(step_event.payload.clone());
            plan.current_step = index + 1;
            plan.touch();
            if let Err(e) = self.store.save_plan(&task_id, &plan).await {
                return HandlerOutcome::Retryable(e);
            }
            debug!(task_id = %task_id, step = index, agent = %step.agent, "Step completed");
            index += 1;
        }

        let aggregated = serde_json::Value::Array(plan.ordered_results());
        plan.aggregated_result = Some(aggregated.clone());
        plan.status = PlanStatus::Completed;
        plan.touch();
        if let Err(e) = self.store.save_plan(&task_id, &plan).await {
            return HandlerOutcome::Retryable(e);
        }

        let result = serde_json::json!({
            "task_id": task_id,
            "aggregated_result": aggregated,
        });
        record.mark_completed(result.clone());
        if let Err(e) = self.store.update_execution(&record).await {
            warn!(execution_id = %record.execution_id, error = %e, "Could not persist completed record");
        }
        let completed = TaskEvent::derived(&event, routing::COLLABORATIVE_COMPLETED, result)
            .with_execution_id(record.execution_id);
        if let Err(e) = self
            .bus
            .publish(routing::COLLABORATIVE_COMPLETED, &completed, true)
            .await
        {
            return HandlerOutcome::Retryable(e);
        }
        info!(task_id = %task_id, steps = plan.plan.len(), "Plan completed");
        HandlerOutcome::Ok
    }

    /// Suspend on a clarification request. Returns the reply text, `None`
    /// on timeout, or an error string when clarifications are not allowed.
    async fn handle_clarification(
        &self,
        plan: &mut PlanRunState,
        config: &CollaborativeConfig,
        task_id: &str,
        question: &str,
        step_index: usize,
    ) -> Result<Option<String>, String> {
        if !config.allow_human_clarification {
            return Err(format!(
                "step {step_index} requested clarification but clarifications are disabled"
            ));
        }
        let timeout = self.clarification_timeout(config);
        info!(task_id, question, "Plan waiting for clarification");

        plan.status = PlanStatus::WaitingClarification;
        plan.clarification = Some(Clarification {
            question: question.to_string(),
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
            reply: None,
        });
        plan.touch();
        if let Err(e) = self.store.save_plan(task_id, plan).await {
            warn!(task_id, error = %e, "Could not persist waiting plan");
        }

        let receiver = self.waiter.register_clarification(task_id);
        let reply_event = CompletionWaiter::wait(receiver, timeout).await;
        match reply_event {
            Some(event) => {
                let reply = event.payload["reply"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                if let Some(clarification) = plan.clarification.as_mut() {
                    clarification.reply = Some(reply.clone());
                }
                Ok(Some(reply))
            }
            None => {
                self.waiter.forget_clarification(task_id);
                Ok(None)
            }
        }
    }
}

/// Extract the first JSON array from the planner's output.
fn parse_planner_output(text: &str) -> Option<Vec<PlannerStep>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[async_trait]
impl EventHandler for CollabWorker {
    async fn handle(&self, event: TaskEvent) -> HandlerOutcome {
        self.run(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planner_output_parsing() {
        let text = r#"Here is the plan:
[
  {"description": "research the topic", "agent": "e1"},
  {"description": "summarize findings", "agent": "e2"}
]
Done."#;
        let steps = parse_planner_output(text).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].description, "research the topic");
        assert_eq!(steps[1].agent.as_deref(), Some("e2"));
    }

    #[test]
    fn planner_output_without_array_is_none() {
        assert!(parse_planner_output("no json here").is_none());
        assert!(parse_planner_output("]weird[").is_none());
    }

    #[test]
    fn planner_step_agent_optional() {
        let steps = parse_planner_output(r#"[{"description": "do it"}]"#).unwrap();
        assert!(steps[0].agent.is_none());
    }
}
