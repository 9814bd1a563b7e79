//! Discipline behaviour end to end: in-process broker, file durable store,
//! mock providers keyed by model name.

use async_trait::async_trait;
use maestro_bus::{
    BusConfig, DispatchBus, EventHandler, HandlerOutcome, MemoryBus, SubscribeOptions,
};
use maestro_config::ConfigRegistry;
use maestro_core::{routing, ChatRole, ExecutionStatus, MaestroResult, TaskEvent};
use maestro_llm::{Completion, CompletionRequest, LlmError, LlmResult, Provider, ProviderFactory};
use maestro_pools::{AutonomousPool, CollaborativePool, ContinuousRunner, Discipline};
use maestro_state::{FileDurableStore, MemoryCache, StateStore};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

type Behavior = Box<dyn Fn(&CompletionRequest) -> LlmResult<Completion> + Send + Sync>;

struct ScriptedProvider {
    model: String,
    behavior: Behavior,
    calls: AtomicU32,
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.behavior)(request)
    }
    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Routes by `llm.model` so each test agent can behave differently.
struct ScriptedFactory {
    providers: HashMap<String, Arc<ScriptedProvider>>,
}

impl ScriptedFactory {
    fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    fn script(
        mut self,
        model: &str,
        behavior: impl Fn(&CompletionRequest) -> LlmResult<Completion> + Send + Sync + 'static,
    ) -> Self {
        self.providers.insert(
            model.to_string(),
            Arc::new(ScriptedProvider {
                model: model.to_string(),
                behavior: Box::new(behavior),
                calls: AtomicU32::new(0),
            }),
        );
        self
    }
}

impl ProviderFactory for ScriptedFactory {
    fn create(&self, config: &maestro_config::LlmConfig) -> MaestroResult<Arc<dyn Provider>> {
        let provider = self
            .providers
            .get(&config.model)
            .unwrap_or_else(|| panic!("no script for model '{}'", config.model));
        Ok(Arc::clone(provider) as Arc<dyn Provider>)
    }
}

fn ok_completion(model: &str, text: impl Into<String>) -> LlmResult<Completion> {
    Ok(Completion {
        text: text.into(),
        model: model.to_string(),
        input_tokens: None,
        output_tokens: None,
    })
}

struct Recorder {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: TaskEvent) -> HandlerOutcome {
        let _ = self.tx.send(event);
        HandlerOutcome::Ok
    }
}

struct Fixture {
    bus: MemoryBus,
    store: Arc<StateStore>,
    registry: Arc<ConfigRegistry>,
    _config_dir: tempfile::TempDir,
    _data_dir: tempfile::TempDir,
}

async fn fixture(descriptors: &[(&str, &str)]) -> Fixture {
    let config_dir = tempfile::tempdir().unwrap();
    for (file, body) in descriptors {
        let mut f = std::fs::File::create(config_dir.path().join(file)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }
    let data_dir = tempfile::tempdir().unwrap();
    let bus = MemoryBus::new(BusConfig {
        queue_max_length: 1000,
        backoff_base: Duration::from_millis(5),
    });
    let store = Arc::new(StateStore::new(
        Arc::new(MemoryCache::new()),
        Arc::new(FileDurableStore::new(data_dir.path()).await.unwrap()),
    ));
    let registry = Arc::new(ConfigRegistry::load(config_dir.path()).unwrap());
    Fixture {
        bus,
        store,
        registry,
        _config_dir: config_dir,
        _data_dir: data_dir,
    }
}

async fn observe(bus: &MemoryBus, queue: &str, patterns: &[&str]) -> mpsc::UnboundedReceiver<TaskEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(
        SubscribeOptions::new(queue, patterns.iter().map(|p| p.to_string()).collect())
            .with_dlq(false),
        Arc::new(Recorder { tx }),
    )
    .await
    .unwrap();
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

const CALC_YAML: &str = r#"
name: calc
mode: autonomous
llm:
  provider: ollama
  model: calc-model
system_prompt: Answer arithmetic questions.
retry_config:
  max_retries: 2
"#;

#[tokio::test]
async fn autonomous_happy_path() {
    let fx = fixture(&[("calc.yaml", CALC_YAML)]).await;
    let factory = Arc::new(ScriptedFactory::new().script("calc-model", |_req| {
        ok_completion("calc-model", "4")
    }));
    let pool = AutonomousPool::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        factory,
        Arc::clone(&fx.registry),
    );
    pool.activate(fx.registry.get("calc").unwrap()).await.unwrap();

    let mut completed = observe(&fx.bus, "observer", &["autonomous.task.completed"]).await;

    let execution_id = Uuid::new_v4();
    let event = TaskEvent::new(
        routing::AUTONOMOUS_SUBMITTED,
        serde_json::json!({"prompt": "2+2"}),
    )
    .with_agent("calc")
    .with_execution_id(execution_id);
    fx.bus
        .publish(routing::AUTONOMOUS_SUBMITTED, &event, true)
        .await
        .unwrap();

    let done = next_event(&mut completed).await;
    assert_eq!(done.payload["answer"], "4");
    assert_eq!(done.trace_id, event.trace_id);
    assert_eq!(done.execution_id, Some(execution_id));

    let record = fx.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.result.unwrap()["answer"], "4");
}

#[tokio::test]
async fn autonomous_retry_then_dlq() {
    let fx = fixture(&[("calc.yaml", CALC_YAML)]).await;
    let deliveries = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&deliveries);
    let factory = Arc::new(ScriptedFactory::new().script("calc-model", move |_req| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(LlmError::Server("503 Service Unavailable".into()))
    }));
    let pool = AutonomousPool::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        factory,
        Arc::clone(&fx.registry),
    );
    pool.activate(fx.registry.get("calc").unwrap()).await.unwrap();

    let mut failed = observe(&fx.bus, "observer", &["autonomous.task.failed"]).await;

    let execution_id = Uuid::new_v4();
    // Descriptor retry_config.max_retries = 2 flows into the event cap.
    let event = TaskEvent::new(
        routing::AUTONOMOUS_SUBMITTED,
        serde_json::json!({"prompt": "2+2"}),
    )
    .with_agent("calc")
    .with_execution_id(execution_id)
    .with_max_retries(2);
    fx.bus
        .publish(routing::AUTONOMOUS_SUBMITTED, &event, true)
        .await
        .unwrap();

    let failure = next_event(&mut failed).await;
    assert_eq!(failure.trace_id, event.trace_id);
    assert!(failure.payload["error"].as_str().unwrap().contains("503"));

    // Initial delivery plus two redeliveries.
    assert_eq!(deliveries.load(Ordering::SeqCst), 3);

    let mut dead = Vec::new();
    for _ in 0..200 {
        dead = fx.bus.dead_letters(routing::QUEUE_AUTONOMOUS).await;
        if !dead.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.retry_count, 2);
    assert_eq!(dead[0].routing_key, routing::AUTONOMOUS_SUBMITTED);

    let record = fx.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
}

const CHAT_YAML: &str = r#"
name: c1
mode: continuous
llm:
  provider: ollama
  model: chat-model
system_prompt: Remember the conversation.
continuous_config:
  idle_timeout_seconds: 900
  save_interval_seconds: 0
  max_conversation_history: 50
"#;

fn echo_behavior(request: &CompletionRequest) -> LlmResult<Completion> {
    let transcript: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == ChatRole::User)
        .map(|m| m.content.as_str())
        .collect();
    ok_completion("chat-model", format!("seen: {}", transcript.join(",")))
}

#[tokio::test]
async fn continuous_state_survives_runner_crash() {
    let fx = fixture(&[("c1.yaml", CHAT_YAML)]).await;
    let factory: Arc<ScriptedFactory> =
        Arc::new(ScriptedFactory::new().script("chat-model", echo_behavior));

    let mut results = observe(&fx.bus, "observer", &["continuous.result.c1"]).await;

    let runner = ContinuousRunner::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        Arc::clone(&fx.registry),
    );
    runner.activate(fx.registry.get("c1").unwrap()).await.unwrap();

    for turn in ["A", "B"] {
        let event = TaskEvent::new(
            routing::continuous_task("c1"),
            serde_json::json!({ "prompt": turn }),
        )
        .with_agent("c1")
        .with_execution_id(Uuid::new_v4());
        fx.bus
            .publish(&routing::continuous_task("c1"), &event, true)
            .await
            .unwrap();
        next_event(&mut results).await;
    }

    // Kill the runner without a graceful flush; saves already happened per
    // event (save_interval_seconds: 0).
    fx.bus.unsubscribe(&routing::continuous_queue("c1")).await.unwrap();
    drop(runner);

    let restarted = ContinuousRunner::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        Arc::clone(&fx.registry),
    );
    restarted
        .activate(fx.registry.get("c1").unwrap())
        .await
        .unwrap();

    let event = TaskEvent::new(
        routing::continuous_task("c1"),
        serde_json::json!({"prompt": "C"}),
    )
    .with_agent("c1")
    .with_execution_id(Uuid::new_v4());
    fx.bus
        .publish(&routing::continuous_task("c1"), &event, true)
        .await
        .unwrap();

    let reply = next_event(&mut results).await;
    let text = reply.payload["reply"].as_str().unwrap();
    assert!(text.contains("A") && text.contains("B") && text.contains("C"), "conversation lost: {text}");
    assert_eq!(reply.payload["event_count"], 3);

    let state = fx.store.load_continuous("c1").await.unwrap().unwrap();
    assert_eq!(state.event_count, 3);
}

#[tokio::test]
async fn continuous_idle_flush_evicts_and_reloads() {
    let fx = fixture(&[(
        "c1.yaml",
        &CHAT_YAML.replace("idle_timeout_seconds: 900", "idle_timeout_seconds: 0"),
    )])
    .await;
    let factory: Arc<ScriptedFactory> =
        Arc::new(ScriptedFactory::new().script("chat-model", echo_behavior));

    let mut results = observe(&fx.bus, "observer", &["continuous.result.c1"]).await;
    let runner = ContinuousRunner::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        Arc::clone(&fx.registry),
    )
    .with_idle_scan_interval(Duration::from_millis(50));
    runner.start();
    runner.activate(fx.registry.get("c1").unwrap()).await.unwrap();

    let event = TaskEvent::new(
        routing::continuous_task("c1"),
        serde_json::json!({"prompt": "A"}),
    )
    .with_agent("c1");
    fx.bus
        .publish(&routing::continuous_task("c1"), &event, true)
        .await
        .unwrap();
    next_event(&mut results).await;

    // idle_timeout 0 + fast scanner: the slot is flushed and evicted.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The evicted agent reloads from the durable tier on its next event.
    let event = TaskEvent::new(
        routing::continuous_task("c1"),
        serde_json::json!({"prompt": "B"}),
    )
    .with_agent("c1");
    fx.bus
        .publish(&routing::continuous_task("c1"), &event, true)
        .await
        .unwrap();
    let reply = next_event(&mut results).await;
    let text = reply.payload["reply"].as_str().unwrap();
    assert!(text.contains("A") && text.contains("B"), "state not reloaded: {text}");

    runner.shutdown().await.unwrap();
}

const PLANNER_YAML: &str = r#"
name: q-planner
mode: collaborative
llm:
  provider: ollama
  model: planner-model
system_prompt: Plan tasks across the team.
collaborative_config:
  preferred_collaborators: [e1, e2]
  max_plan_steps: 5
"#;

const E1_YAML: &str = r#"
name: e1
mode: autonomous
llm:
  provider: ollama
  model: e1-model
system_prompt: Execute research steps.
retry_config:
  max_retries: 2
"#;

const E2_YAML: &str = r#"
name: e2
mode: autonomous
llm:
  provider: ollama
  model: e2-model
system_prompt: Execute summary steps.
retry_config:
  max_retries: 2
"#;

#[tokio::test]
async fn collaborative_plan_runs_steps_in_order_and_aggregates() {
    let fx = fixture(&[
        ("q-planner.yaml", PLANNER_YAML),
        ("e1.yaml", E1_YAML),
        ("e2.yaml", E2_YAML),
    ])
    .await;
    let factory: Arc<ScriptedFactory> = Arc::new(
        ScriptedFactory::new()
            .script("planner-model", |_req| {
                ok_completion(
                    "planner-model",
                    r#"[{"description": "research the topic", "agent": "e1"},
                        {"description": "summarize findings", "agent": "e2"}]"#,
                )
            })
            .script("e1-model", |_req| ok_completion("e1-model", "research-notes"))
            .script("e2-model", |_req| ok_completion("e2-model", "final-summary")),
    );

    let autonomous = AutonomousPool::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        Arc::clone(&fx.registry),
    );
    autonomous.activate(fx.registry.get("e1").unwrap()).await.unwrap();
    autonomous.activate(fx.registry.get("e2").unwrap()).await.unwrap();

    let collaborative = CollaborativePool::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        Arc::clone(&fx.registry),
    );
    collaborative
        .activate(fx.registry.get("q-planner").unwrap())
        .await
        .unwrap();

    let mut completed = observe(&fx.bus, "observer", &["collaborative.task.completed"]).await;

    let execution_id = Uuid::new_v4();
    let event = TaskEvent::new(
        routing::COLLABORATIVE_SUBMITTED,
        serde_json::json!({"task": "write a report", "task_id": "t-report"}),
    )
    .with_agent("q-planner")
    .with_execution_id(execution_id);
    fx.bus
        .publish(routing::COLLABORATIVE_SUBMITTED, &event, true)
        .await
        .unwrap();

    let done = next_event(&mut completed).await;
    assert_eq!(done.trace_id, event.trace_id);
    assert_eq!(done.payload["task_id"], "t-report");
    let aggregated = done.payload["aggregated_result"].as_array().unwrap();
    assert_eq!(aggregated.len(), 2);
    assert_eq!(aggregated[0]["answer"], "research-notes");
    assert_eq!(aggregated[1]["answer"], "final-summary");

    let plan: maestro_pools::PlanRunState =
        fx.store.load_plan("t-report").await.unwrap().unwrap();
    assert_eq!(plan.status, maestro_pools::PlanStatus::Completed);
    assert_eq!(plan.current_step, 2);

    let record = fx.store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
}

const C9_YAML: &str = r#"
name: c9
mode: continuous
llm:
  provider: ollama
  model: c9-model
system_prompt: Never activated in this test.
continuous_config:
  idle_timeout_seconds: 900
"#;

#[tokio::test]
async fn collaborative_step_timeout_fails_plan_with_partial_results() {
    let fx = fixture(&[
        ("q-planner.yaml", PLANNER_YAML),
        ("e1.yaml", E1_YAML),
        ("c9.yaml", C9_YAML),
    ])
    .await;
    let factory: Arc<ScriptedFactory> = Arc::new(
        ScriptedFactory::new()
            .script("planner-model", |_req| {
                ok_completion(
                    "planner-model",
                    r#"[{"description": "research", "agent": "e1"},
                        {"description": "summarize", "agent": "c9"}]"#,
                )
            })
            .script("e1-model", |_req| ok_completion("e1-model", "partial-notes")),
    );

    let autonomous = AutonomousPool::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        Arc::clone(&fx.registry),
    );
    autonomous.activate(fx.registry.get("e1").unwrap()).await.unwrap();

    // c9 is known to the registry but never activated: its queue has no
    // consumer, so the second step can only time out.
    let collaborative = CollaborativePool::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        Arc::clone(&fx.registry),
    )
    .with_step_timeout(Duration::from_millis(300));
    collaborative
        .activate(fx.registry.get("q-planner").unwrap())
        .await
        .unwrap();

    let mut failed = observe(&fx.bus, "observer", &["collaborative.task.failed"]).await;

    let event = TaskEvent::new(
        routing::COLLABORATIVE_SUBMITTED,
        serde_json::json!({"task": "write a report", "task_id": "t-timeout"}),
    )
    .with_agent("q-planner")
    .with_execution_id(Uuid::new_v4());
    fx.bus
        .publish(routing::COLLABORATIVE_SUBMITTED, &event, true)
        .await
        .unwrap();

    let failure = next_event(&mut failed).await;
    assert_eq!(failure.payload["task_id"], "t-timeout");
    let partial = failure.payload["partial_results"].as_array().unwrap();
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0]["answer"], "partial-notes");

    let plan: maestro_pools::PlanRunState =
        fx.store.load_plan("t-timeout").await.unwrap().unwrap();
    assert_eq!(plan.status, maestro_pools::PlanStatus::Failed);
}

struct ClarifyingExecutor {
    bus: MemoryBus,
    deliveries: AtomicU32,
}

#[async_trait]
impl EventHandler for ClarifyingExecutor {
    async fn handle(&self, event: TaskEvent) -> HandlerOutcome {
        let n = self.deliveries.fetch_add(1, Ordering::SeqCst);
        let payload = if n == 0 {
            serde_json::json!({"clarification_request": "which units?"})
        } else {
            serde_json::json!({"answer": "42 km"})
        };
        let completed = TaskEvent::derived(&event, routing::AUTONOMOUS_COMPLETED, payload);
        self.bus
            .publish(routing::AUTONOMOUS_COMPLETED, &completed, true)
            .await
            .unwrap();
        HandlerOutcome::Ok
    }
}

#[tokio::test]
async fn collaborative_clarification_suspends_and_resumes() {
    let fx = fixture(&[("q-planner.yaml", PLANNER_YAML), ("e1.yaml", E1_YAML)]).await;
    let factory: Arc<ScriptedFactory> = Arc::new(ScriptedFactory::new().script(
        "planner-model",
        |_req| {
            ok_completion(
                "planner-model",
                r#"[{"description": "measure the distance", "agent": "e1"}]"#,
            )
        },
    ));

    // A hand-rolled executor stands in for the autonomous pool: its first
    // answer asks for clarification, the second one completes.
    fx.bus
        .subscribe(
            SubscribeOptions::new(
                routing::QUEUE_AUTONOMOUS,
                vec![routing::AUTONOMOUS_SUBMITTED.to_string()],
            ),
            Arc::new(ClarifyingExecutor {
                bus: fx.bus.clone(),
                deliveries: AtomicU32::new(0),
            }),
        )
        .await
        .unwrap();

    let collaborative = CollaborativePool::new(
        Arc::new(fx.bus.clone()),
        Arc::clone(&fx.store),
        Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        Arc::clone(&fx.registry),
    )
    .with_clarification_timeout(Duration::from_secs(3));
    collaborative
        .activate(fx.registry.get("q-planner").unwrap())
        .await
        .unwrap();

    let mut completed = observe(&fx.bus, "observer", &["collaborative.task.completed"]).await;

    let event = TaskEvent::new(
        routing::COLLABORATIVE_SUBMITTED,
        serde_json::json!({"task": "how far is it", "task_id": "t-clarify"}),
    )
    .with_agent("q-planner")
    .with_execution_id(Uuid::new_v4());
    fx.bus
        .publish(routing::COLLABORATIVE_SUBMITTED, &event, true)
        .await
        .unwrap();

    // Wait until the plan persists the suspension, then answer it.
    let mut waiting = false;
    for _ in 0..200 {
        if let Some(plan) = fx
            .store
            .load_plan::<maestro_pools::PlanRunState>("t-clarify")
            .await
            .unwrap()
        {
            if plan.status == maestro_pools::PlanStatus::WaitingClarification {
                waiting = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(waiting, "plan never suspended for clarification");

    let reply = TaskEvent::new(
        routing::CLARIFICATION_PROVIDED,
        serde_json::json!({"task_id": "t-clarify", "reply": "kilometers"}),
    );
    fx.bus
        .publish(routing::CLARIFICATION_PROVIDED, &reply, true)
        .await
        .unwrap();

    let done = next_event(&mut completed).await;
    let aggregated = done.payload["aggregated_result"].as_array().unwrap();
    assert_eq!(aggregated.len(), 1);
    assert_eq!(aggregated[0]["answer"], "42 km");

    let plan: maestro_pools::PlanRunState =
        fx.store.load_plan("t-clarify").await.unwrap().unwrap();
    assert_eq!(plan.status, maestro_pools::PlanStatus::Completed);
    assert!(plan
        .plan[0]
        .description
        .contains("Clarification: kilometers"));
}
