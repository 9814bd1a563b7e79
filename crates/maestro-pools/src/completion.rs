//! Fan-in for step awaits: a single filtered subscription dispatching to
//! bounded one-shot waits, instead of ad-hoc callbacks.

use async_trait::async_trait;
use maestro_bus::{DispatchBus, EventHandler, HandlerOutcome, SubscribeOptions};
use maestro_core::{routing, MaestroResult, TaskEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

const WAITER_QUEUE: &str = "pool.collaborative.completions";

/// Correlates terminal events back to in-flight plan steps.
///
/// Register interest *before* publishing the step event, then wait with a
/// bound; late or unclaimed events are dropped.
pub struct CompletionWaiter {
    executions: Mutex<HashMap<uuid::Uuid, oneshot::Sender<TaskEvent>>>,
    clarifications: Mutex<HashMap<String, oneshot::Sender<TaskEvent>>>,
}

impl CompletionWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            executions: Mutex::new(HashMap::new()),
            clarifications: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe the shared completions queue.
    pub async fn start(self: &Arc<Self>, bus: &dyn DispatchBus) -> MaestroResult<()> {
        let options = SubscribeOptions::new(
            WAITER_QUEUE,
            vec![
                "*.task.completed".to_string(),
                "*.task.failed".to_string(),
                "*.task.timeout".to_string(),
                "*.task.*.completed".to_string(),
                "*.task.*.timeout".to_string(),
                "continuous.result.*".to_string(),
                routing::CLARIFICATION_PROVIDED.to_string(),
            ],
        )
        .with_prefetch(8)
        .with_dlq(false);
        bus.subscribe(options, Arc::clone(self) as Arc<dyn EventHandler>)
            .await
    }

    /// Register interest in an execution's terminal event. Must happen
    /// before the step event is published.
    pub fn register_execution(&self, execution_id: uuid::Uuid) -> oneshot::Receiver<TaskEvent> {
        let (tx, rx) = oneshot::channel();
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(execution_id, tx);
        rx
    }

    pub fn register_clarification(&self, task_id: &str) -> oneshot::Receiver<TaskEvent> {
        let (tx, rx) = oneshot::channel();
        self.clarifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), tx);
        rx
    }

    /// Bounded wait on a previously registered receiver.
    pub async fn wait(
        receiver: oneshot::Receiver<TaskEvent>,
        timeout: Duration,
    ) -> Option<TaskEvent> {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(event)) => Some(event),
            _ => None,
        }
    }

    pub fn forget_execution(&self, execution_id: uuid::Uuid) {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&execution_id);
    }

    pub fn forget_clarification(&self, task_id: &str) {
        self.clarifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }
}

#[async_trait]
impl EventHandler for CompletionWaiter {
    async fn handle(&self, event: TaskEvent) -> HandlerOutcome {
        if event.event_type == routing::CLARIFICATION_PROVIDED {
            if let Some(task_id) = event.payload["task_id"].as_str() {
                let waiter = self
                    .clarifications
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(task_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(event);
                } else {
                    debug!(task_id, "Clarification reply with no waiting plan");
                }
            }
            return HandlerOutcome::Ok;
        }

        if let Some(execution_id) = event.execution_id {
            let waiter = self
                .executions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&execution_id);
            if let Some(tx) = waiter {
                let _ = tx.send(event);
            }
        }
        HandlerOutcome::Ok
    }
}
