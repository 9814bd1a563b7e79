//! End-to-end delivery semantics of the in-process broker.

use async_trait::async_trait;
use maestro_bus::{
    BusConfig, DispatchBus, EventHandler, HandlerOutcome, MemoryBus, SubscribeOptions,
};
use maestro_core::{MaestroError, TaskEvent};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn fast_bus() -> MemoryBus {
    MemoryBus::new(BusConfig {
        queue_max_length: 100,
        backoff_base: Duration::from_millis(5),
    })
}

struct AlwaysRetryable {
    deliveries: Arc<AtomicU32>,
}

#[async_trait]
impl EventHandler for AlwaysRetryable {
    async fn handle(&self, _event: TaskEvent) -> HandlerOutcome {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::Retryable(MaestroError::Transient("503 from provider".into()))
    }
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

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn retries_then_dead_letters_with_context_preserved() {
    let bus = fast_bus();
    let deliveries = Arc::new(AtomicU32::new(0));
    bus.subscribe(
        SubscribeOptions::new("pool.autonomous", vec!["autonomous.task.submitted".into()])
            .with_max_retries(3),
        Arc::new(AlwaysRetryable {
            deliveries: Arc::clone(&deliveries),
        }),
    )
    .await
    .unwrap();

    let event =
        TaskEvent::new("autonomous.task.submitted", serde_json::json!({"prompt": "x"}))
            .with_max_retries(3);
    bus.publish("autonomous.task.submitted", &event, true)
        .await
        .unwrap();

    assert!(
        wait_until(
            || deliveries.load(Ordering::SeqCst) == 4,
            Duration::from_secs(2)
        )
        .await,
        "expected initial delivery plus three retries, saw {}",
        deliveries.load(Ordering::SeqCst)
    );

    let dead = loop {
        let dead = bus.dead_letters("pool.autonomous").await;
        if !dead.is_empty() {
            break dead;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.event_id, event.event_id);
    assert_eq!(dead[0].event.retry_count, 3);
    assert_eq!(dead[0].routing_key, "autonomous.task.submitted");
    assert!(dead[0].reason.contains("503"));

    let info = bus.queue_info("dlq.pool.autonomous").await.unwrap();
    assert_eq!(info.message_count, 1);
}

#[tokio::test]
async fn descriptor_level_retry_cap_takes_precedence() {
    let bus = fast_bus();
    let deliveries = Arc::new(AtomicU32::new(0));
    bus.subscribe(
        SubscribeOptions::new("pool.autonomous", vec!["autonomous.task.submitted".into()])
            .with_max_retries(3),
        Arc::new(AlwaysRetryable {
            deliveries: Arc::clone(&deliveries),
        }),
    )
    .await
    .unwrap();

    // Descriptor configured max_retries=2: two redeliveries, then DLQ.
    let event = TaskEvent::new("autonomous.task.submitted", serde_json::json!({}))
        .with_max_retries(2);
    bus.publish("autonomous.task.submitted", &event, true)
        .await
        .unwrap();

    assert!(
        wait_until(
            || deliveries.load(Ordering::SeqCst) == 3,
            Duration::from_secs(2)
        )
        .await
    );
    let mut dead = Vec::new();
    for _ in 0..200 {
        dead = bus.dead_letters("pool.autonomous").await;
        if !dead.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.retry_count, 2);
    // No further deliveries after dead-lettering.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn fatal_publishes_synthetic_failed_event() {
    let bus = fast_bus();

    struct FatalHandler;
    #[async_trait]
    impl EventHandler for FatalHandler {
        async fn handle(&self, _event: TaskEvent) -> HandlerOutcome {
            HandlerOutcome::Fatal(MaestroError::Permanent("unknown agent 'ghost'".into()))
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        SubscribeOptions::new("observer", vec!["autonomous.task.failed".into()]),
        Arc::new(Recorder { tx }),
    )
    .await
    .unwrap();
    bus.subscribe(
        SubscribeOptions::new("pool.autonomous", vec!["autonomous.task.submitted".into()]),
        Arc::new(FatalHandler),
    )
    .await
    .unwrap();

    let event = TaskEvent::new("autonomous.task.submitted", serde_json::json!({}))
        .with_agent("ghost");
    bus.publish("autonomous.task.submitted", &event, true)
        .await
        .unwrap();

    let failed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for failure event")
        .expect("channel closed");
    assert_eq!(failed.event_type, "autonomous.task.failed");
    assert_eq!(failed.trace_id, event.trace_id);
    assert_eq!(failed.parent_event_id, Some(event.event_id));
    assert!(failed.payload["error"]
        .as_str()
        .unwrap()
        .contains("unknown agent"));

    // The original message was acked: nothing in the DLQ.
    assert!(bus.dead_letters("pool.autonomous").await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prefetch_one_preserves_fifo_order() {
    let bus = fast_bus();
    let seen = Arc::new(Mutex::new(Vec::new()));

    struct SlowOrdered {
        seen: Arc<Mutex<Vec<String>>>,
    }
    #[async_trait]
    impl EventHandler for SlowOrdered {
        async fn handle(&self, event: TaskEvent) -> HandlerOutcome {
            // Force overlap if the consumer were concurrent.
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.seen
                .lock()
                .unwrap()
                .push(event.payload["n"].to_string());
            HandlerOutcome::Ok
        }
    }

    bus.subscribe(
        SubscribeOptions::new("agent.c1.continuous", vec!["continuous.task.c1".into()]),
        Arc::new(SlowOrdered {
            seen: Arc::clone(&seen),
        }),
    )
    .await
    .unwrap();

    for n in 0..5 {
        let event = TaskEvent::new("continuous.task.c1", serde_json::json!({ "n": n }));
        bus.publish("continuous.task.c1", &event, true)
            .await
            .unwrap();
    }

    assert!(
        wait_until(|| seen.lock().unwrap().len() == 5, Duration::from_secs(2)).await
    );
    let order: Vec<String> = seen.lock().unwrap().clone();
    assert_eq!(order, vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn queue_survives_consumer_detach_and_redelivers() {
    let bus = fast_bus();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // First consumer attaches and detaches (a crashed runner).
    bus.subscribe(
        SubscribeOptions::new("agent.c1.continuous", vec!["continuous.task.c1".into()]),
        Arc::new(Recorder { tx: tx.clone() }),
    )
    .await
    .unwrap();
    bus.unsubscribe("agent.c1.continuous").await.unwrap();

    let event = TaskEvent::new("continuous.task.c1", serde_json::json!({"turn": "C"}));
    bus.publish("continuous.task.c1", &event, true)
        .await
        .unwrap();
    let info = bus.queue_info("agent.c1.continuous").await.unwrap();
    assert_eq!(info.message_count, 1);
    assert_eq!(info.consumer_count, 0);

    // Restarted runner re-subscribes and receives the buffered event.
    bus.subscribe(
        SubscribeOptions::new("agent.c1.continuous", vec!["continuous.task.c1".into()]),
        Arc::new(Recorder { tx }),
    )
    .await
    .unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("closed");
    assert_eq!(delivered.event_id, event.event_id);
}

#[tokio::test]
async fn purge_clears_queue_and_dlq_separately() {
    let bus = fast_bus();
    let handler = Arc::new(AlwaysRetryable {
        deliveries: Arc::new(AtomicU32::new(0)),
    });
    bus.subscribe(
        SubscribeOptions::new("q", vec!["q.#".into()]).with_max_retries(0),
        handler,
    )
    .await
    .unwrap();

    let event = TaskEvent::new("q.task", serde_json::json!({})).with_max_retries(0);
    bus.publish("q.task", &event, true).await.unwrap();
    let mut dead = Vec::new();
    for _ in 0..200 {
        dead = bus.dead_letters("q").await;
        if !dead.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(dead.len(), 1);

    assert_eq!(bus.purge_queue("dlq.q").await, 1);
    assert!(bus.dead_letters("q").await.is_empty());
}
