//! In-process broker implementing the [`DispatchBus`] contract.
//!
//! Queues are bounded, bound to topic patterns, and survive consumer
//! detach/re-attach, which is what crash recovery of a consumer looks like
//! inside one process. Delivery semantics (prefetch, backoff redelivery,
//! dead-lettering, synthetic failure events) match what an external broker
//! binding would provide, so consumers are written once against the
//! contract.

use crate::bus::{
    DeadLetter, DispatchBus, EventHandler, HandlerOutcome, QueueInfo, SubscribeOptions,
};
use crate::pattern::topic_matches;
use async_trait::async_trait;
use chrono::Utc;
use maestro_core::{MaestroError, MaestroResult, TaskEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, info, warn};

/// Broker tuning. The backoff base is injectable so retry paths can run at
/// millisecond scale in tests.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub queue_max_length: usize,
    /// One backoff unit; the redelivery delay is `min(2^retry_count, 16)`
    /// units.
    pub backoff_base: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_max_length: 10_000,
            backoff_base: Duration::from_secs(1),
        }
    }
}

struct Envelope {
    priority: u8,
    body: String,
    routing_key: String,
    enqueued_at: Instant,
}

struct Consumer {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

struct QueueHandle {
    name: String,
    max_length: usize,
    bindings: Mutex<Vec<String>>,
    buffer: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    dlq: Mutex<Vec<DeadLetter>>,
    dlq_enabled: AtomicBool,
    consumer: tokio::sync::Mutex<Option<Consumer>>,
}

impl QueueHandle {
    fn new(name: String, max_length: usize) -> Self {
        Self {
            name,
            max_length,
            bindings: Mutex::new(Vec::new()),
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dlq: Mutex::new(Vec::new()),
            dlq_enabled: AtomicBool::new(true),
            consumer: tokio::sync::Mutex::new(None),
        }
    }

    fn matches(&self, routing_key: &str) -> bool {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        bindings.iter().any(|p| topic_matches(p, routing_key))
    }

    /// Insert keeping the buffer ordered by priority (higher first), FIFO
    /// within a priority level.
    fn enqueue(&self, envelope: Envelope) -> MaestroResult<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() >= self.max_length {
            return Err(MaestroError::QueueOverflow {
                queue: self.name.clone(),
                limit: self.max_length,
            });
        }
        let position = buffer
            .iter()
            .rposition(|existing| existing.priority >= envelope.priority);
        match position {
            Some(index) => buffer.insert(index + 1, envelope),
            None => buffer.push_front(envelope),
        }
        drop(buffer);
        self.notify.notify_one();
        Ok(())
    }

    /// Put a released message back at the head of the queue.
    fn requeue_front(&self, envelope: Envelope) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push_front(envelope);
        drop(buffer);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Envelope> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn dead_letter(&self, event: TaskEvent, routing_key: String, reason: String) {
        if !self.dlq_enabled.load(Ordering::Relaxed) {
            warn!(
                queue = %self.name,
                event_id = %event.event_id,
                reason = %reason,
                "DLQ disabled, dropping message"
            );
            return;
        }
        warn!(
            queue = %self.name,
            event_id = %event.event_id,
            retry_count = event.retry_count,
            reason = %reason,
            "Dead-lettering message"
        );
        let mut dlq = self.dlq.lock().unwrap_or_else(|e| e.into_inner());
        dlq.push(DeadLetter {
            event,
            reason,
            routing_key,
            dead_lettered_at: Utc::now(),
        });
    }
}

struct BusInner {
    config: BusConfig,
    queues: RwLock<HashMap<String, Arc<QueueHandle>>>,
}

impl BusInner {
    fn get_or_create(&self, queue_name: &str) -> Arc<QueueHandle> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue_name)
        {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(queues.entry(queue_name.to_string()).or_insert_with(|| {
            Arc::new(QueueHandle::new(
                queue_name.to_string(),
                self.config.queue_max_length,
            ))
        }))
    }

    fn get(&self, queue_name: &str) -> Option<Arc<QueueHandle>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue_name)
            .cloned()
    }

    /// Deliver into every queue whose bindings match; publisher confirm is
    /// the successful insertion into all of them.
    fn publish_internal(&self, routing_key: &str, event: &TaskEvent) -> MaestroResult<()> {
        let body = event.to_json()?;
        let matched: Vec<Arc<QueueHandle>> = {
            let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
            queues
                .values()
                .filter(|q| q.matches(routing_key))
                .cloned()
                .collect()
        };
        if matched.is_empty() {
            debug!(routing_key, event_id = %event.event_id, "No queue bound, message dropped");
            return Ok(());
        }
        for queue in &matched {
            queue.enqueue(Envelope {
                priority: event.priority,
                body: body.clone(),
                routing_key: routing_key.to_string(),
                enqueued_at: Instant::now(),
            })?;
        }
        debug!(
            routing_key,
            event_id = %event.event_id,
            queues = matched.len(),
            "Published event"
        );
        Ok(())
    }
}

/// The in-process [`DispatchBus`].
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                queues: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[async_trait]
impl DispatchBus for MemoryBus {
    async fn publish(
        &self,
        routing_key: &str,
        event: &TaskEvent,
        _persistent: bool,
    ) -> MaestroResult<()> {
        self.inner.publish_internal(routing_key, event)
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn EventHandler>,
    ) -> MaestroResult<()> {
        let queue = self.inner.get_or_create(&options.queue_name);
        {
            let mut bindings = queue.bindings.lock().unwrap_or_else(|e| e.into_inner());
            for pattern in &options.patterns {
                if !bindings.contains(pattern) {
                    bindings.push(pattern.clone());
                }
            }
        }
        queue
            .dlq_enabled
            .store(options.enable_dlq, Ordering::Relaxed);

        let mut slot = queue.consumer.lock().await;
        if slot.is_some() {
            return Err(MaestroError::ConfigInvalid(format!(
                "queue '{}' already has a consumer",
                options.queue_name
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(consumer_loop(
            Arc::clone(&self.inner),
            Arc::clone(&queue),
            options.clone(),
            handler,
            shutdown_rx,
        ));
        *slot = Some(Consumer {
            shutdown: shutdown_tx,
            join,
        });

        info!(
            queue = %options.queue_name,
            patterns = ?options.patterns,
            prefetch = options.prefetch,
            dlq = options.enable_dlq,
            "Subscribed"
        );
        Ok(())
    }

    async fn unsubscribe(&self, queue_name: &str) -> MaestroResult<()> {
        let queue = self
            .inner
            .get(queue_name)
            .ok_or_else(|| MaestroError::NotFound(format!("queue '{queue_name}'")))?;
        let consumer = queue.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            let _ = consumer.shutdown.send(true);
            queue.notify.notify_waiters();
            if consumer.join.await.is_err() {
                warn!(queue = %queue_name, "Consumer task panicked during unsubscribe");
            }
            info!(queue = %queue_name, "Unsubscribed, queue retained");
        }
        Ok(())
    }

    async fn queue_info(&self, queue_name: &str) -> Option<QueueInfo> {
        if let Some(base) = queue_name.strip_prefix("dlq.") {
            let queue = self.inner.get(base)?;
            let count = queue.dlq.lock().unwrap_or_else(|e| e.into_inner()).len();
            return Some(QueueInfo {
                message_count: count,
                consumer_count: 0,
            });
        }
        let queue = self.inner.get(queue_name)?;
        let message_count = queue
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        let consumer_count = usize::from(queue.consumer.lock().await.is_some());
        Some(QueueInfo {
            message_count,
            consumer_count,
        })
    }

    async fn dead_letters(&self, queue_name: &str) -> Vec<DeadLetter> {
        let base = queue_name.strip_prefix("dlq.").unwrap_or(queue_name);
        match self.inner.get(base) {
            Some(queue) => queue
                .dlq
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            None => Vec::new(),
        }
    }

    async fn purge_queue(&self, queue_name: &str) -> usize {
        if let Some(base) = queue_name.strip_prefix("dlq.") {
            if let Some(queue) = self.inner.get(base) {
                let mut dlq = queue.dlq.lock().unwrap_or_else(|e| e.into_inner());
                let purged = dlq.len();
                dlq.clear();
                return purged;
            }
            return 0;
        }
        match self.inner.get(queue_name) {
            Some(queue) => {
                let mut buffer = queue.buffer.lock().unwrap_or_else(|e| e.into_inner());
                let purged = buffer.len();
                buffer.clear();
                purged
            }
            None => 0,
        }
    }
}

async fn consumer_loop(
    inner: Arc<BusInner>,
    queue: Arc<QueueHandle>,
    options: SubscribeOptions,
    handler: Arc<dyn EventHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(options.prefetch));

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Fair dispatch: take a delivery slot before pulling a message.
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        let envelope = loop {
            if *shutdown_rx.borrow() {
                break None;
            }
            if let Some(envelope) = queue.pop() {
                break Some(envelope);
            }
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = shutdown_rx.changed() => {}
            }
        };
        let Some(envelope) = envelope else {
            drop(permit);
            break;
        };

        if let Some(ttl) = options.message_ttl {
            if envelope.enqueued_at.elapsed() > ttl {
                match TaskEvent::from_json(&envelope.body) {
                    Ok(event) => queue.dead_letter(
                        event,
                        envelope.routing_key.clone(),
                        "message TTL expired".to_string(),
                    ),
                    Err(e) => warn!(queue = %queue.name, error = %e, "Dropping expired unparseable message"),
                }
                drop(permit);
                continue;
            }
        }

        let event = match TaskEvent::from_json(&envelope.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(queue = %queue.name, error = %e, "Unparseable message dropped");
                drop(permit);
                continue;
            }
        };

        let inner = Arc::clone(&inner);
        let queue = Arc::clone(&queue);
        let handler = Arc::clone(&handler);
        let options = options.clone();
        tokio::spawn(async move {
            debug!(
                queue = %queue.name,
                event_id = %event.event_id,
                event_type = %event.event_type,
                retry_count = event.retry_count,
                "Delivering event"
            );
            let outcome = handler.handle(event.clone()).await;
            process_outcome(&inner, &queue, &options, envelope, event, outcome);
            drop(permit);
        });
    }

    // Wait for in-flight handlers before reporting the consumer stopped.
    let _ = semaphore.acquire_many(options.prefetch as u32).await;
    debug!(queue = %queue.name, "Consumer loop exited");
}

fn process_outcome(
    inner: &Arc<BusInner>,
    queue: &Arc<QueueHandle>,
    options: &SubscribeOptions,
    envelope: Envelope,
    event: TaskEvent,
    outcome: HandlerOutcome,
) {
    match outcome {
        HandlerOutcome::Ok => {
            debug!(queue = %queue.name, event_id = %event.event_id, "Acked");
        }
        HandlerOutcome::Retryable(err) => {
            let effective_max = event.max_retries.min(options.max_retries);
            if event.retry_count >= effective_max {
                // Exhausted retries are user-visible: announce the failure,
                // then dead-letter with the context preserved.
                publish_failure(inner, &envelope.routing_key, &event, &err);
                queue.dead_letter(event, envelope.routing_key, err.to_string());
                return;
            }
            let units = 1u64 << event.retry_count.min(4);
            let delay = inner.config.backoff_base * units as u32;
            let mut retried = event;
            retried.retry_count += 1;
            info!(
                queue = %queue.name,
                event_id = %retried.event_id,
                retry = retried.retry_count,
                max = effective_max,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Requeueing with backoff"
            );
            let body = match retried.to_json() {
                Ok(body) => body,
                Err(e) => {
                    warn!(queue = %queue.name, error = %e, "Could not reserialize for retry");
                    return;
                }
            };
            let redelivery = Envelope {
                priority: envelope.priority,
                body,
                routing_key: envelope.routing_key,
                enqueued_at: Instant::now(),
            };
            let target = Arc::clone(queue);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let routing_key = redelivery.routing_key.clone();
                if let Err(e) = target.enqueue(redelivery) {
                    warn!(queue = %target.name, routing_key = %routing_key, error = %e, "Redelivery failed");
                }
            });
        }
        HandlerOutcome::Fatal(err) => {
            warn!(
                queue = %queue.name,
                event_id = %event.event_id,
                error = %err,
                "Fatal outcome, publishing failure event"
            );
            publish_failure(inner, &envelope.routing_key, &event, &err);
        }
        HandlerOutcome::Cancelled => {
            debug!(queue = %queue.name, event_id = %event.event_id, "Released back to queue");
            queue.requeue_front(envelope);
        }
    }
}

/// Synthetic `<scope>.task.failed` carrying the original trace id. A failed
/// event failing again must not spawn another one.
fn publish_failure(
    inner: &Arc<BusInner>,
    routing_key: &str,
    event: &TaskEvent,
    err: &MaestroError,
) {
    if routing_key.ends_with(".failed") {
        return;
    }
    let scope = event.scope().to_string();
    let failed = TaskEvent::derived(
        event,
        format!("{scope}.task.failed"),
        serde_json::json!({
            "error": err.to_string(),
            "failed_event_type": event.event_type,
        }),
    );
    let key = failed.event_type.clone();
    if let Err(e) = inner.publish_internal(&key, &failed) {
        warn!(error = %e, "Could not publish failure event");
    }
}
