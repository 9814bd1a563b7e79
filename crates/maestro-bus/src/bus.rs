use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult, TaskEvent};
use std::sync::Arc;
use std::time::Duration;

/// Result of handling one delivered event.
///
/// `Ok` acknowledges. `Retryable` negative-acks with a broker-side
/// exponential delay and dead-letters once retries are exhausted. `Fatal`
/// acknowledges and causes a synthetic `<scope>.task.failed` event to be
/// published with the original trace id. `Cancelled` releases the message
/// back to the queue untouched.
#[derive(Debug)]
pub enum HandlerOutcome {
    Ok,
    Retryable(MaestroError),
    Fatal(MaestroError),
    Cancelled,
}

/// Consumer callback invoked once per delivered event.
///
/// Delivery is at-least-once; handlers must be idempotent on `event_id`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: TaskEvent) -> HandlerOutcome;
}

/// Declaration of a durable queue plus its consumer.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub queue_name: String,
    /// Topic patterns the queue is bound to (`*` one segment, `#` zero+).
    pub patterns: Vec<String>,
    /// Maximum number of events handled concurrently. Continuous consumers
    /// use exactly 1 for fair dispatch and state serialization.
    pub prefetch: usize,
    /// When true (the default) a sibling `dlq.<queue_name>` receives events
    /// that exhaust their retries.
    pub enable_dlq: bool,
    /// Queue-level retry cap. The effective cap for an event is the smaller
    /// of this and the event's own `max_retries`.
    pub max_retries: u32,
    /// Events older than this at delivery time are dead-lettered as expired.
    pub message_ttl: Option<Duration>,
}

impl SubscribeOptions {
    pub fn new(queue_name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            patterns,
            prefetch: 1,
            enable_dlq: true,
            max_retries: 3,
            message_ttl: None,
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_dlq(mut self, enable: bool) -> Self {
        self.enable_dlq = enable;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

/// An event that exhausted its retries, with the failure context preserved.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: TaskEvent,
    pub reason: String,
    /// The routing key the event was originally published under.
    pub routing_key: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Counters for one queue, the operator's backlog signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub message_count: usize,
    pub consumer_count: usize,
}

/// The dispatch contract every Maestro service speaks.
///
/// Implementations provide durable topic-routed queues with publisher
/// confirms and at-least-once delivery.
#[async_trait]
pub trait DispatchBus: Send + Sync {
    /// Publish `event` under `routing_key`, returning once the broker has
    /// accepted it into every bound queue. Fails with
    /// [`MaestroError::QueueOverflow`] when a bound queue is full.
    async fn publish(
        &self,
        routing_key: &str,
        event: &TaskEvent,
        persistent: bool,
    ) -> MaestroResult<()>;

    /// Declare the queue (and its DLQ) and attach a consumer.
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn EventHandler>,
    ) -> MaestroResult<()>;

    /// Detach the consumer and wait for in-flight handlers. The queue and
    /// its buffered events are retained for a later re-subscribe.
    async fn unsubscribe(&self, queue_name: &str) -> MaestroResult<()>;

    /// Queue counters; accepts `dlq.<queue>` names too.
    async fn queue_info(&self, queue_name: &str) -> Option<QueueInfo>;

    /// Contents of a queue's DLQ.
    async fn dead_letters(&self, queue_name: &str) -> Vec<DeadLetter>;

    /// Drop all buffered messages, returning how many were dropped.
    /// `dlq.<queue>` names purge the dead-letter queue.
    async fn purge_queue(&self, queue_name: &str) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_options_defaults() {
        let options = SubscribeOptions::new("pool.autonomous", vec!["autonomous.task.submitted".into()]);
        assert_eq!(options.prefetch, 1);
        assert!(options.enable_dlq);
        assert_eq!(options.max_retries, 3);
        assert!(options.message_ttl.is_none());
    }

    #[test]
    fn prefetch_floor_is_one() {
        let options = SubscribeOptions::new("q", vec![]).with_prefetch(0);
        assert_eq!(options.prefetch, 1);
    }
}
