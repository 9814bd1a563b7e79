//! Durable topic-routed message dispatch.
//!
//! The orchestration core never speaks a broker protocol directly; it speaks
//! the [`DispatchBus`] contract. The in-process [`MemoryBus`] implements the
//! full delivery semantics — durable queues bound to topic patterns,
//! at-least-once delivery, exponential-backoff redelivery, and dead-letter
//! queues — so every consumer behaves identically when the contract is backed
//! by an external broker.
//!
//! Routing keys are dotted hierarchies; subscription patterns support `*`
//! (exactly one segment) and `#` (zero or more segments).

pub mod bus;
pub mod memory;
pub mod pattern;

pub use bus::{
    DeadLetter, DispatchBus, EventHandler, HandlerOutcome, QueueInfo, SubscribeOptions,
};
pub use memory::{BusConfig, MemoryBus};
pub use pattern::topic_matches;
