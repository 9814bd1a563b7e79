//! Shared types for the Maestro orchestration core.
//!
//! Everything that crosses a service boundary lives here: the [`TaskEvent`]
//! wire envelope, the [`MaestroError`] taxonomy, durable [`ExecutionRecord`]s,
//! conversation [`ChatMessage`]s, and the routing-key/queue-name vocabulary.
//!
//! # Main types
//!
//! - [`TaskEvent`] — JSON event envelope published on the dispatch bus.
//! - [`ExecutionRecord`] — durable audit record for a single execution.
//! - [`AgentMode`] — the execution discipline an agent belongs to.
//! - [`MaestroError`] / [`MaestroResult`] — error taxonomy shared by all crates.

pub mod chat;
pub mod error;
pub mod event;
pub mod execution;
pub mod routing;

pub use chat::{ChatMessage, ChatRole};
pub use error::{MaestroError, MaestroResult};
pub use event::TaskEvent;
pub use execution::{ExecutionRecord, ExecutionStatus};
pub use routing::AgentMode;
