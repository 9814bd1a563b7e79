//! Execution disciplines.
//!
//! Each discipline implements the [`Discipline`] capability the orchestrator
//! drives: activate an agent, deactivate it (draining), report heartbeats,
//! and cancel executions. Pools are composed from the dispatch bus, the
//! state store, and a provider factory; they own their active executions and
//! nothing else.

pub mod autonomous;
pub mod collaborative;
pub mod completion;
pub mod continuous;
pub mod discipline;
pub mod plan;

pub use autonomous::AutonomousPool;
pub use collaborative::CollaborativePool;
pub use completion::CompletionWaiter;
pub use continuous::ContinuousRunner;
pub use discipline::{Discipline, HeartbeatBoard};
pub use plan::{Clarification, PlanRunState, PlanStatus, PlanStep, StepStatus};
