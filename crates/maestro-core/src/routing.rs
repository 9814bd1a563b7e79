//! Routing keys and queue names.
//!
//! Routing keys are dotted hierarchies (`<scope>.<action>[.<qualifier>]`).
//! Subscriptions match them with AMQP-style patterns where `*` matches one
//! segment and `#` matches zero or more.

use serde::{Deserialize, Serialize};

/// The execution discipline an agent belongs to. Determines which pool owns
/// the agent and which routing key its submissions are published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Autonomous,
    Collaborative,
    Continuous,
    Scheduled,
}

impl AgentMode {
    /// Routing key for a task submitted to an agent in this mode.
    pub fn submission_route(&self, agent_name: &str) -> String {
        match self {
            AgentMode::Autonomous => AUTONOMOUS_SUBMITTED.to_string(),
            AgentMode::Collaborative => COLLABORATIVE_SUBMITTED.to_string(),
            AgentMode::Continuous => continuous_task(agent_name),
            AgentMode::Scheduled => scheduled_task(agent_name),
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentMode::Autonomous => "autonomous",
            AgentMode::Collaborative => "collaborative",
            AgentMode::Continuous => "continuous",
            AgentMode::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

// Routing keys consumed by the disciplines.
pub const AUTONOMOUS_SUBMITTED: &str = "autonomous.task.submitted";
pub const AUTONOMOUS_COMPLETED: &str = "autonomous.task.completed";
pub const AUTONOMOUS_FAILED: &str = "autonomous.task.failed";
pub const AUTONOMOUS_TIMEOUT: &str = "autonomous.task.timeout";
pub const COLLABORATIVE_SUBMITTED: &str = "collaborative.task.submitted";
pub const COLLABORATIVE_COMPLETED: &str = "collaborative.task.completed";
pub const COLLABORATIVE_FAILED: &str = "collaborative.task.failed";
pub const CLARIFICATION_PROVIDED: &str = "collaborative.clarification.provided";

/// Durable queue names.
pub const QUEUE_AUTONOMOUS: &str = "pool.autonomous";
pub const QUEUE_COLLABORATIVE: &str = "pool.collaborative";
pub const QUEUE_SCHEDULER: &str = "scheduler.ticks";

pub fn continuous_task(agent_name: &str) -> String {
    format!("continuous.task.{agent_name}")
}

pub fn continuous_result(agent_name: &str) -> String {
    format!("continuous.result.{agent_name}")
}

pub fn scheduled_task(agent_name: &str) -> String {
    format!("scheduled.task.{agent_name}")
}

pub fn scheduled_timeout(agent_name: &str) -> String {
    format!("scheduled.task.{agent_name}.timeout")
}

pub fn continuous_queue(agent_name: &str) -> String {
    format!("agent.{agent_name}.continuous")
}

pub fn dlq_name(queue_name: &str) -> String {
    format!("dlq.{queue_name}")
}
