use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a collaborative plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Planning,
    Running,
    WaitingClarification,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One executor step inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    /// Name of the agent assigned to execute this step.
    pub agent: String,
    #[serde(default = "pending")]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

fn pending() -> StepStatus {
    StepStatus::Pending
}

impl PlanStep {
    pub fn new(description: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            agent: agent.into(),
            status: StepStatus::Pending,
            result: None,
        }
    }
}

/// An out-of-band question pausing the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

/// Durable state of one collaborative run, persisted as a single blob with
/// `UNIQUE(task_id)` upsert semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRunState {
    pub task_id: String,
    pub trace_id: Uuid,
    pub plan: Vec<PlanStep>,
    pub current_step: usize,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_result: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl PlanRunState {
    pub fn new(task_id: impl Into<String>, trace_id: Uuid) -> Self {
        Self {
            task_id: task_id.into(),
            trace_id,
            plan: Vec::new(),
            current_step: 0,
            status: PlanStatus::Planning,
            clarification: None,
            aggregated_result: None,
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Step results in plan order, for the aggregation stage.
    pub fn ordered_results(&self) -> Vec<serde_json::Value> {
        self.plan
            .iter()
            .filter_map(|step| step.result.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_preserving_order_and_cursor() {
        let mut plan = PlanRunState::new("t1", Uuid::new_v4());
        plan.plan = vec![PlanStep::new("first", "e1"), PlanStep::new("second", "e2")];
        plan.current_step = 1;
        plan.plan[0].status = StepStatus::Completed;
        plan.plan[0].result = Some(serde_json::json!({"answer": "a"}));
        plan.status = PlanStatus::Running;

        let json = serde_json::to_string(&plan).unwrap();
        let parsed: PlanRunState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.current_step, 1);
        assert_eq!(parsed.plan.len(), 2);
        assert_eq!(parsed.plan[0].description, "first");
        assert_eq!(parsed.plan[1].agent, "e2");
        assert_eq!(parsed.status, PlanStatus::Running);
    }

    #[test]
    fn ordered_results_skip_unfinished_steps() {
        let mut plan = PlanRunState::new("t1", Uuid::new_v4());
        plan.plan = vec![PlanStep::new("a", "e1"), PlanStep::new("b", "e2")];
        plan.plan[0].result = Some(serde_json::json!(1));
        assert_eq!(plan.ordered_results(), vec![serde_json::json!(1)]);
    }

    #[test]
    fn terminal_statuses() {
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(!PlanStatus::WaitingClarification.is_terminal());
        assert!(!PlanStatus::Planning.is_terminal());
    }

    #[test]
    fn status_wire_format() {
        let json = serde_json::to_string(&PlanStatus::WaitingClarification).unwrap();
        assert_eq!(json, "\"WAITING_CLARIFICATION\"");
    }
}
