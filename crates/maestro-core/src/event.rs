use crate::error::MaestroResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_priority() -> u8 {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// The JSON envelope for every message on the dispatch bus.
///
/// `event_id` is unique per event and never reused after dead-lettering;
/// `trace_id` is assigned at ingress and preserved on every derived event so
/// a whole execution chain can be correlated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<Uuid>,
    /// 0 (lowest) to 9 (highest).
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
}

impl TaskEvent {
    /// Create a fresh event with a new `event_id` and `trace_id`.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            trace_id: Uuid::new_v4(),
            parent_event_id: None,
            priority: default_priority(),
            retry_count: 0,
            max_retries: default_max_retries(),
            payload,
            agent_name: None,
            execution_id: None,
        }
    }

    /// Create an event derived from `parent`: same `trace_id`, same
    /// `execution_id` and `agent_name`, `parent_event_id` set to the parent's
    /// `event_id`, and a fresh `event_id`.
    pub fn derived(parent: &TaskEvent, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            trace_id: parent.trace_id,
            parent_event_id: Some(parent.event_id),
            priority: parent.priority,
            retry_count: 0,
            max_retries: parent.max_retries,
            payload,
            agent_name: parent.agent_name.clone(),
            execution_id: parent.execution_id,
        }
    }

    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    /// Clamped to the valid 0..=9 range.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The routing key this event is published under. Event types are dotted
    /// hierarchies (`<scope>.<action>[.<qualifier>]`) and double as routing
    /// keys.
    pub fn routing_key(&self) -> &str {
        &self.event_type
    }

    /// First segment of the event type, e.g. `autonomous` for
    /// `autonomous.task.submitted`.
    pub fn scope(&self) -> &str {
        self.event_type.split('.').next().unwrap_or(&self.event_type)
    }

    pub fn to_json(&self) -> MaestroResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> MaestroResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
