use chrono::{DateTime, Utc};
use maestro_core::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Durable state of one continuous agent.
///
/// Created on the agent's first event, updated incrementally by the runner,
/// and persisted through the conditional-upsert path: `version` is the
/// optimistic-concurrency token and only ever advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousAgentState {
    pub agent_name: String,
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
    #[serde(default)]
    pub memory: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub event_count: u64,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl ContinuousAgentState {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            conversation: Vec::new(),
            memory: HashMap::new(),
            event_count: 0,
            last_activity: Utc::now(),
            version: 0,
        }
    }

    /// Append a turn and update the activity counters.
    pub fn record_turn(&mut self, user: ChatMessage, assistant: ChatMessage) {
        self.conversation.push(user);
        self.conversation.push(assistant);
        self.event_count += 1;
        self.last_activity = Utc::now();
    }

    /// Sliding-window pruning: keep at most `max` entries, dropping the
    /// oldest first.
    pub fn prune_conversation(&mut self, max: usize) {
        if self.conversation.len() > max {
            let excess = self.conversation.len() - max;
            self.conversation.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_turn_updates_counters() {
        let mut state = ContinuousAgentState::new("c1");
        state.record_turn(ChatMessage::user("A"), ChatMessage::assistant("ack A"));
        state.record_turn(ChatMessage::user("B"), ChatMessage::assistant("ack B"));
        assert_eq!(state.event_count, 2);
        assert_eq!(state.conversation.len(), 4);
    }

    #[test]
    fn prune_keeps_exactly_max_newest() {
        let mut state = ContinuousAgentState::new("c1");
        for i in 0..7 {
            state.conversation.push(ChatMessage::user(format!("m{i}")));
        }
        state.prune_conversation(4);
        assert_eq!(state.conversation.len(), 4);
        assert_eq!(state.conversation[0].content, "m3");
        assert_eq!(state.conversation[3].content, "m6");

        // Already within bounds: untouched.
        state.prune_conversation(10);
        assert_eq!(state.conversation.len(), 4);
    }

    #[test]
    fn round_trips_preserving_fields() {
        let mut state = ContinuousAgentState::new("c1");
        state.memory.insert("topic".into(), serde_json::json!("weather"));
        state.record_turn(ChatMessage::user("A"), ChatMessage::assistant("ok"));
        let json = serde_json::to_string(&state).unwrap();
        let parsed: ContinuousAgentState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.agent_name, "c1");
        assert_eq!(parsed.event_count, 1);
        assert_eq!(parsed.conversation.len(), 2);
        assert_eq!(parsed.memory["topic"], "weather");
        assert_eq!(parsed.version, 0);
    }
}
