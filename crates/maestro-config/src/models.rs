use maestro_core::{AgentMode, MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Bedrock,
    Ollama,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Bedrock => "bedrock",
            LlmProvider::Ollama => "ollama",
        };
        write!(f, "{s}")
    }
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

/// Per-agent LLM settings. Credentials are injected from the environment by
/// the registry, never written in the YAML files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

impl LlmConfig {
    /// Whether this provider cannot work without injected credentials.
    pub fn requires_credentials(&self) -> bool {
        !matches!(self.provider, LlmProvider::Ollama)
    }

    /// Whether the credentials this provider needs are present.
    pub fn has_credentials(&self) -> bool {
        match self.provider {
            LlmProvider::OpenAi | LlmProvider::Anthropic => self.api_key.is_some(),
            LlmProvider::Bedrock => {
                self.access_key_id.is_some() && self.secret_access_key.is_some()
            }
            LlmProvider::Ollama => true,
        }
    }
}

/// Authentication settings for an MCP tool endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAuth {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: HashMap<String, String>,
}

/// A tool an agent may call, addressed by URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ToolAuth>,
}

fn default_pool_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// Retry behaviour for autonomous one-shot executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_pool_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_pool_retries(),
            retry_delay_seconds: default_retry_delay(),
            exponential_backoff: true,
        }
    }
}

fn default_idle_timeout() -> u64 {
    900
}

fn default_save_interval() -> u64 {
    300
}

fn default_history() -> usize {
    50
}

/// Settings for long-running stateful agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_save_interval")]
    pub save_interval_seconds: u64,
    #[serde(default = "default_history")]
    pub max_conversation_history: usize,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            save_interval_seconds: default_save_interval(),
            max_conversation_history: default_history(),
        }
    }
}

fn default_plan_steps() -> usize {
    10
}

fn default_clarification_timeout() -> u64 {
    300
}

/// Settings for plan-driven multi-agent collaboration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborativeConfig {
    #[serde(default)]
    pub preferred_collaborators: Vec<String>,
    #[serde(default = "default_plan_steps")]
    pub max_plan_steps: usize,
    #[serde(default = "default_true")]
    pub allow_human_clarification: bool,
    #[serde(default = "default_clarification_timeout")]
    pub clarification_timeout_seconds: u64,
}

impl Default for CollaborativeConfig {
    fn default() -> Self {
        Self {
            preferred_collaborators: Vec::new(),
            max_plan_steps: default_plan_steps(),
            allow_human_clarification: true,
            clarification_timeout_seconds: default_clarification_timeout(),
        }
    }
}

/// How a scheduled agent is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Cron,
    Interval,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_task_timeout() -> u64 {
    300
}

/// Time-trigger settings for scheduled agents. Exactly one of `cron` /
/// `interval_seconds` must be set, matching `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_data: Option<serde_json::Value>,
    #[serde(default = "default_task_timeout")]
    pub timeout_seconds: u64,
}

fn default_max_execution_time() -> u64 {
    300
}

fn default_limit_retries() -> u32 {
    3
}

/// Execution limits applied by the pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_seconds: u64,
    #[serde(default = "default_limit_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_time_seconds: default_max_execution_time(),
            max_retries: default_limit_retries(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A complete agent definition, loaded from one YAML file.
///
/// Immutable after load; hot reload replaces the whole descriptor
/// atomically rather than mutating it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub mode: AgentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub llm: LlmConfig,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuous_config: Option<ContinuousConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborative_config: Option<CollaborativeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_config: Option<ScheduleConfig>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

impl AgentDescriptor {
    /// Validate the cross-field invariants the schema cannot express:
    /// the name charset, the exactly-one-discipline-block rule, and the
    /// cron-xor-interval rule for scheduled agents.
    pub fn validate(&self) -> MaestroResult<()> {
        if !valid_name(&self.name) {
            return Err(MaestroError::ConfigInvalid(format!(
                "agent name '{}' must match [a-z0-9][a-z0-9_-]*",
                self.name
            )));
        }

        let blocks: [(&str, bool, AgentMode); 4] = [
            ("retry_config", self.retry_config.is_some(), AgentMode::Autonomous),
            (
                "continuous_config",
                self.continuous_config.is_some(),
                AgentMode::Continuous,
            ),
            (
                "collaborative_config",
                self.collaborative_config.is_some(),
                AgentMode::Collaborative,
            ),
            (
                "schedule_config",
                self.schedule_config.is_some(),
                AgentMode::Scheduled,
            ),
        ];

        for (block_name, present, block_mode) in blocks {
            if present && block_mode != self.mode {
                return Err(MaestroError::ConfigInvalid(format!(
                    "agent '{}' has mode '{}' but carries {block_name}",
                    self.name, self.mode
                )));
            }
        }

        if let Some(schedule) = &self.schedule_config {
            let cron_set = schedule.cron.is_some();
            let interval_set = schedule.interval_seconds.is_some();
            if cron_set == interval_set {
                return Err(MaestroError::ConfigInvalid(format!(
                    "agent '{}' schedule must set exactly one of cron / interval_seconds",
                    self.name
                )));
            }
            match schedule.kind {
                ScheduleKind::Cron if !cron_set => {
                    return Err(MaestroError::ConfigInvalid(format!(
                        "agent '{}' schedule type is cron but no cron expression is set",
                        self.name
                    )));
                }
                ScheduleKind::Interval if !interval_set => {
                    return Err(MaestroError::ConfigInvalid(format!(
                        "agent '{}' schedule type is interval but interval_seconds is not set",
                        self.name
                    )));
                }
                _ => {}
            }
        } else if self.mode == AgentMode::Scheduled {
            return Err(MaestroError::ConfigInvalid(format!(
                "scheduled agent '{}' requires schedule_config",
                self.name
            )));
        }

        Ok(())
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry_config.clone().unwrap_or_default()
    }

    pub fn continuous(&self) -> ContinuousConfig {
        self.continuous_config.clone().unwrap_or_default()
    }

    pub fn collaborative(&self) -> CollaborativeConfig {
        self.collaborative_config.clone().unwrap_or_default()
    }
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_descriptor(mode: AgentMode) -> AgentDescriptor {
        AgentDescriptor {
            name: "worker-1".into(),
            mode,
            description: None,
            version: default_version(),
            enabled: true,
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                model: "llama3".into(),
                temperature: 0.7,
                max_tokens: 1024,
                api_key: None,
                base_url: None,
                region: None,
                access_key_id: None,
                secret_access_key: None,
            },
            system_prompt: "You are a worker.".into(),
            subscriptions: Vec::new(),
            tools: Vec::new(),
            tags: Vec::new(),
            retry_config: None,
            continuous_config: None,
            collaborative_config: None,
            schedule_config: None,
            resource_limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn valid_names() {
        assert!(valid_name("a"));
        assert!(valid_name("9lives"));
        assert!(valid_name("chat-bot_2"));
        assert!(!valid_name(""));
        assert!(!valid_name("Upper"));
        assert!(!valid_name("-leading"));
        assert!(!valid_name("has space"));
    }

    #[test]
    fn mismatched_block_rejected() {
        let mut descriptor = base_descriptor(AgentMode::Autonomous);
        descriptor.continuous_config = Some(ContinuousConfig::default());
        let err = descriptor.validate().unwrap_err();
        assert!(err.to_string().contains("continuous_config"));
    }

    #[test]
    fn matching_block_accepted() {
        let mut descriptor = base_descriptor(AgentMode::Autonomous);
        descriptor.retry_config = Some(RetryConfig::default());
        descriptor.validate().unwrap();
    }

    #[test]
    fn scheduled_requires_exactly_one_trigger() {
        let mut descriptor = base_descriptor(AgentMode::Scheduled);
        descriptor.schedule_config = Some(ScheduleConfig {
            kind: ScheduleKind::Interval,
            cron: None,
            interval_seconds: Some(60),
            timezone: default_timezone(),
            task_data: None,
            timeout_seconds: 300,
        });
        descriptor.validate().unwrap();

        let schedule = descriptor.schedule_config.as_mut().unwrap();
        schedule.cron = Some("0 * * * * *".into());
        assert!(descriptor.validate().is_err());

        let schedule = descriptor.schedule_config.as_mut().unwrap();
        schedule.cron = None;
        schedule.interval_seconds = None;
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn scheduled_without_block_rejected() {
        let descriptor = base_descriptor(AgentMode::Scheduled);
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn yaml_parses_with_defaults() {
        let yaml = r#"
name: summarizer
mode: autonomous
llm:
  provider: openai
  model: gpt-4o-mini
system_prompt: Summarize the input.
retry_config:
  max_retries: 2
"#;
        let descriptor: AgentDescriptor = serde_yaml_ng::from_str(yaml).unwrap();
        descriptor.validate().unwrap();
        assert_eq!(descriptor.name, "summarizer");
        assert_eq!(descriptor.mode, AgentMode::Autonomous);
        assert_eq!(descriptor.llm.provider, LlmProvider::OpenAi);
        assert!((descriptor.llm.temperature - 0.7).abs() < f32::EPSILON);
        assert!(descriptor.enabled);
        assert_eq!(descriptor.retry().max_retries, 2);
        assert_eq!(descriptor.resource_limits.max_execution_time_seconds, 300);
    }

    #[test]
    fn credentials_requirements_by_provider() {
        let mut llm = base_descriptor(AgentMode::Autonomous).llm;
        assert!(!llm.requires_credentials());
        assert!(llm.has_credentials());

        llm.provider = LlmProvider::OpenAi;
        assert!(llm.requires_credentials());
        assert!(!llm.has_credentials());
        llm.api_key = Some("sk-test".into());
        assert!(llm.has_credentials());

        llm.provider = LlmProvider::Bedrock;
        assert!(!llm.has_credentials());
        llm.access_key_id = Some("AKIA".into());
        llm.secret_access_key = Some("secret".into());
        assert!(llm.has_credentials());
    }
}
