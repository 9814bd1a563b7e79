//! Agent descriptor models and the configuration registry.
//!
//! Descriptors are YAML files in a configuration directory, one agent per
//! file. The [`ConfigRegistry`] discovers and validates them at startup,
//! injects provider credentials from the environment, and (optionally)
//! watches the directory for changes with a 500 ms debounce, replacing
//! descriptors atomically and notifying subscribers.

pub mod models;
pub mod registry;
pub mod settings;

pub use models::{
    AgentDescriptor, CollaborativeConfig, ContinuousConfig, LlmConfig, LlmProvider, ResourceLimits,
    RetryConfig, ScheduleConfig, ScheduleKind, ToolAuth, ToolConfig,
};
pub use registry::{ConfigRegistry, ReloadEvent};
pub use settings::PlatformSettings;
