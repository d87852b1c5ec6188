//! Per-agent runtime collaborators and the bounded pool that owns them.
//!
//! The core never looks inside a runtime: it sees `AgentRuntime` (config,
//! event recording, context injection, cost summary) and builds instances
//! through a `RuntimeFactory`. The pool bounds how many runtimes are live
//! at once and namespaces each one's on-disk state under its agent.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

mod config;
mod manager;
mod select;

pub use config::{
    apply_agent_namespace, merge_overlay, DirSetting, InfrastructureConfig, LedgerConfig,
    MemoryConfig, RuntimeConfig, ScheduleConfig,
};
pub use manager::{RuntimeManager, RuntimePoolConfig, RuntimeStatus, TaskGuard};
pub use select::{select_idle_evictable_agents_by_ttl, select_lru_evictable_agent, SlotUsage};

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn config(&self) -> &RuntimeConfig;

    /// Record a runtime-domain event. The core passes payloads through
    /// without inspecting them.
    async fn record_event(&self, event: serde_json::Value) -> Result<()>;

    /// Build the context injection for a prompt in a session.
    async fn build_injection(&self, session_id: &str, prompt: &str) -> Result<String>;

    /// Cost accounting summary for a session.
    async fn cost_summary(&self, session_id: &str) -> Result<serde_json::Value>;
}

impl std::fmt::Debug for dyn AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("config", self.config())
            .finish()
    }
}

#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn build(&self, agent_id: &str, config: RuntimeConfig) -> Result<Arc<dyn AgentRuntime>>;
}

/// Passthrough runtime used in wiring and tests: no injection, no cost.
pub struct StubRuntime {
    config: RuntimeConfig,
}

impl StubRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentRuntime for StubRuntime {
    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    async fn record_event(&self, _event: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn build_injection(&self, _session_id: &str, prompt: &str) -> Result<String> {
        Ok(prompt.to_string())
    }

    async fn cost_summary(&self, session_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "sessionId": session_id, "totalTokens": 0 }))
    }
}

pub struct StubRuntimeFactory;

#[async_trait]
impl RuntimeFactory for StubRuntimeFactory {
    async fn build(&self, _agent_id: &str, config: RuntimeConfig) -> Result<Arc<dyn AgentRuntime>> {
        Ok(Arc::new(StubRuntime::new(config)))
    }
}
