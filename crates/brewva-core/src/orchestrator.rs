//! Dispatch backend: resolves agents against the registry, leases runtimes
//! from the pool, and runs tasks through the injected `TaskRunner` seam.
//! Inference itself lives outside the core; the orchestrator only frames
//! each turn with events and context injection.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use brewva_events::{event_types, EventStore};
use brewva_registry::AgentRegistry;
use brewva_runtime::{AgentRuntime, RuntimeManager};
use tokio::sync::Mutex;

use crate::coordinator::{AgentDispatcher, DispatchInput, DispatchOutcome};

/// The out-of-scope inference seam. Implementations get the runtime, the
/// session, and the already-injected prompt, and return the reply text.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        runtime: Arc<dyn AgentRuntime>,
        agent_id: &str,
        session_id: &str,
        prompt: &str,
    ) -> Result<String>;
}

/// Deterministic runner for wiring and tests.
pub struct StubTaskRunner;

#[async_trait]
impl TaskRunner for StubTaskRunner {
    async fn run(
        &self,
        _runtime: Arc<dyn AgentRuntime>,
        agent_id: &str,
        _session_id: &str,
        prompt: &str,
    ) -> Result<String> {
        Ok(format!("stub:{agent_id}:{prompt}"))
    }
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    runtimes: Arc<RuntimeManager>,
    events: Arc<EventStore>,
    task_runner: Arc<dyn TaskRunner>,
    sessions: Mutex<HashMap<String, String>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        runtimes: Arc<RuntimeManager>,
        events: Arc<EventStore>,
        task_runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            registry,
            runtimes,
            events,
            task_runner,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    /// Session identity for an agent's own event log.
    pub fn agent_session_id(agent_id: &str) -> String {
        format!("agent:{agent_id}")
    }

    async fn run_task(&self, input: &DispatchInput) -> Result<String> {
        let agent_id = input.agent_id.as_str();
        let runtime = self.runtimes.get_or_create_runtime(agent_id).await?;
        let _task_guard = self.runtimes.begin_task(agent_id).await;

        let session_id = Self::agent_session_id(agent_id);
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), agent_id.to_string());

        self.events
            .append(
                &session_id,
                event_types::TURN_START,
                None,
                serde_json::json!({
                    "agentId": agent_id,
                    "parentSessionId": input.parent_session_id,
                    "depth": input.depth,
                    "hops": input.hops,
                }),
            )
            .await?;

        let prompt = runtime.build_injection(&session_id, &input.task).await?;
        let result = self
            .task_runner
            .run(runtime, agent_id, &session_id, &prompt)
            .await;

        let end_payload = match &result {
            Ok(text) => serde_json::json!({
                "agentId": agent_id,
                "ok": true,
                "responseChars": text.len(),
            }),
            Err(e) => serde_json::json!({
                "agentId": agent_id,
                "ok": false,
                "error": e.to_string(),
            }),
        };
        self.events
            .append(&session_id, event_types::TURN_END, None, end_payload)
            .await?;

        result
    }
}

#[async_trait]
impl AgentDispatcher for Orchestrator {
    async fn dispatch(&self, input: DispatchInput) -> DispatchOutcome {
        let agent_id = input.agent_id.clone();
        if !self.registry.is_active(&agent_id).await {
            return DispatchOutcome::failure(
                agent_id.clone(),
                format!("unknown_agent_id:{agent_id}"),
            );
        }

        match self.run_task(&input).await {
            Ok(text) => DispatchOutcome {
                ok: true,
                agent_id,
                response_text: Some(text),
                error: None,
            },
            Err(e) => DispatchOutcome::failure(agent_id, e.to_string()),
        }
    }

    async fn is_agent_active(&self, agent_id: &str) -> bool {
        self.registry.is_active(agent_id).await
    }

    async fn list_agents(&self) -> Vec<String> {
        self.registry.list_active_ids().await
    }

    async fn resolve_agent_by_session_id(&self, session_id: &str) -> Option<String> {
        self.sessions.lock().await.get(session_id).cloned()
    }
}
