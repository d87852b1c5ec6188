//! Multi-party dispatch: fan-out, round-robin discussion, and bounded
//! agent-to-agent messaging.
//!
//! The coordinator owns no agent state. It filters targets through the
//! injected dispatcher's view of active agents, dispatches in parallel where
//! the semantics allow it, and always reports results in the caller's agent
//! order regardless of completion order. Limit and routing failures are
//! returned in-band, never raised.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Early-termination token for discussions.
pub const DISCUSSION_DONE_TOKEN: &str = "[DONE]";

#[derive(Debug, Clone, Default)]
pub struct DispatchInput {
    pub agent_id: String,
    pub task: String,
    pub parent_session_id: Option<String>,
    pub depth: Option<u32>,
    pub hops: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub ok: bool,
    pub agent_id: String,
    pub response_text: Option<String>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn failure(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            agent_id: agent_id.into(),
            response_text: None,
            error: Some(error.into()),
        }
    }
}

/// The coordinator's view of the rest of the system.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, input: DispatchInput) -> DispatchOutcome;
    async fn is_agent_active(&self, agent_id: &str) -> bool;
    async fn list_agents(&self) -> Vec<String>;

    /// Map a session back to the agent that owns it, for self-send checks.
    async fn resolve_agent_by_session_id(&self, _session_id: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CoordinatorLimits {
    pub fanout_max_agents: usize,
    pub max_discussion_rounds: u32,
    pub a2a_max_depth: u32,
    pub a2a_max_hops: u32,
}

impl Default for CoordinatorLimits {
    fn default() -> Self {
        Self {
            fanout_max_agents: 4,
            max_discussion_rounds: 3,
            a2a_max_depth: 2,
            a2a_max_hops: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub agent_id: String,
    pub response_text: Option<String>,
    pub error: Option<String>,
}

impl From<DispatchOutcome> for AgentReply {
    fn from(outcome: DispatchOutcome) -> Self {
        Self {
            agent_id: outcome.agent_id,
            response_text: outcome.response_text,
            error: outcome.error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutResult {
    pub ok: bool,
    pub error: Option<String>,
    pub results: Vec<AgentReply>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscussResult {
    pub ok: bool,
    pub rounds: Vec<Vec<AgentReply>>,
    pub stopped_early: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct A2aSend {
    pub from_session_id: String,
    pub to_agent_id: String,
    pub message: String,
    pub depth: Option<u32>,
    pub hops: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct A2aBroadcast {
    pub from_session_id: String,
    pub to_agent_ids: Vec<String>,
    pub message: String,
    pub depth: Option<u32>,
    pub hops: Option<u32>,
}

pub struct ChannelCoordinator {
    limits: CoordinatorLimits,
    dispatcher: Arc<dyn AgentDispatcher>,
    forbid_self_a2a: bool,
    cancel: CancellationToken,
}

impl ChannelCoordinator {
    pub fn new(limits: CoordinatorLimits, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self {
            limits,
            dispatcher,
            forbid_self_a2a: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_forbid_self_a2a(mut self, forbid: bool) -> Self {
        self.forbid_self_a2a = forbid;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn limits(&self) -> &CoordinatorLimits {
        &self.limits
    }

    /// One dispatch leg, raced against cancellation. A collaborator error
    /// that is itself a cancellation is normalized to the same code.
    async fn dispatch_leg(&self, input: DispatchInput) -> DispatchOutcome {
        let agent_id = input.agent_id.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => DispatchOutcome::failure(agent_id, "cancelled"),
            outcome = self.dispatcher.dispatch(input) => {
                if !outcome.ok
                    && outcome
                        .error
                        .as_deref()
                        .map(|e| e.contains("cancel"))
                        .unwrap_or(false)
                {
                    DispatchOutcome::failure(outcome.agent_id, "cancelled")
                } else {
                    outcome
                }
            }
        }
    }

    async fn active_targets(&self, agent_ids: &[String]) -> Vec<String> {
        let mut targets = Vec::new();
        for agent_id in agent_ids {
            if self.dispatcher.is_agent_active(agent_id).await {
                targets.push(agent_id.clone());
            }
        }
        targets
    }

    /// Dispatch the same task to every listed agent in parallel. Results
    /// come back in the input order.
    pub async fn fan_out(&self, agent_ids: &[String], task: &str) -> FanOutResult {
        if agent_ids.len() > self.limits.fanout_max_agents {
            return FanOutResult {
                ok: false,
                error: Some(format!(
                    "fanout_limit_exceeded:{}",
                    self.limits.fanout_max_agents
                )),
                results: Vec::new(),
            };
        }

        let targets = self.active_targets(agent_ids).await;
        if targets.is_empty() {
            return FanOutResult {
                ok: false,
                error: Some("no_active_targets".to_string()),
                results: Vec::new(),
            };
        }

        let legs = targets.iter().map(|agent_id| {
            self.dispatch_leg(DispatchInput {
                agent_id: agent_id.clone(),
                task: task.to_string(),
                ..Default::default()
            })
        });
        let outcomes = join_all(legs).await;

        let ok = outcomes.iter().all(|o| o.ok);
        FanOutResult {
            ok,
            error: None,
            results: outcomes.into_iter().map(AgentReply::from).collect(),
        }
    }

    /// Round-robin discussion. Agents speak strictly in list order, each
    /// seeing the transcript so far. A trimmed `[DONE]` reply ends the
    /// discussion at once: it is recorded, and nothing after it dispatches.
    pub async fn discuss(
        &self,
        agent_ids: &[String],
        topic: &str,
        max_rounds: Option<u32>,
    ) -> DiscussResult {
        let targets = self.active_targets(agent_ids).await;
        if targets.is_empty() {
            return DiscussResult {
                ok: false,
                rounds: Vec::new(),
                stopped_early: false,
                error: Some("no_active_targets".to_string()),
            };
        }

        let limit = self.limits.max_discussion_rounds;
        let rounds_to_run = max_rounds.unwrap_or(limit).min(limit);

        let mut rounds: Vec<Vec<AgentReply>> = Vec::new();
        let mut transcript: Vec<(String, String)> = Vec::new();
        let mut stopped_early = false;
        let mut ok = true;

        'rounds: for _ in 0..rounds_to_run {
            let mut round: Vec<AgentReply> = Vec::new();
            for agent_id in &targets {
                let outcome = self
                    .dispatch_leg(DispatchInput {
                        agent_id: agent_id.clone(),
                        task: discussion_prompt(topic, &transcript),
                        ..Default::default()
                    })
                    .await;
                ok = ok && outcome.ok;
                let cancelled = outcome.error.as_deref() == Some("cancelled");
                let done = outcome
                    .response_text
                    .as_deref()
                    .map(|t| t.trim() == DISCUSSION_DONE_TOKEN)
                    .unwrap_or(false);
                if let Some(text) = &outcome.response_text {
                    transcript.push((agent_id.clone(), text.clone()));
                }
                round.push(outcome.into());
                if done {
                    stopped_early = true;
                    rounds.push(round);
                    break 'rounds;
                }
                if cancelled {
                    rounds.push(round);
                    break 'rounds;
                }
            }
            rounds.push(round);
        }

        DiscussResult {
            ok,
            rounds,
            stopped_early,
            error: None,
        }
    }

    /// One agent-to-agent message leg. Depth and hop counters are
    /// independent; both increment per leg and either cap blocks the send.
    pub async fn a2a_send(&self, send: A2aSend) -> DispatchOutcome {
        let to = send.to_agent_id.clone();

        if self.forbid_self_a2a {
            if let Some(from_agent) = self
                .dispatcher
                .resolve_agent_by_session_id(&send.from_session_id)
                .await
            {
                if from_agent == send.to_agent_id {
                    return DispatchOutcome::failure(to, "a2a_self_target_blocked");
                }
            }
        }

        let depth = send.depth.unwrap_or(0);
        if depth >= self.limits.a2a_max_depth {
            return DispatchOutcome::failure(to, "a2a_depth_limit_exceeded");
        }
        let hops = send.hops.unwrap_or(0);
        if hops >= self.limits.a2a_max_hops {
            return DispatchOutcome::failure(to, "a2a_hop_limit_exceeded");
        }

        if !self.dispatcher.is_agent_active(&send.to_agent_id).await {
            return DispatchOutcome::failure(to.clone(), format!("a2a_target_inactive:{to}"));
        }

        self.dispatch_leg(DispatchInput {
            agent_id: send.to_agent_id,
            task: send.message,
            parent_session_id: Some(send.from_session_id),
            depth: Some(depth + 1),
            hops: Some(hops + 1),
        })
        .await
    }

    /// Fan-out over `a2a_send`, so depth and hop caps apply per leg. The
    /// fan-out limit is checked before any leg dispatches.
    pub async fn a2a_broadcast(&self, broadcast: A2aBroadcast) -> FanOutResult {
        if broadcast.to_agent_ids.len() > self.limits.fanout_max_agents {
            return FanOutResult {
                ok: false,
                error: Some(format!(
                    "fanout_limit_exceeded:{}",
                    self.limits.fanout_max_agents
                )),
                results: Vec::new(),
            };
        }

        let targets = self.active_targets(&broadcast.to_agent_ids).await;
        if targets.is_empty() {
            return FanOutResult {
                ok: false,
                error: Some("no_active_targets".to_string()),
                results: Vec::new(),
            };
        }

        let legs = targets.iter().map(|agent_id| {
            self.a2a_send(A2aSend {
                from_session_id: broadcast.from_session_id.clone(),
                to_agent_id: agent_id.clone(),
                message: broadcast.message.clone(),
                depth: broadcast.depth,
                hops: broadcast.hops,
            })
        });
        let outcomes = join_all(legs).await;

        let ok = outcomes.iter().all(|o| o.ok);
        FanOutResult {
            ok,
            error: None,
            results: outcomes.into_iter().map(AgentReply::from).collect(),
        }
    }
}

fn discussion_prompt(topic: &str, transcript: &[(String, String)]) -> String {
    if transcript.is_empty() {
        return topic.to_string();
    }
    let mut prompt = format!("{topic}\n\nDiscussion so far:\n");
    for (agent_id, text) in transcript {
        prompt.push_str(&format!("@{agent_id}: {text}\n"));
    }
    prompt
}
