//! Channel-facing entry point: ACL, command routing, intent execution.

use std::sync::Arc;

use anyhow::Result;
use brewva_registry::AgentRegistry;
use brewva_schema::TurnEnvelope;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::acl::{is_owner_authorized, AclMode};
use crate::coordinator::{
    AgentDispatcher, ChannelCoordinator, DiscussResult, DispatchInput, DispatchOutcome,
    FanOutResult,
};
use crate::orchestrator::Orchestrator;
use crate::router::{parse_intent, Intent};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatewayConfig {
    pub owners: Vec<String>,
    pub acl_mode: AclMode,
}

/// Takes normalized turn envelopes from a transport and turns them into
/// replies. Unauthorized and empty turns produce no reply at all.
pub struct Gateway {
    registry: Arc<AgentRegistry>,
    orchestrator: Arc<Orchestrator>,
    coordinator: ChannelCoordinator,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        registry: Arc<AgentRegistry>,
        orchestrator: Arc<Orchestrator>,
        coordinator: ChannelCoordinator,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            coordinator,
            config,
        }
    }

    pub async fn handle_turn(&self, turn: &TurnEnvelope) -> Result<Option<String>> {
        if !is_owner_authorized(turn, &self.config.owners, self.config.acl_mode) {
            warn!(
                channel = %turn.channel,
                conversation = %turn.conversation_id,
                "dropping unauthorized turn"
            );
            return Ok(None);
        }

        let text = turn.text();
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let Some(intent) = parse_intent(text) else {
            // Plain conversation goes to whichever agent holds focus here.
            let agent_id = self.registry.resolve_focus(&turn.conversation_key()).await;
            let outcome = self
                .orchestrator
                .dispatch(DispatchInput {
                    agent_id,
                    task: text.to_string(),
                    ..Default::default()
                })
                .await;
            return Ok(Some(render_outcome(&outcome)));
        };

        let reply = match intent {
            Intent::NewAgent { agent_id, model } => {
                match self.registry.create_agent(&agent_id, model.as_deref()).await {
                    Ok(created) if created.revived => format!("Revived agent @{}", created.agent_id),
                    Ok(created) => format!("Created agent @{}", created.agent_id),
                    Err(e) => e.to_string(),
                }
            }
            Intent::Run { agent_ids, task } => {
                render_fan_out(&self.coordinator.fan_out(&agent_ids, &task).await)
            }
            Intent::Discuss {
                agent_ids,
                topic,
                max_rounds,
            } => render_discussion(
                &self
                    .coordinator
                    .discuss(&agent_ids, &topic, max_rounds)
                    .await,
            ),
            Intent::RouteAgent { agent_id, task, .. } => {
                let outcome = self
                    .orchestrator
                    .dispatch(DispatchInput {
                        agent_id,
                        task,
                        ..Default::default()
                    })
                    .await;
                render_outcome(&outcome)
            }
            Intent::Focus { agent_id } => {
                match self
                    .registry
                    .set_focus(&turn.conversation_key(), &agent_id)
                    .await
                {
                    Ok(()) => format!("Focused @{agent_id}"),
                    Err(e) => e.to_string(),
                }
            }
            Intent::DeleteAgent { agent_id } => {
                match self.registry.soft_delete_agent(&agent_id).await {
                    Ok(()) => format!("Deleted agent @{agent_id}"),
                    Err(e) => e.to_string(),
                }
            }
            Intent::List => self
                .registry
                .list_active_ids()
                .await
                .iter()
                .map(|id| format!("@{id}"))
                .collect::<Vec<_>>()
                .join("\n"),
            Intent::Error { message } => message,
        };

        Ok(Some(reply))
    }
}

fn render_outcome(outcome: &DispatchOutcome) -> String {
    if outcome.ok {
        outcome.response_text.clone().unwrap_or_default()
    } else {
        outcome
            .error
            .clone()
            .unwrap_or_else(|| "dispatch_failed".to_string())
    }
}

fn render_fan_out(result: &FanOutResult) -> String {
    if let Some(error) = &result.error {
        return error.clone();
    }
    result
        .results
        .iter()
        .map(|reply| match (&reply.response_text, &reply.error) {
            (Some(text), _) => format!("@{}: {}", reply.agent_id, text),
            (None, Some(error)) => format!("@{}: {}", reply.agent_id, error),
            (None, None) => format!("@{}:", reply.agent_id),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_discussion(result: &DiscussResult) -> String {
    if let Some(error) = &result.error {
        return error.clone();
    }
    let mut lines = Vec::new();
    for (i, round) in result.rounds.iter().enumerate() {
        lines.push(format!("Round {}:", i + 1));
        for reply in round {
            match (&reply.response_text, &reply.error) {
                (Some(text), _) => lines.push(format!("@{}: {}", reply.agent_id, text)),
                (None, Some(error)) => lines.push(format!("@{}: {}", reply.agent_id, error)),
                (None, None) => {}
            }
        }
    }
    if result.stopped_early {
        lines.push("(discussion ended early)".to_string());
    }
    lines.join("\n")
}
