//! Workspace-scoped agent identity registry.
//!
//! Agents live in a single JSON index at `.brewva/agents.json`, with one
//! directory per agent under `.brewva/agents/<id>/` for local state. The
//! reserved `default` agent always exists. Deletes are soft: history stays,
//! the agent just stops resolving. A focus overlay maps conversation keys to
//! the agent currently addressed in that conversation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const REGISTRY_SCHEMA: &str = "brewva.registry.v1";
pub const DEFAULT_AGENT_ID: &str = "default";

const RESERVED_AGENT_IDS: &[&str] = &["default", "system", "controller", "brewva"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentRecord {
    pub fn is_active(&self) -> bool {
        self.soft_deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryIndex {
    schema: String,
    agents: Vec<AgentRecord>,
    #[serde(default)]
    focus: BTreeMap<String, String>,
}

impl RegistryIndex {
    fn seed() -> Self {
        Self {
            schema: REGISTRY_SCHEMA.to_string(),
            agents: vec![AgentRecord {
                agent_id: DEFAULT_AGENT_ID.to_string(),
                display_name: None,
                created_at: Utc::now(),
                soft_deleted_at: None,
                model: None,
            }],
            focus: BTreeMap::new(),
        }
    }

    fn find(&self, agent_id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    fn find_mut(&mut self, agent_id: &str) -> Option<&mut AgentRecord> {
        self.agents.iter_mut().find(|a| a.agent_id == agent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAgent {
    pub agent_id: String,
    /// True when the name previously existed soft-deleted and was revived
    /// instead of created fresh.
    pub revived: bool,
}

pub struct AgentRegistry {
    workspace_root: PathBuf,
    index_path: PathBuf,
    state: Mutex<RegistryIndex>,
}

/// Case-fold a requested agent ID the way every entry point does.
pub fn fold_agent_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn is_valid_agent_id(folded: &str) -> bool {
    !folded.is_empty()
        && folded
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

impl AgentRegistry {
    /// Load the registry for a workspace, seeding the index (with the
    /// reserved `default` agent) on first use.
    pub async fn open(workspace_root: impl AsRef<Path>) -> Result<Self> {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        let index_path = workspace_root.join(".brewva").join("agents.json");

        let index = match tokio::fs::read_to_string(&index_path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryIndex::seed(),
            Err(e) => return Err(e.into()),
        };

        let registry = Self {
            workspace_root,
            index_path,
            state: Mutex::new(index),
        };
        {
            let state = registry.state.lock().await;
            registry.persist(&state).await?;
        }
        Ok(registry)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Directory holding an agent's local state and config overlay.
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.workspace_root.join(".brewva").join("agents").join(agent_id)
    }

    async fn persist(&self, index: &RegistryIndex) -> Result<()> {
        if let Some(parent) = self.index_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(index)?;
        let tmp = self.index_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.index_path).await?;
        Ok(())
    }

    /// Create a new agent or revive a soft-deleted one of the same name.
    /// All mutations run under the registry mutex, so concurrent creates
    /// serialize and never lose updates.
    pub async fn create_agent(
        &self,
        requested_agent_id: &str,
        model: Option<&str>,
    ) -> Result<CreatedAgent> {
        let agent_id = fold_agent_id(requested_agent_id);
        if !is_valid_agent_id(&agent_id) {
            bail!("invalid_agent_id:{agent_id}");
        }
        if RESERVED_AGENT_IDS.contains(&agent_id.as_str()) {
            bail!("reserved_agent_id:{agent_id}");
        }

        let mut state = self.state.lock().await;
        let revived = match state.find_mut(&agent_id) {
            Some(existing) if existing.is_active() => {
                bail!("duplicate_agent_id:{agent_id}");
            }
            Some(existing) => {
                existing.soft_deleted_at = None;
                if let Some(model) = model {
                    existing.model = Some(model.to_string());
                }
                true
            }
            None => {
                state.agents.push(AgentRecord {
                    agent_id: agent_id.clone(),
                    display_name: None,
                    created_at: Utc::now(),
                    soft_deleted_at: None,
                    model: model.map(ToOwned::to_owned),
                });
                false
            }
        };

        tokio::fs::create_dir_all(self.agent_dir(&agent_id)).await?;
        self.persist(&state).await?;
        Ok(CreatedAgent { agent_id, revived })
    }

    /// Mark an agent deleted without removing its history. Focus entries
    /// pointing at it degrade to `default` on the next read.
    pub async fn soft_delete_agent(&self, agent_id: &str) -> Result<()> {
        let agent_id = fold_agent_id(agent_id);
        if agent_id == DEFAULT_AGENT_ID {
            bail!("cannot_delete_default");
        }

        let mut state = self.state.lock().await;
        let Some(record) = state.find_mut(&agent_id) else {
            bail!("unknown_agent_id:{agent_id}");
        };
        if record.soft_deleted_at.is_none() {
            record.soft_deleted_at = Some(Utc::now());
        }
        self.persist(&state).await
    }

    pub async fn is_active(&self, agent_id: &str) -> bool {
        let agent_id = fold_agent_id(agent_id);
        let state = self.state.lock().await;
        state.find(&agent_id).map(AgentRecord::is_active).unwrap_or(false)
    }

    /// Active agents in insertion order, `default` first.
    pub async fn list(&self) -> Vec<AgentRecord> {
        let state = self.state.lock().await;
        state
            .agents
            .iter()
            .filter(|a| a.is_active())
            .cloned()
            .collect()
    }

    pub async fn list_active_ids(&self) -> Vec<String> {
        self.list().await.into_iter().map(|a| a.agent_id).collect()
    }

    /// Point a conversation at an agent. The target must exist and be
    /// active; reads still degrade to `default` if it is deleted later.
    pub async fn set_focus(&self, conversation_key: &str, agent_id: &str) -> Result<()> {
        let agent_id = fold_agent_id(agent_id);
        let mut state = self.state.lock().await;
        match state.find(&agent_id) {
            Some(record) if record.is_active() => {}
            _ => bail!("unknown_agent_id:{agent_id}"),
        }
        state
            .focus
            .insert(conversation_key.to_string(), agent_id);
        self.persist(&state).await
    }

    /// The agent currently focused for a conversation, or `default` when no
    /// focus is set or the focused agent is no longer active.
    pub async fn resolve_focus(&self, conversation_key: &str) -> String {
        let state = self.state.lock().await;
        state
            .focus
            .get(conversation_key)
            .filter(|id| state.find(id).map(AgentRecord::is_active).unwrap_or(false))
            .cloned()
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string())
    }
}
