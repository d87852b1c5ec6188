use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Runtime configuration in its `config.json` wire form. Unknown sections
/// ride along in `extra` so agent overlays can carry settings the core does
/// not interpret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub ledger: LedgerConfig,
    pub memory: MemoryConfig,
    pub infrastructure: InfrastructureConfig,
    pub schedule: ScheduleConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerConfig {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryConfig {
    pub dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InfrastructureConfig {
    pub events: DirSetting,
    pub turn_wal: DirSetting,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DirSetting {
    pub dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub projection_path: String,
    pub enabled: bool,
}

/// Overlay an agent's `config.json` value over the controller base config.
/// Objects merge key-by-key, anything else in the overlay replaces the base.
pub fn merge_overlay(base: &RuntimeConfig, overlay: serde_json::Value) -> Result<RuntimeConfig> {
    let mut merged = serde_json::to_value(base)?;
    deep_merge(&mut merged, overlay);
    Ok(serde_json::from_value(merged)?)
}

fn deep_merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Force the paths every agent runtime must use, regardless of what the
/// base config or the overlay said. Keeps any two agents' state disjoint.
pub fn apply_agent_namespace(config: &mut RuntimeConfig, agent_id: &str) {
    let state = format!(".brewva/agents/{agent_id}/state");
    config.ledger.path = format!("{state}/ledger/evidence.jsonl");
    config.memory.dir = format!("{state}/memory");
    config.infrastructure.events.dir = format!("{state}/events");
    config.infrastructure.turn_wal.dir = format!("{state}/turn-wal");
    config.schedule.projection_path = format!("{state}/schedule/intents.jsonl");
    config.schedule.enabled = false;
}
