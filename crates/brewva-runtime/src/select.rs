//! Pure eviction-candidate selection over pool usage snapshots.

use std::collections::BTreeMap;

/// One slot's usage as seen at selection time. An agent may contribute
/// several records (historical touches); selection groups them and keeps
/// the most recent use per agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotUsage {
    pub agent_id: String,
    pub last_used_at_ms: i64,
    pub in_flight_tasks: u32,
}

struct AgentUse {
    max_last_used_at_ms: i64,
    busy: bool,
}

fn group_by_agent(usages: &[SlotUsage]) -> BTreeMap<&str, AgentUse> {
    let mut groups: BTreeMap<&str, AgentUse> = BTreeMap::new();
    for usage in usages {
        let entry = groups.entry(usage.agent_id.as_str()).or_insert(AgentUse {
            max_last_used_at_ms: i64::MIN,
            busy: false,
        });
        entry.max_last_used_at_ms = entry.max_last_used_at_ms.max(usage.last_used_at_ms);
        entry.busy = entry.busy || usage.in_flight_tasks > 0;
    }
    groups
}

/// The least-recently-used agent whose slots are all idle, ties broken by
/// agent ID ascending. `None` when every agent has work in flight.
pub fn select_lru_evictable_agent(usages: &[SlotUsage]) -> Option<String> {
    group_by_agent(usages)
        .into_iter()
        .filter(|(_, group)| !group.busy)
        .min_by_key(|(agent_id, group)| (group.max_last_used_at_ms, agent_id.to_string()))
        .map(|(agent_id, _)| agent_id.to_string())
}

/// All idle agents whose most recent use is at least `ttl_ms` old, ordered
/// by last use ascending then agent ID.
pub fn select_idle_evictable_agents_by_ttl(
    usages: &[SlotUsage],
    now_ms: i64,
    ttl_ms: u64,
) -> Vec<String> {
    let cutoff = now_ms.saturating_sub(ttl_ms as i64);
    let mut expired: Vec<(i64, String)> = group_by_agent(usages)
        .into_iter()
        .filter(|(_, group)| !group.busy && group.max_last_used_at_ms <= cutoff)
        .map(|(agent_id, group)| (group.max_last_used_at_ms, agent_id.to_string()))
        .collect();
    expired.sort();
    expired.into_iter().map(|(_, agent_id)| agent_id).collect()
}
