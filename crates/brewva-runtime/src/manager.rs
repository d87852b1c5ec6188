use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{apply_agent_namespace, merge_overlay, RuntimeConfig};
use crate::select::{select_idle_evictable_agents_by_ttl, select_lru_evictable_agent, SlotUsage};
use crate::{AgentRuntime, RuntimeFactory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimePoolConfig {
    pub max_live_runtimes: usize,
    pub idle_runtime_ttl_ms: u64,
}

impl Default for RuntimePoolConfig {
    fn default() -> Self {
        Self {
            max_live_runtimes: 4,
            idle_runtime_ttl_ms: 15 * 60 * 1000,
        }
    }
}

struct Slot {
    runtime: Arc<dyn AgentRuntime>,
    created_at_ms: i64,
    last_used_at_ms: i64,
    in_flight: Arc<AtomicU32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub agent_id: String,
    pub created_at_ms: i64,
    pub last_used_at_ms: i64,
    pub in_flight_tasks: u32,
}

/// RAII marker for a task running against an agent's runtime. While any
/// guard is alive the slot cannot be evicted.
pub struct TaskGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded pool of live agent runtimes with LRU and idle-TTL eviction.
/// Construction per agent is single-flight; concurrent callers for the same
/// agent await one build.
pub struct RuntimeManager {
    workspace_root: PathBuf,
    base_config: RuntimeConfig,
    pool: RuntimePoolConfig,
    factory: Arc<dyn RuntimeFactory>,
    slots: Mutex<HashMap<String, Slot>>,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RuntimeManager {
    pub fn new(
        workspace_root: impl AsRef<Path>,
        base_config: RuntimeConfig,
        pool: RuntimePoolConfig,
        factory: Arc<dyn RuntimeFactory>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            base_config,
            pool,
            factory,
            slots: Mutex::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    fn usages_of(slots: &HashMap<String, Slot>) -> Vec<SlotUsage> {
        slots
            .iter()
            .map(|(agent_id, slot)| SlotUsage {
                agent_id: agent_id.clone(),
                last_used_at_ms: slot.last_used_at_ms,
                in_flight_tasks: slot.in_flight.load(Ordering::SeqCst),
            })
            .collect()
    }

    fn evict_one_if_full(slots: &mut HashMap<String, Slot>, max: usize) -> Result<()> {
        while slots.len() >= max {
            let usages = Self::usages_of(slots);
            let Some(victim) = select_lru_evictable_agent(&usages) else {
                bail!("runtime_pool_exhausted");
            };
            debug!(agent_id = %victim, "evicting least-recently-used idle runtime");
            slots.remove(&victim);
        }
        Ok(())
    }

    /// The runtime for an agent, building it on first use. Refreshes the
    /// slot's last-used stamp on every call.
    pub async fn get_or_create_runtime(&self, agent_id: &str) -> Result<Arc<dyn AgentRuntime>> {
        {
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.get_mut(agent_id) {
                slot.last_used_at_ms = now_ms();
                return Ok(slot.runtime.clone());
            }
        }

        let build_lock = {
            let mut locks = self.build_locks.lock().await;
            locks
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _build_guard = build_lock.lock().await;

        // A concurrent caller may have finished the build while we waited.
        {
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.get_mut(agent_id) {
                slot.last_used_at_ms = now_ms();
                return Ok(slot.runtime.clone());
            }
            Self::evict_one_if_full(&mut slots, self.pool.max_live_runtimes)?;
        }

        let config = self.agent_config(agent_id).await?;
        let runtime = self.factory.build(agent_id, config).await?;

        let mut slots = self.slots.lock().await;
        Self::evict_one_if_full(&mut slots, self.pool.max_live_runtimes)?;
        let now = now_ms();
        slots.insert(
            agent_id.to_string(),
            Slot {
                runtime: runtime.clone(),
                created_at_ms: now,
                last_used_at_ms: now,
                in_flight: Arc::new(AtomicU32::new(0)),
            },
        );
        Ok(runtime)
    }

    async fn agent_config(&self, agent_id: &str) -> Result<RuntimeConfig> {
        let overlay_path = self
            .workspace_root
            .join(".brewva")
            .join("agents")
            .join(agent_id)
            .join("config.json");

        let mut config = match tokio::fs::read_to_string(&overlay_path).await {
            Ok(raw) => {
                let overlay: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| anyhow!("invalid_agent_config:{agent_id}:{e}"))?;
                merge_overlay(&self.base_config, overlay)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.base_config.clone(),
            Err(e) => return Err(e.into()),
        };
        apply_agent_namespace(&mut config, agent_id);
        Ok(config)
    }

    /// Drop every idle slot whose last use is at least the idle TTL before
    /// `now_ms`. Returns the evicted agent IDs, oldest first.
    pub async fn evict_idle_runtimes(&self, now_ms: i64) -> Vec<String> {
        let mut slots = self.slots.lock().await;
        let usages = Self::usages_of(&slots);
        let victims =
            select_idle_evictable_agents_by_ttl(&usages, now_ms, self.pool.idle_runtime_ttl_ms);
        for victim in &victims {
            debug!(agent_id = %victim, "evicting idle runtime past ttl");
            slots.remove(victim);
        }
        victims
    }

    /// Mark a task in flight against an agent's live runtime. Returns
    /// `None` when the agent has no live slot.
    pub async fn begin_task(&self, agent_id: &str) -> Option<TaskGuard> {
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(agent_id)?;
        slot.last_used_at_ms = now_ms();
        slot.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(TaskGuard {
            counter: slot.in_flight.clone(),
        })
    }

    pub async fn list_runtimes(&self) -> Vec<RuntimeStatus> {
        let slots = self.slots.lock().await;
        let mut statuses: Vec<RuntimeStatus> = slots
            .iter()
            .map(|(agent_id, slot)| RuntimeStatus {
                agent_id: agent_id.clone(),
                created_at_ms: slot.created_at_ms,
                last_used_at_ms: slot.last_used_at_ms,
                in_flight_tasks: slot.in_flight.load(Ordering::SeqCst),
            })
            .collect();
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;

    use super::*;
    use crate::{StubRuntime, StubRuntimeFactory};

    struct CountingFactory {
        builds: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RuntimeFactory for CountingFactory {
        async fn build(
            &self,
            _agent_id: &str,
            config: RuntimeConfig,
        ) -> Result<Arc<dyn AgentRuntime>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok(Arc::new(StubRuntime::new(config)))
        }
    }

    fn manager_with(tmp: &TempDir, pool: RuntimePoolConfig) -> RuntimeManager {
        RuntimeManager::new(
            tmp.path(),
            RuntimeConfig::default(),
            pool,
            Arc::new(StubRuntimeFactory),
        )
    }

    #[tokio::test]
    async fn lru_eviction_keeps_newest_agent() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            RuntimePoolConfig {
                max_live_runtimes: 1,
                ..Default::default()
            },
        );

        manager.get_or_create_runtime("jack").await.unwrap();
        manager.get_or_create_runtime("mike").await.unwrap();

        let live: Vec<String> = manager
            .list_runtimes()
            .await
            .into_iter()
            .map(|s| s.agent_id)
            .collect();
        assert_eq!(live, vec!["mike"]);
    }

    #[tokio::test]
    async fn idle_ttl_evicts_and_reports_agent() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            RuntimePoolConfig {
                max_live_runtimes: 4,
                idle_runtime_ttl_ms: 10,
            },
        );

        manager.get_or_create_runtime("jack").await.unwrap();
        let evicted = manager.evict_idle_runtimes(now_ms() + 100).await;
        assert_eq!(evicted, vec!["jack"]);
        assert!(manager.list_runtimes().await.is_empty());
    }

    #[tokio::test]
    async fn busy_slot_is_never_evicted() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            RuntimePoolConfig {
                max_live_runtimes: 1,
                idle_runtime_ttl_ms: 10,
            },
        );

        manager.get_or_create_runtime("jack").await.unwrap();
        let guard = manager.begin_task("jack").await.unwrap();

        let err = manager.get_or_create_runtime("mike").await.unwrap_err();
        assert_eq!(err.to_string(), "runtime_pool_exhausted");
        assert!(manager.evict_idle_runtimes(now_ms() + 100).await.is_empty());

        drop(guard);
        manager.get_or_create_runtime("mike").await.unwrap();
        let live: Vec<String> = manager
            .list_runtimes()
            .await
            .into_iter()
            .map(|s| s.agent_id)
            .collect();
        assert_eq!(live, vec!["mike"]);
    }

    #[tokio::test]
    async fn pool_size_never_exceeds_limit() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            RuntimePoolConfig {
                max_live_runtimes: 2,
                ..Default::default()
            },
        );

        for agent in ["jack", "mike", "rose", "anna"] {
            manager.get_or_create_runtime(agent).await.unwrap();
            assert!(manager.list_runtimes().await.len() <= 2);
        }
    }

    #[tokio::test]
    async fn invalid_overlay_config_is_reported() {
        let tmp = TempDir::new().unwrap();
        let agent_dir = tmp.path().join(".brewva/agents/jack");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(agent_dir.join("config.json"), "{ not json").unwrap();

        let manager = manager_with(&tmp, RuntimePoolConfig::default());
        let err = manager.get_or_create_runtime("jack").await.unwrap_err();
        assert!(err.to_string().starts_with("invalid_agent_config:jack:"), "{err}");
    }

    #[tokio::test]
    async fn overlay_is_merged_but_paths_stay_forced() {
        let tmp = TempDir::new().unwrap();
        let agent_dir = tmp.path().join(".brewva/agents/jack");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            agent_dir.join("config.json"),
            serde_json::json!({
                "model": "openai/gpt-5.3-codex",
                "ledger": { "path": "somewhere/else.jsonl" },
                "schedule": { "enabled": true }
            })
            .to_string(),
        )
        .unwrap();

        let manager = manager_with(&tmp, RuntimePoolConfig::default());
        let runtime = manager.get_or_create_runtime("jack").await.unwrap();
        let config = runtime.config();
        assert_eq!(config.extra["model"], "openai/gpt-5.3-codex");
        assert_eq!(config.ledger.path, ".brewva/agents/jack/state/ledger/evidence.jsonl");
        assert!(!config.schedule.enabled);
    }

    #[tokio::test]
    async fn concurrent_creates_for_one_agent_build_once() {
        let tmp = TempDir::new().unwrap();
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let manager = Arc::new(RuntimeManager::new(
            tmp.path(),
            RuntimeConfig::default(),
            RuntimePoolConfig::default(),
            factory.clone(),
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_or_create_runtime("jack").await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert_eq!(manager.list_runtimes().await.len(), 1);
    }

    #[tokio::test]
    async fn get_refreshes_last_used_for_lru() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            RuntimePoolConfig {
                max_live_runtimes: 2,
                ..Default::default()
            },
        );

        manager.get_or_create_runtime("jack").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.get_or_create_runtime("mike").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Touch jack so mike becomes the LRU candidate.
        manager.get_or_create_runtime("jack").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        manager.get_or_create_runtime("rose").await.unwrap();
        let live: Vec<String> = manager
            .list_runtimes()
            .await
            .into_iter()
            .map(|s| s.agent_id)
            .collect();
        assert_eq!(live, vec!["jack", "rose"]);
    }
}
