//! Append-only per-session event logs.
//!
//! One JSONL file per session under the events directory. Appends within a
//! process are serialized per session and stamped with IDs that stay unique
//! across rapid bursts. Reads go through an incremental cache that only
//! parses bytes appended since the last call; files mutated externally
//! (truncated or rewritten) are re-scanned from scratch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

/// Event type names recorded by the core. Payloads are free-form JSON.
pub mod event_types {
    pub const AGENT_START: &str = "agent_start";
    pub const TURN_START: &str = "turn_start";
    pub const TURN_END: &str = "turn_end";
    pub const MESSAGE_END: &str = "message_end";
    pub const MESSAGE_UPDATE: &str = "message_update";
    pub const TOOL_EXECUTION_START: &str = "tool_execution_start";
    pub const TOOL_EXECUTION_UPDATE: &str = "tool_execution_update";
    pub const TOOL_EXECUTION_END: &str = "tool_execution_end";
    pub const AGENT_END: &str = "agent_end";
    pub const CONTEXT_INJECTED: &str = "context_injected";
    pub const CONTEXT_INJECTION_DROPPED: &str = "context_injection_dropped";
    pub const ANCHOR: &str = "anchor";
    pub const CHECKPOINT: &str = "checkpoint";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug)]
struct SessionCache {
    byte_len: u64,
    modified: SystemTime,
    rows: Vec<EventRow>,
    skipped_lines: usize,
}

pub struct EventStore {
    events_dir: PathBuf,
    counter: AtomicU64,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cache: Mutex<HashMap<String, SessionCache>>,
}

impl EventStore {
    pub fn new(events_dir: impl AsRef<Path>) -> Self {
        Self {
            events_dir: events_dir.as_ref().to_path_buf(),
            counter: AtomicU64::new(0),
            append_locks: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.events_dir.join(format!("{session_id}.jsonl"))
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn next_id(&self, timestamp_ms: i64) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("evt_{timestamp_ms}_{n}")
    }

    /// Append one event row, stamping id and timestamp from the wall clock.
    pub async fn append(
        &self,
        session_id: &str,
        event_type: &str,
        turn: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<EventRow> {
        self.append_at(session_id, event_type, turn, payload, Utc::now().timestamp_millis())
            .await
    }

    /// Append with an explicit millisecond timestamp. The ID counter is
    /// process-wide and always advances, so rows appended within the same
    /// millisecond still get distinct IDs.
    pub async fn append_at(
        &self,
        session_id: &str,
        event_type: &str,
        turn: Option<&str>,
        payload: serde_json::Value,
        timestamp_ms: i64,
    ) -> Result<EventRow> {
        let row = EventRow {
            id: self.next_id(timestamp_ms),
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc
                .timestamp_millis_opt(timestamp_ms)
                .single()
                .unwrap_or_else(Utc::now),
            turn: turn.map(ToOwned::to_owned),
            payload,
        };
        self.write_row(&row, event_type == event_types::CHECKPOINT)
            .await?;
        Ok(row)
    }

    async fn write_row(&self, row: &EventRow, flush: bool) -> Result<()> {
        let lock = self.lock_for(&row.session_id).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.events_dir).await?;
        let path = self.session_path(&row.session_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        if flush {
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Anchors mark durable positions in a session the caller wants to find
    /// again; checkpoints additionally force the log to disk.
    pub async fn append_anchor(&self, session_id: &str, payload: serde_json::Value) -> Result<EventRow> {
        self.append(session_id, event_types::ANCHOR, None, payload).await
    }

    pub async fn append_checkpoint(&self, session_id: &str, payload: serde_json::Value) -> Result<EventRow> {
        self.append(session_id, event_types::CHECKPOINT, None, payload).await
    }

    pub async fn list_anchors(&self, session_id: &str) -> Result<Vec<EventRow>> {
        Ok(self
            .list(session_id)
            .await?
            .into_iter()
            .filter(|r| r.event_type == event_types::ANCHOR)
            .collect())
    }

    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<EventRow>> {
        Ok(self
            .list(session_id)
            .await?
            .into_iter()
            .filter(|r| r.event_type == event_types::CHECKPOINT)
            .collect())
    }

    /// All rows of a session, in file order. The in-memory cache is
    /// synchronized with the file on every call: growth is parsed
    /// incrementally from the cached byte offset; a shorter file or an
    /// mtime older than the cache baseline triggers a full re-scan.
    pub async fn list(&self, session_id: &str) -> Result<Vec<EventRow>> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let path = self.session_path(session_id);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cache.lock().await.remove(session_id);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let byte_len = meta.len();
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let mut cache = self.cache.lock().await;
        let entry = cache.get_mut(session_id);

        if let Some(entry) = entry {
            if byte_len == entry.byte_len && modified >= entry.modified {
                return Ok(entry.rows.clone());
            }
            if byte_len > entry.byte_len && modified >= entry.modified {
                let (rows, skipped) = read_rows_from(&path, entry.byte_len).await?;
                entry.rows.extend(rows);
                entry.skipped_lines += skipped;
                entry.byte_len = byte_len;
                entry.modified = modified;
                return Ok(entry.rows.clone());
            }
            // File shrank or went back in time: someone rewrote it externally.
        }

        let (rows, skipped) = read_rows_from(&path, 0).await?;
        let fresh = SessionCache {
            byte_len,
            modified,
            rows: rows.clone(),
            skipped_lines: skipped,
        };
        cache.insert(session_id.to_string(), fresh);
        Ok(rows)
    }
}

async fn read_rows_from(path: &Path, offset: u64) -> Result<(Vec<EventRow>, usize)> {
    let mut file = tokio::fs::File::open(path).await?;
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset)).await?;
    }
    let mut buf = String::new();
    file.read_to_string(&mut buf).await?;

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for (index, line) in buf.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRow>(line) {
            Ok(row) => rows.push(row),
            Err(error) => {
                skipped += 1;
                warn!(line = index + 1, %error, "skipping malformed event line");
            }
        }
    }
    Ok((rows, skipped))
}
