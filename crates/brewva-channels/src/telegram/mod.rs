//! Telegram channel: webhook ingress plus outbound Bot API client.
//!
//! The transport itself is channel-shaped, not bot-framework-shaped: raw
//! updates come in over an authenticated HTTP webhook, get normalized into
//! turn envelopes, and replies go out through a thin JSON client against
//! the Bot API.

pub mod api;
pub mod webhook;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use brewva_schema::TurnEnvelope;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tracing::warn;

pub const DEFAULT_INGRESS_HOST: &str = "0.0.0.0";
pub const DEFAULT_INGRESS_PORT: u16 = 8081;
pub const DEFAULT_INGRESS_PATH: &str = "/ingest/telegram";
pub const DEFAULT_HMAC_MAX_SKEW_MS: u64 = 300_000;
pub const DEFAULT_NONCE_TTL_MS: u64 = 600_000;

pub const ENV_INGRESS_HOST: &str = "BREWVA_TELEGRAM_INGRESS_HOST";
pub const ENV_INGRESS_PORT: &str = "BREWVA_TELEGRAM_INGRESS_PORT";
pub const ENV_INGRESS_PATH: &str = "BREWVA_TELEGRAM_INGRESS_PATH";
pub const ENV_INGRESS_BEARER_TOKEN: &str = "BREWVA_TELEGRAM_INGRESS_BEARER_TOKEN";
pub const ENV_INGRESS_HMAC_SECRET: &str = "BREWVA_TELEGRAM_INGRESS_HMAC_SECRET";
pub const ENV_INGRESS_HMAC_MAX_SKEW_MS: &str = "BREWVA_TELEGRAM_INGRESS_HMAC_MAX_SKEW_MS";
pub const ENV_INGRESS_NONCE_TTL_MS: &str = "BREWVA_TELEGRAM_INGRESS_NONCE_TTL_MS";

/// Telegram channel section of the service config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TelegramChannelConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub webhook: TelegramWebhookConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TelegramWebhookConfig {
    pub enabled: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub bearer_token: Option<String>,
    pub hmac_secret: Option<String>,
    pub hmac_max_skew_ms: Option<u64>,
    pub nonce_ttl_ms: Option<u64>,
}

/// Environment overlay for the webhook ingress, captured once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverlay {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub bearer_token: Option<String>,
    pub hmac_secret: Option<String>,
    pub hmac_max_skew_ms: Option<u64>,
    pub nonce_ttl_ms: Option<u64>,
}

impl EnvOverlay {
    pub fn from_process_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse_int<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(var = name, value = %raw, "ignoring unparsable environment override");
                    None
                }
            }
        }

        Self {
            host: lookup(ENV_INGRESS_HOST),
            port: parse_int(ENV_INGRESS_PORT, lookup(ENV_INGRESS_PORT)),
            path: lookup(ENV_INGRESS_PATH),
            bearer_token: lookup(ENV_INGRESS_BEARER_TOKEN),
            hmac_secret: lookup(ENV_INGRESS_HMAC_SECRET),
            hmac_max_skew_ms: parse_int(ENV_INGRESS_HMAC_MAX_SKEW_MS, lookup(ENV_INGRESS_HMAC_MAX_SKEW_MS)),
            nonce_ttl_ms: parse_int(ENV_INGRESS_NONCE_TTL_MS, lookup(ENV_INGRESS_NONCE_TTL_MS)),
        }
    }
}

/// Ingress auth material, one mode active at a time. Bearer wins when both
/// are configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAuth {
    Bearer { token: String },
    Hmac { secret: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWebhookConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub auth: WebhookAuth,
    pub max_skew_ms: u64,
    pub nonce_ttl_ms: u64,
}

/// Resolve the effective webhook config: explicit channel config beats the
/// environment overlay, which beats defaults. Fails when the webhook has no
/// usable auth material at all.
pub fn resolve_webhook_config(
    config: &TelegramWebhookConfig,
    env: &EnvOverlay,
) -> Result<ResolvedWebhookConfig> {
    let host = config
        .host
        .clone()
        .or_else(|| env.host.clone())
        .unwrap_or_else(|| DEFAULT_INGRESS_HOST.to_string());
    let port = config.port.or(env.port).unwrap_or(DEFAULT_INGRESS_PORT);
    let path = normalize_path(
        config
            .path
            .clone()
            .or_else(|| env.path.clone())
            .unwrap_or_else(|| DEFAULT_INGRESS_PATH.to_string()),
    );

    let bearer = config
        .bearer_token
        .clone()
        .or_else(|| env.bearer_token.clone())
        .filter(|t| !t.is_empty());
    let hmac = config
        .hmac_secret
        .clone()
        .or_else(|| env.hmac_secret.clone())
        .filter(|s| !s.is_empty());

    let auth = match (bearer, hmac) {
        (Some(token), _) => WebhookAuth::Bearer { token },
        (None, Some(secret)) => WebhookAuth::Hmac { secret },
        (None, None) => bail!("telegram webhook auth is not configured"),
    };

    Ok(ResolvedWebhookConfig {
        host,
        port,
        path,
        auth,
        max_skew_ms: config
            .hmac_max_skew_ms
            .or(env.hmac_max_skew_ms)
            .unwrap_or(DEFAULT_HMAC_MAX_SKEW_MS),
        nonce_ttl_ms: config
            .nonce_ttl_ms
            .or(env.nonce_ttl_ms)
            .unwrap_or(DEFAULT_NONCE_TTL_MS),
    })
}

fn normalize_path(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn on_update(&self, update: serde_json::Value) -> Result<()>;
}

pub type ErrorHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
}

/// Transport lifecycle around the webhook: `new → started → stopped`.
/// `ingest` hands updates to the running handler; handler failures are
/// reported through the error hook and re-raised to the caller. `stop` is
/// idempotent and waits for in-flight ingests to drain.
pub struct TelegramWebhookTransport {
    handler: RwLock<Option<Arc<dyn UpdateHandler>>>,
    on_error: RwLock<Option<ErrorHook>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl Default for TelegramWebhookTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TelegramWebhookTransport {
    pub fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            on_error: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub async fn set_error_hook(&self, hook: ErrorHook) {
        *self.on_error.write().await = Some(hook);
    }

    pub async fn start(&self, on_update: Arc<dyn UpdateHandler>) {
        *self.handler.write().await = Some(on_update);
    }

    pub async fn is_running(&self) -> bool {
        self.handler.read().await.is_some()
    }

    pub async fn stop(&self) {
        *self.handler.write().await = None;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before re-checking so a drain between the check and
            // the await still wakes us.
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
    }

    pub async fn ingest(&self, update: serde_json::Value) -> Result<IngestOutcome> {
        // The in-flight count is taken under the handler lock, so a stop()
        // that wins the write lock either sees this ingest counted or turns
        // it away entirely.
        let handler = {
            let guard = self.handler.read().await;
            match guard.as_ref() {
                Some(handler) => {
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                    handler.clone()
                }
                None => {
                    return Ok(IngestOutcome {
                        accepted: false,
                        reason: Some("transport_not_running".to_string()),
                    });
                }
            }
        };
        let result = handler.on_update(update).await;
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }

        match result {
            Ok(()) => Ok(IngestOutcome {
                accepted: true,
                reason: None,
            }),
            Err(e) => {
                if let Some(hook) = self.on_error.read().await.as_ref() {
                    hook(&e);
                }
                Err(e)
            }
        }
    }
}

/// Normalize a raw Telegram update into a turn envelope. Updates without a
/// message text or caption are dropped.
pub fn update_to_turn(update: &serde_json::Value) -> Option<TurnEnvelope> {
    let message = update.get("message")?;
    let text = message
        .get("text")
        .and_then(serde_json::Value::as_str)
        .or_else(|| message.get("caption").and_then(serde_json::Value::as_str))?;
    if text.is_empty() {
        return None;
    }
    let chat_id = message.get("chat")?.get("id")?.as_i64()?;

    let mut turn = TurnEnvelope::user("telegram", chat_id.to_string(), text);
    if let Some(from) = message.get("from") {
        turn.meta.sender_id = from.get("id").cloned();
        turn.meta.sender_username = from
            .get("username")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);
    }
    Some(turn)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;

    struct RecordingHandler {
        updates: tokio::sync::Mutex<Vec<serde_json::Value>>,
        fail_with: Option<String>,
        delay_ms: u64,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                updates: tokio::sync::Mutex::new(Vec::new()),
                fail_with: None,
                delay_ms: 0,
            }
        }
    }

    #[async_trait]
    impl UpdateHandler for RecordingHandler {
        async fn on_update(&self, update: serde_json::Value) -> Result<()> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.updates.lock().await.push(update);
            if let Some(message) = &self.fail_with {
                bail!("{message}");
            }
            Ok(())
        }
    }

    fn env_from(pairs: &[(&str, &str)]) -> EnvOverlay {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvOverlay::from_lookup(move |name| map.get(name).cloned())
    }

    #[test]
    fn resolve_uses_defaults_when_nothing_is_set() {
        let config = TelegramWebhookConfig {
            bearer_token: Some("tok".into()),
            ..Default::default()
        };
        let resolved = resolve_webhook_config(&config, &EnvOverlay::default()).unwrap();
        assert_eq!(resolved.host, "0.0.0.0");
        assert_eq!(resolved.path, "/ingest/telegram");
        assert_eq!(resolved.max_skew_ms, DEFAULT_HMAC_MAX_SKEW_MS);
        assert_eq!(resolved.nonce_ttl_ms, DEFAULT_NONCE_TTL_MS);
        assert_eq!(resolved.auth, WebhookAuth::Bearer { token: "tok".into() });
    }

    #[test]
    fn explicit_config_beats_environment() {
        let config = TelegramWebhookConfig {
            host: Some("127.0.0.1".into()),
            port: Some(9000),
            bearer_token: Some("explicit".into()),
            ..Default::default()
        };
        let env = env_from(&[
            (ENV_INGRESS_HOST, "10.0.0.1"),
            (ENV_INGRESS_PORT, "8000"),
            (ENV_INGRESS_BEARER_TOKEN, "from-env"),
        ]);
        let resolved = resolve_webhook_config(&config, &env).unwrap();
        assert_eq!(resolved.host, "127.0.0.1");
        assert_eq!(resolved.port, 9000);
        assert_eq!(resolved.auth, WebhookAuth::Bearer { token: "explicit".into() });
    }

    #[test]
    fn environment_beats_defaults() {
        let env = env_from(&[
            (ENV_INGRESS_HOST, "10.0.0.1"),
            (ENV_INGRESS_PATH, "hooks/tg"),
            (ENV_INGRESS_HMAC_SECRET, "s3cret"),
            (ENV_INGRESS_HMAC_MAX_SKEW_MS, "1000"),
            (ENV_INGRESS_NONCE_TTL_MS, "2000"),
        ]);
        let resolved = resolve_webhook_config(&TelegramWebhookConfig::default(), &env).unwrap();
        assert_eq!(resolved.host, "10.0.0.1");
        assert_eq!(resolved.path, "/hooks/tg");
        assert_eq!(resolved.auth, WebhookAuth::Hmac { secret: "s3cret".into() });
        assert_eq!(resolved.max_skew_ms, 1000);
        assert_eq!(resolved.nonce_ttl_ms, 2000);
    }

    #[test]
    fn unparsable_env_port_is_ignored() {
        let env = env_from(&[
            (ENV_INGRESS_PORT, "not-a-port"),
            (ENV_INGRESS_BEARER_TOKEN, "tok"),
        ]);
        let resolved = resolve_webhook_config(&TelegramWebhookConfig::default(), &env).unwrap();
        assert_eq!(resolved.port, DEFAULT_INGRESS_PORT);
    }

    #[test]
    fn missing_auth_material_is_an_error() {
        let err = resolve_webhook_config(&TelegramWebhookConfig::default(), &EnvOverlay::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "telegram webhook auth is not configured");
    }

    #[tokio::test]
    async fn ingest_before_start_is_not_accepted() {
        let transport = TelegramWebhookTransport::new();
        let outcome = transport.ingest(serde_json::json!({})).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason.as_deref(), Some("transport_not_running"));
    }

    #[tokio::test]
    async fn ingest_after_stop_is_not_accepted() {
        let transport = TelegramWebhookTransport::new();
        transport.start(Arc::new(RecordingHandler::new())).await;
        assert!(transport.is_running().await);
        transport.stop().await;
        transport.stop().await; // idempotent
        let outcome = transport.ingest(serde_json::json!({})).await.unwrap();
        assert!(!outcome.accepted);
    }

    #[tokio::test]
    async fn ingest_invokes_handler() {
        let transport = TelegramWebhookTransport::new();
        let handler = Arc::new(RecordingHandler::new());
        transport.start(handler.clone()).await;

        let outcome = transport
            .ingest(serde_json::json!({ "update_id": 7 }))
            .await
            .unwrap();
        assert!(outcome.accepted);
        let updates = handler.updates.lock().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["update_id"], 7);
    }

    #[tokio::test]
    async fn handler_error_hits_hook_and_caller() {
        let transport = TelegramWebhookTransport::new();
        let hook_fired = Arc::new(AtomicBool::new(false));
        let hook_flag = hook_fired.clone();
        transport
            .set_error_hook(Arc::new(move |_e| {
                hook_flag.store(true, Ordering::SeqCst);
            }))
            .await;
        transport
            .start(Arc::new(RecordingHandler {
                fail_with: Some("handler exploded".into()),
                ..RecordingHandler::new()
            }))
            .await;

        let err = transport.ingest(serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("handler exploded"));
        assert!(hook_fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_ingest() {
        let transport = Arc::new(TelegramWebhookTransport::new());
        let handler = Arc::new(RecordingHandler {
            delay_ms: 100,
            ..RecordingHandler::new()
        });
        transport.start(handler.clone()).await;

        let ingest_transport = transport.clone();
        let ingest = tokio::spawn(async move {
            ingest_transport.ingest(serde_json::json!({ "slow": true })).await
        });
        // Give the ingest a head start so it is in flight when stop runs.
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.stop().await;
        // stop returned, so the handler must have completed.
        assert_eq!(handler.updates.lock().await.len(), 1);
        assert!(ingest.await.unwrap().unwrap().accepted);
    }

    #[test]
    fn update_to_turn_maps_identity() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "chat": { "id": -100123, "type": "group" },
                "from": { "id": 42, "username": "arthur" },
                "text": "/list"
            }
        });
        let turn = update_to_turn(&update).unwrap();
        assert_eq!(turn.channel, "telegram");
        assert_eq!(turn.conversation_id, "-100123");
        assert_eq!(turn.conversation_key(), "telegram:-100123");
        assert_eq!(turn.text(), "/list");
        assert_eq!(turn.meta.sender_id, Some(serde_json::json!(42)));
        assert_eq!(turn.meta.sender_username.as_deref(), Some("arthur"));
    }

    #[test]
    fn update_to_turn_accepts_caption() {
        let update = serde_json::json!({
            "message": {
                "chat": { "id": 5 },
                "caption": "look at this"
            }
        });
        let turn = update_to_turn(&update).unwrap();
        assert_eq!(turn.text(), "look at this");
    }

    #[test]
    fn update_without_text_is_dropped() {
        let update = serde_json::json!({
            "message": { "chat": { "id": 5 }, "sticker": {} }
        });
        assert!(update_to_turn(&update).is_none());
        assert!(update_to_turn(&serde_json::json!({ "edited_message": {} })).is_none());
    }
}
