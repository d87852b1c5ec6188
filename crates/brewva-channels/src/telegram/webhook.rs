//! HTTP ingress for Telegram updates.
//!
//! Serves POST on the configured path only. Requests authenticate with
//! either a bearer token or an HMAC-SHA256 signature over
//! `timestamp + "\n" + nonce + "\n" + body`, hex-encoded in
//! `X-Brewva-Signature`. Signature comparisons are constant time; replayed
//! nonces and stale timestamps are rejected before the body is parsed.

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use lru::LruCache;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{ResolvedWebhookConfig, TelegramWebhookTransport, WebhookAuth};

pub const HEADER_TIMESTAMP: &str = "x-brewva-timestamp";
pub const HEADER_NONCE: &str = "x-brewva-nonce";
pub const HEADER_SIGNATURE: &str = "x-brewva-signature";

/// Hard cap on remembered nonces. Entries also expire individually at the
/// configured nonce TTL.
pub const NONCE_CACHE_CAPACITY: usize = 65_536;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IngressAuthError {
    #[error("missing or malformed authorization header")]
    MissingBearer,
    #[error("bearer token mismatch")]
    BearerMismatch,
    #[error("missing signature headers")]
    MissingSignatureHeaders,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("request timestamp outside allowed skew")]
    StaleTimestamp,
    #[error("nonce already seen")]
    NonceReplayed,
    #[error("signature does not match")]
    SignatureMismatch,
    #[error("internal hmac error")]
    Internal,
}

/// Bounded replay cache for HMAC nonces.
pub struct NonceCache {
    seen: LruCache<String, i64>,
    ttl_ms: u64,
}

impl NonceCache {
    pub fn new(ttl_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(NONCE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
            ttl_ms,
        }
    }

    /// True when the nonce is fresh. A fresh nonce is remembered until its
    /// TTL passes; a remembered, unexpired nonce is a replay.
    pub fn check_and_insert(&mut self, nonce: &str, now_ms: i64) -> bool {
        if let Some(expires_at) = self.seen.get(nonce) {
            if *expires_at > now_ms {
                return false;
            }
        }
        self.seen
            .put(nonce.to_string(), now_ms.saturating_add(self.ttl_ms as i64));
        true
    }
}

pub fn verify_bearer(expected: &str, headers: &HeaderMap) -> Result<(), IngressAuthError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(IngressAuthError::MissingBearer)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(IngressAuthError::MissingBearer)?;
    if token.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(IngressAuthError::BearerMismatch)
    }
}

/// Verify the HMAC signature and timestamp skew. Nonce replay is checked by
/// the caller so this stays a pure function of its inputs.
pub fn verify_hmac_signature(
    secret: &[u8],
    timestamp: &str,
    nonce: &str,
    body: &[u8],
    provided_hex: &str,
    now_ms: i64,
    max_skew_ms: u64,
) -> Result<(), IngressAuthError> {
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| IngressAuthError::InvalidTimestamp)?;
    if now_ms.abs_diff(ts) > max_skew_ms {
        return Err(IngressAuthError::StaleTimestamp);
    }

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).map_err(|_| IngressAuthError::Internal)?;
    mac.update(timestamp.as_bytes());
    mac.update(b"\n");
    mac.update(nonce.as_bytes());
    mac.update(b"\n");
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected.as_bytes().ct_eq(provided_hex.as_bytes()).unwrap_u8() != 1 {
        return Err(IngressAuthError::SignatureMismatch);
    }
    Ok(())
}

#[derive(Clone)]
pub struct IngressState {
    transport: Arc<TelegramWebhookTransport>,
    auth: Arc<WebhookAuth>,
    max_skew_ms: u64,
    nonces: Arc<tokio::sync::Mutex<NonceCache>>,
}

impl IngressState {
    pub fn new(config: &ResolvedWebhookConfig, transport: Arc<TelegramWebhookTransport>) -> Self {
        Self {
            transport,
            auth: Arc::new(config.auth.clone()),
            max_skew_ms: config.max_skew_ms,
            nonces: Arc::new(tokio::sync::Mutex::new(NonceCache::new(config.nonce_ttl_ms))),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn authorize(
    state: &IngressState,
    headers: &HeaderMap,
    body: &Bytes,
    now_ms: i64,
) -> Result<(), IngressAuthError> {
    match state.auth.as_ref() {
        WebhookAuth::Bearer { token } => verify_bearer(token, headers),
        WebhookAuth::Hmac { secret } => {
            let (Some(timestamp), Some(nonce), Some(signature)) = (
                header_str(headers, HEADER_TIMESTAMP),
                header_str(headers, HEADER_NONCE),
                header_str(headers, HEADER_SIGNATURE),
            ) else {
                return Err(IngressAuthError::MissingSignatureHeaders);
            };

            verify_hmac_signature(
                secret.as_bytes(),
                timestamp,
                nonce,
                body,
                signature,
                now_ms,
                state.max_skew_ms,
            )?;

            // Only signed requests reserve a nonce slot.
            let mut nonces = state.nonces.lock().await;
            if !nonces.check_and_insert(nonce, now_ms) {
                return Err(IngressAuthError::NonceReplayed);
            }
            Ok(())
        }
    }
}

async fn ingest_handler(
    State(state): State<IngressState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let now_ms = chrono::Utc::now().timestamp_millis();
    if let Err(e) = authorize(&state, &headers, &body, now_ms).await {
        warn!("rejecting telegram ingress request: {e}");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    let update: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid_json" })),
            )
                .into_response();
        }
    };

    match state.transport.ingest(update).await {
        Ok(outcome) if outcome.accepted => {
            (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
        }
        Ok(outcome) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": outcome.reason.unwrap_or_else(|| "not_accepted".to_string()),
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Router serving POST on the ingress path only; other methods on the path
/// get 405 from axum's method routing.
pub fn ingress_router(state: IngressState, path: &str) -> Router {
    Router::new()
        .route(path, post(ingest_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the ingress until the cancellation token fires.
pub async fn serve_ingress(
    config: &ResolvedWebhookConfig,
    transport: Arc<TelegramWebhookTransport>,
    cancel: CancellationToken,
) -> Result<()> {
    let state = IngressState::new(config, transport);
    let app = ingress_router(state, &config.path);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("telegram ingress listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
