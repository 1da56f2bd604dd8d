//! Axum-based webhook listener for EventSub deliveries.
//!
//! One route, `POST /twitch/callback`:
//! - Request body size limit (64KB max), buffered whole before processing
//! - Request timeouts (30s)
//! - HMAC signature check before the body is parsed
//! - Notifications acknowledged first, dispatched afterwards through a queue

use crate::config::{ConfigStore, EventSubConfig, GatewayConfig, UnsignedRequestPolicy};
use crate::eventsub::{
    verify_eventsub_signature, MessageType, Notification, NotificationPayload, RevocationPayload,
    VerificationPayload, HEADER_MESSAGE_ID, HEADER_MESSAGE_SIGNATURE, HEADER_MESSAGE_TIMESTAMP,
    HEADER_MESSAGE_TYPE,
};
use crate::util::redact;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB). EventSub payloads are a few KB at most.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Remembers recently seen message ids so redeliveries are acknowledged
/// without being processed twice.
#[derive(Debug)]
pub struct IdempotencyStore {
    ttl: Duration,
    max_keys: usize,
    keys: Mutex<HashMap<String, Instant>>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            ttl,
            max_keys: max_keys.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            Duration::from_secs(config.dedup_ttl_secs),
            config.dedup_max_keys,
        )
    }

    /// Returns true if this key is new and is now recorded.
    pub fn record_if_new(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        keys.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);

        if keys.contains_key(key) {
            return false;
        }

        if keys.len() >= self.max_keys {
            let evict_key = keys
                .iter()
                .min_by_key(|(_, seen_at)| *seen_at)
                .map(|(k, _)| k.clone());
            if let Some(evict_key) = evict_key {
                keys.remove(&evict_key);
            }
        }

        keys.insert(key.to_owned(), now);
        true
    }
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub dedup: Arc<IdempotencyStore>,
    /// Queue drained by the notification router.
    pub notifications: mpsc::Sender<Notification>,
}

impl AppState {
    pub fn new(config: Arc<ConfigStore>, notifications: mpsc::Sender<Notification>) -> Self {
        let dedup = Arc::new(IdempotencyStore::from_config(&config.current().gateway));
        Self {
            config,
            dedup,
            notifications,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            EventSubConfig::CALLBACK_PATH,
            post(handle_callback).fallback(handle_method_not_allowed),
        )
        .fallback(handle_not_found)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Bind the configured listen address.
pub async fn bind(config: &GatewayConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    tracing::info!(
        "EventSub listener on {}",
        listener.local_addr().map_or(addr, |a| a.to_string())
    );
    Ok(listener)
}

/// Serve the callback route on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Gateway server failed")
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Reject messages whose timestamp is more than `max_age` away from `now`.
fn check_message_age(timestamp: &str, max_age: Duration, now: DateTime<Utc>) -> Result<(), String> {
    let sent = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| format!("unparseable timestamp {timestamp:?}: {e}"))?
        .with_timezone(&Utc);
    let age_secs = now.signed_duration_since(sent).num_seconds().unsigned_abs();
    if age_secs > max_age.as_secs() {
        return Err(format!("message is {age_secs}s away from now"));
    }
    Ok(())
}

fn bad_request(what: &str, err: &serde_json::Error) -> Response {
    tracing::warn!("Authenticated {what} body could not be parsed: {err}");
    (StatusCode::BAD_REQUEST, "Malformed payload").into_response()
}

/// POST /twitch/callback
async fn handle_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = state.config.current();

    let Some(signature) = header_str(&headers, HEADER_MESSAGE_SIGNATURE) else {
        return match config.gateway.unsigned_requests {
            UnsignedRequestPolicy::Ignore => {
                tracing::debug!("Unsigned request on callback ignored");
                StatusCode::NO_CONTENT.into_response()
            }
            UnsignedRequestPolicy::Reject => {
                tracing::warn!("Unsigned request on callback rejected");
                (StatusCode::UNAUTHORIZED, "Missing signature").into_response()
            }
        };
    };
    let message_id = header_str(&headers, HEADER_MESSAGE_ID).unwrap_or_default();
    let timestamp = header_str(&headers, HEADER_MESSAGE_TIMESTAMP).unwrap_or_default();

    // ── Authentication ──
    if let Err(e) = verify_eventsub_signature(
        &config.twitch.eventsub.secret,
        message_id,
        timestamp,
        &body,
        signature,
    ) {
        tracing::warn!(
            message_id,
            received = %redact(signature),
            "Webhook signature verification failed: {e}"
        );
        return (StatusCode::UNAUTHORIZED, "Invalid Signature").into_response();
    }
    tracing::debug!(message_id, "Good signature");

    if config.gateway.max_message_age_secs > 0 {
        let max_age = Duration::from_secs(config.gateway.max_message_age_secs);
        if let Err(reason) = check_message_age(timestamp, max_age, Utc::now()) {
            tracing::warn!(message_id, "Rejecting stale webhook message: {reason}");
            return (StatusCode::UNAUTHORIZED, "Stale message").into_response();
        }
    }

    // ── Classification ──
    let raw_type = header_str(&headers, HEADER_MESSAGE_TYPE).unwrap_or_default();
    let Some(message_type) = MessageType::parse(raw_type) else {
        tracing::warn!(message_id, "Unknown message type {raw_type:?}");
        return (StatusCode::BAD_REQUEST, "Unknown message type").into_response();
    };

    match message_type {
        MessageType::WebhookCallbackVerification => {
            let payload: VerificationPayload = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => return bad_request("verification", &e),
            };
            if let Some(subscription) = &payload.subscription {
                tracing::info!(
                    subscription_id = %subscription.id,
                    "Acknowledged new {} subscription",
                    subscription.kind
                );
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                payload.challenge,
            )
                .into_response()
        }
        MessageType::Notification => {
            let payload: NotificationPayload = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => return bad_request("notification", &e),
            };
            // Id-less deliveries cannot be told apart, so they are never deduplicated.
            if !message_id.is_empty() && !state.dedup.record_if_new(message_id) {
                tracing::debug!(message_id, "Duplicate notification acknowledged");
                return StatusCode::NO_CONTENT.into_response();
            }
            tracing::debug!(
                message_id,
                subscription_type = %payload.subscription.kind,
                "Got a notification"
            );
            let notification = Notification {
                message_id: message_id.to_owned(),
                subscription: payload.subscription,
                event: payload.event,
            };
            match state.notifications.try_send(notification) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => tracing::error!(
                    message_id = %dropped.message_id,
                    "Dispatch queue full, dropping notification"
                ),
                Err(TrySendError::Closed(dropped)) => tracing::error!(
                    message_id = %dropped.message_id,
                    "Dispatcher stopped, dropping notification"
                ),
            }
            StatusCode::NO_CONTENT.into_response()
        }
        MessageType::Revocation => {
            let payload: RevocationPayload = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => return bad_request("revocation", &e),
            };
            tracing::info!(
                subscription_id = %payload.subscription.id,
                subscription_type = %payload.subscription.kind,
                reason = %payload.subscription.status,
                "Revocation of subscription acknowledged"
            );
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

async fn handle_method_not_allowed(method: Method) -> impl IntoResponse {
    tracing::debug!(%method, "Method not allowed on callback");
    (StatusCode::METHOD_NOT_ALLOWED, "What are you doing?")
}

async fn handle_not_found(uri: Uri) -> impl IntoResponse {
    tracing::debug!("Unknown path {uri}");
    (StatusCode::NOT_FOUND, "Not Found")
}
