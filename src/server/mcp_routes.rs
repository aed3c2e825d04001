//! Session HTTP façade: POST/GET/DELETE `/mcp`
//!
//! Correlates HTTP requests to MCP sessions, enforces the session-id header
//! invariant, binds sessions to credential fingerprints (softly), runs the
//! origin/protocol/auth gates, and mediates the streaming transport.

use crate::config::AuthStrategy;
use crate::mcp::types::{McpBody, McpResponse};
use crate::server::validation::{challenge_response, validate_origin, validate_protocol_version};
use crate::server::AppState;
use crate::storage::session_store::SessionPatch;
use crate::utils::redact_token;
use actix_web::{web, HttpRequest, HttpResponse};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Live streaming transports keyed by session id
#[derive(Default)]
pub struct TransportRegistry {
    channels: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl TransportRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the stream for a session
    pub async fn open(&self, session_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.write().await;
        if channels.insert(session_id.to_string(), tx).is_some() {
            debug!("Replaced existing transport for session {}", session_id);
        }
        rx
    }

    /// Close the stream for a session, if any
    pub async fn close(&self, session_id: &str) {
        if self.channels.write().await.remove(session_id).is_some() {
            debug!("Closed transport for session {}", session_id);
        }
    }

    /// Push a server-initiated event to a session's stream
    pub async fn notify(&self, session_id: &str, event: &str) -> bool {
        let channels = self.channels.read().await;
        match channels.get(session_id) {
            Some(tx) => tx.send(format!("data: {}\n\n", event)).is_ok(),
            None => false,
        }
    }
}

/// Lowercased header map for resolution and fingerprinting
fn header_map(req: &HttpRequest) -> HashMap<String, String> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

fn session_header(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .filter(|v| !v.is_empty())
}

/// Derive the credential fingerprint for soft session binding
///
/// Order: configured API-key header, `x-api-key`, `x-auth-token`, the
/// bearer token, the raw `Authorization` value, the configured API key, and
/// finally the literal `"public"`.
fn compute_fingerprint(state: &AppState, headers: &HashMap<String, String>) -> String {
    let auth = &state.config.auth;

    if auth.api_key_header != "x-api-key" {
        if let Some(value) = headers.get(&auth.api_key_header) {
            return value.clone();
        }
    }
    if let Some(value) = headers.get("x-api-key") {
        return value.clone();
    }
    if let Some(value) = headers.get("x-auth-token") {
        return value.clone();
    }
    if let Some(authorization) = headers.get("authorization") {
        if let Some(bearer) = authorization
            .strip_prefix("Bearer ")
            .or_else(|| authorization.strip_prefix("bearer "))
        {
            return bearer.trim().to_string();
        }
        return authorization.clone();
    }
    if let Some(key) = &auth.api_key {
        return key.clone();
    }
    "public".to_string()
}

fn jsonrpc_error_body(code: i32, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": null
    })
}

/// Create the session record once a successful initialize response exists
///
/// The dispatcher negotiated the protocol version before the record was
/// created, so the negotiated fields are re-applied here from the response
/// and request.
async fn confirm_session(
    state: &AppState,
    session_id: &str,
    fingerprint: &str,
    message: &crate::mcp::types::McpRequest,
    response: Option<&McpResponse>,
) {
    if let Err(e) = state.session_store.create(session_id, Some(fingerprint)).await {
        warn!("Failed to create session {}: {}", session_id, e);
        return;
    }

    let protocol_version = response
        .and_then(|r| r.result.as_ref())
        .and_then(|result| result.get("protocolVersion"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let client_info = message
        .params
        .as_ref()
        .and_then(|p| p.get("clientInfo"))
        .cloned();

    let patch = SessionPatch {
        protocol_version,
        client_info,
        ..Default::default()
    };
    if let Err(e) = state.session_store.update(session_id, patch).await {
        warn!("Failed to record negotiated version on session {}: {}", session_id, e);
    }

    info!(
        "Session {} created for credential {}",
        session_id,
        redact_token(fingerprint)
    );
}

fn needs_challenge(state: &AppState, headers: &HashMap<String, String>) -> bool {
    let auth = &state.config.auth;
    if !auth.enabled || auth.strategy != AuthStrategy::OAuth {
        return false;
    }
    // API-key style headers pass the challenge as a secondary path; the
    // resolver decides what the handlers actually see.
    !(headers.contains_key("authorization")
        || headers.contains_key("x-api-key")
        || headers.contains_key("x-auth-token"))
}

/// POST `/mcp`: JSON-RPC dispatch
pub async fn handle_mcp_post(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let parsed = match McpBody::parse(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return HttpResponse::BadRequest().json(jsonrpc_error_body(-32700, &e.to_string()));
        }
    };

    let has_initialize = parsed.contains_method("initialize");
    let headers = header_map(&req);

    // Session-id invariant: mandatory unless the body initializes
    let existing_session = session_header(&req);
    let session_id = match (&existing_session, has_initialize) {
        (None, false) => {
            return HttpResponse::BadRequest()
                .json(jsonrpc_error_body(-32000, "Bad Request: Mcp-Session-Id required"));
        }
        (None, true) => Uuid::new_v4().to_string(),
        (Some(id), true) => id.clone(),
        (Some(id), false) => {
            match state.session_store.get(id).await {
                Ok(Some(_)) => id.clone(),
                Ok(None) => {
                    // Evicted or never-existed: drop any stale transport too
                    state.transports.close(id).await;
                    return HttpResponse::NotFound().json(jsonrpc_error_body(-32000, "Invalid session"));
                }
                Err(e) => {
                    warn!("Session lookup failed: {}", e);
                    return HttpResponse::InternalServerError()
                        .json(jsonrpc_error_body(-32603, "Internal error"));
                }
            }
        }
    };

    let fingerprint = compute_fingerprint(&state, &headers);

    // Soft binding: a different credential is logged and served
    if let Ok(Some(session)) = state.session_store.get(&session_id).await {
        if let Some(bound) = &session.api_key {
            if *bound != fingerprint {
                warn!(
                    "Session {} presented a different credential (bound {}, got {}); serving anyway",
                    session_id,
                    redact_token(bound),
                    redact_token(&fingerprint)
                );
            }
        }
    }

    // Origin and protocol-version gates answer with the 401 challenge
    let development = state.config.server.is_development();
    if let Err(e) = validate_origin(&req, development) {
        return challenge_response(&state.base_url, &session_id, &e.to_string());
    }
    if let Err(e) = validate_protocol_version(&req) {
        return challenge_response(&state.base_url, &session_id, &e.to_string());
    }
    if needs_challenge(&state, &headers) {
        return challenge_response(&state.base_url, &session_id, "Unauthorized");
    }

    let auth = match state.resolver.resolve(&headers).await {
        Ok(auth) => auth,
        Err(e) => {
            warn!("Credential resolution failed: {}", e);
            return challenge_response(&state.base_url, &session_id, &e.to_string());
        }
    };

    let mut responses: Vec<McpResponse> = Vec::new();
    for message in parsed.messages() {
        // Seed the request context before dispatch; it is torn down below on
        // every path out of this handler.
        let seeded_id = message.id_string();
        if let Some(request_id) = &seeded_id {
            state.contexts.create(request_id, &session_id, auth.clone()).await;
        }

        let response = state.dispatcher.dispatch(message, &session_id, &auth).await;

        // SessionStore.create is deferred until the transport confirms
        // initialization: the record appears only once a successful
        // initialize response exists to carry the session id.
        if message.method == "initialize"
            && response.as_ref().map(|r| r.error.is_none()).unwrap_or(false)
        {
            confirm_session(&state, &session_id, &fingerprint, message, response.as_ref()).await;
        }

        if let Some(request_id) = &seeded_id {
            state.contexts.delete(request_id).await;
        }
        if let Some(response) = response {
            responses.push(response);
        }
    }

    // Notifications-only bodies are acknowledged without a JSON-RPC response
    if responses.is_empty() {
        return HttpResponse::Accepted()
            .insert_header(("Mcp-Session-Id", session_id))
            .finish();
    }

    let mut builder = HttpResponse::Ok();
    builder.insert_header(("Mcp-Session-Id", session_id));
    match parsed {
        McpBody::Single(_) => builder.json(&responses[0]),
        McpBody::Batch(_) => builder.json(&responses),
    }
}

/// GET `/mcp`: SSE-style streaming transport
pub async fn handle_mcp_get(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let session_id = match session_header(&req) {
        Some(id) => id,
        None => {
            return HttpResponse::MethodNotAllowed()
                .json(jsonrpc_error_body(-32000, "Mcp-Session-Id required for streaming"));
        }
    };

    match state.session_store.get(&session_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound().json(jsonrpc_error_body(-32000, "Invalid session"));
        }
        Err(e) => {
            warn!("Session lookup failed: {}", e);
            return HttpResponse::InternalServerError()
                .json(jsonrpc_error_body(-32603, "Internal error"));
        }
    }

    let rx = state.transports.open(&session_id).await;
    info!("Opened streaming transport for session {}", session_id);

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<web::Bytes, actix_web::Error>(web::Bytes::from(event)), rx))
    });

    HttpResponse::Ok()
        .insert_header(("Mcp-Session-Id", session_id))
        .insert_header(("Cache-Control", "no-cache"))
        .content_type("text/event-stream")
        .streaming(stream)
}

/// DELETE `/mcp`: session termination
pub async fn handle_mcp_delete(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let session_id = match session_header(&req) {
        Some(id) => id,
        None => {
            return HttpResponse::BadRequest()
                .json(jsonrpc_error_body(-32000, "Bad Request: Mcp-Session-Id required"));
        }
    };

    match state.session_store.get(&session_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound().json(jsonrpc_error_body(-32000, "Invalid session"));
        }
        Err(e) => {
            warn!("Session lookup failed: {}", e);
            return HttpResponse::InternalServerError()
                .json(jsonrpc_error_body(-32603, "Internal error"));
        }
    }

    state.transports.close(&session_id).await;
    if let Err(e) = state.session_store.delete(&session_id).await {
        warn!("Failed to delete session {}: {}", session_id, e);
    }
    let dropped = state.contexts.delete_by_session(&session_id).await;
    info!(
        "Session {} terminated ({} in-flight contexts dropped)",
        session_id, dropped
    );

    HttpResponse::Ok()
        .insert_header(("Mcp-Session-Id", session_id))
        .json(serde_json::json!({"ok": true}))
}

/// GET `/health`: liveness
pub async fn handle_health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
