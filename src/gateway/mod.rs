//! HTTP control plane: status, pairing panel, outbound send, MCP shim.

pub mod mcp;
pub mod qr;
pub mod sse;

use crate::config::SendMode;
use crate::dispatch::{DeliveryMode, DispatchError, OutboundDispatcher, OutboundRequest, SendOutcome};
use crate::inbound::WebhookForwarder;
use crate::session::SessionState;
use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionState>,
    pub dispatcher: Arc<OutboundDispatcher>,
    pub webhook: Option<Arc<WebhookForwarder>>,
    pub send_mode: SendMode,
}

pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/qr", get(handle_qr))
        .route("/send-message", post(handle_send_message))
        .route("/test-webhook", post(handle_test_webhook))
        .route("/mcp", post(mcp::handle_mcp))
        .route("/mcp/sse", get(sse::handle_mcp_sse))
        .fallback(handle_not_found)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn run_gateway(
    host: &str,
    port: u16,
    state: AppState,
    max_body_bytes: usize,
) -> Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}"))
        .await
        .with_context(|| format!("Failed to bind gateway on {host}:{port}"))?;
    let addr = listener.local_addr()?;

    tracing::info!("Gateway listening on http://{addr}");
    println!("  GET  /health        - liveness + session state");
    println!("  GET  /status        - 200 when connected, 503 otherwise");
    println!("  GET  /qr            - pairing panel (?format=json for raw token)");
    println!("  POST /send-message  - {{\"number\": \"...\", \"message\": \"...\"}}");
    println!("  POST /mcp           - MCP JSON-RPC tools");
    println!("  GET  /mcp/sse       - MCP keep-alive stream");
    if state.webhook.is_some() {
        println!("  POST /test-webhook  - send a synthetic event to the webhook");
    }

    crate::health::report_ok("gateway");
    axum::serve(listener, build_router(state, max_body_bytes))
        .await
        .context("Gateway server error")
}

// ── Response helpers ─────────────────────────────────────────────

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok_json(value: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(value))
}

fn err_json(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(json!({ "error": message })))
}

pub(crate) fn dispatch_err_status(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DispatchError::SendFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `15551234567:3@s.whatsapp.net` -> `15551234567@s.whatsapp.net`
pub(crate) fn bare_jid(identity: &str) -> String {
    match identity.split_once('@') {
        Some((user, domain)) => {
            let user = user.split_once(':').map_or(user, |(u, _)| u);
            format!("{user}@{domain}")
        }
        None => identity.split_once(':').map_or(identity, |(u, _)| u).to_string(),
    }
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_health(State(state): State<AppState>) -> ApiResponse {
    let connectivity = state.session.connectivity();
    ok_json(json!({
        "status": if connectivity.is_connected() { "connected" } else { "disconnected" },
        "user": connectivity.identity(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "state": connectivity.label(),
        "runtime": crate::health::snapshot_json(),
    }))
}

async fn handle_status(State(state): State<AppState>) -> ApiResponse {
    let snapshot = state.session.snapshot();
    match snapshot.connectivity.identity() {
        Some(identity) => ok_json(json!({
            "connected": true,
            "user": identity,
            "jid": bare_jid(identity),
            "name": snapshot.display_name,
        })),
        None => err_json(StatusCode::SERVICE_UNAVAILABLE, "WhatsApp not connected"),
    }
}

#[derive(Debug, Deserialize)]
struct QrQuery {
    format: Option<String>,
}

async fn handle_qr(State(state): State<AppState>, Query(query): Query<QrQuery>) -> Response {
    let snapshot = state.session.snapshot();
    let token = snapshot.pairing.as_ref().map(|p| p.token.clone());

    if query.format.as_deref() == Some("json") {
        let status = match (&snapshot.connectivity, &token) {
            (c, _) if c.is_connected() => "connected",
            (_, Some(_)) => "pending",
            (_, None) => "waiting",
        };
        return ok_json(json!({
            "status": status,
            "qr": token,
            "issuedAt": snapshot.pairing.map(|p| p.issued_at.to_rfc3339()),
        }))
        .into_response();
    }

    if let Some(identity) = snapshot.connectivity.identity() {
        return Html(qr::connected_page(identity)).into_response();
    }
    let Some(token) = token else {
        return Html(qr::waiting_page()).into_response();
    };
    match qr::render_svg(&token) {
        Ok(svg) => Html(qr::challenge_page(&svg)).into_response(),
        Err(e) => {
            tracing::error!("Failed to render pairing QR: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render QR code").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    #[serde(default)]
    number: String,
    #[serde(default)]
    message: String,
    /// `awaited` or `queued`; falls back to the configured mode.
    mode: Option<String>,
}

async fn handle_send_message(
    State(state): State<AppState>,
    body: Result<Json<SendMessageBody>, JsonRejection>,
) -> ApiResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return err_json(StatusCode::BAD_REQUEST, &rejection.body_text()),
    };

    let configured = match body.mode.as_deref() {
        None => state.send_mode,
        Some(raw) => match SendMode::parse(raw) {
            Some(mode) => mode,
            None => {
                return err_json(
                    StatusCode::BAD_REQUEST,
                    "mode must be \"awaited\" or \"queued\"",
                );
            }
        },
    };
    let mode = match configured {
        SendMode::Awaited => DeliveryMode::Awaited,
        SendMode::Queued => DeliveryMode::FireAndForget,
    };

    let request = OutboundRequest {
        destination: body.number,
        text: body.message,
    };
    match state.dispatcher.send(request, mode).await {
        Ok(SendOutcome::Delivered { message_id }) => {
            ok_json(json!({ "success": true, "messageId": message_id }))
        }
        Ok(SendOutcome::Queued) => ok_json(json!({ "success": true, "status": "queued" })),
        Err(e) => {
            if !matches!(e, DispatchError::InvalidRequest(_)) {
                tracing::warn!("Send request failed: {e}");
            }
            err_json(dispatch_err_status(&e), &e.to_string())
        }
    }
}

async fn handle_test_webhook(State(state): State<AppState>) -> ApiResponse {
    let Some(webhook) = state.webhook.as_ref() else {
        return err_json(StatusCode::BAD_REQUEST, "No webhook URL configured");
    };

    let payload = json!({
        "from": "test@s.whatsapp.net",
        "text": "Test message from WhatsApp bridge",
        "timestamp": chrono::Utc::now().timestamp(),
        "messageId": format!("TEST-{}", uuid::Uuid::new_v4()),
        "test": true,
    });
    match webhook.forward_value(&payload).await {
        Ok(reply) => ok_json(json!({
            "success": true,
            "webhook": webhook.url(),
            "status": reply.status,
            "response": reply.body,
        })),
        Err(e) => {
            tracing::warn!("Test webhook failed: {e:#}");
            err_json(StatusCode::BAD_GATEWAY, &format!("{e:#}"))
        }
    }
}

async fn handle_not_found() -> ApiResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not found",
            "routes": [
                "GET /health", "GET /status", "GET /qr", "POST /send-message",
                "POST /test-webhook", "POST /mcp", "GET /mcp/sse"
            ]
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_jid_strips_device_suffix() {
        assert_eq!(
            bare_jid("15551234567:12@s.whatsapp.net"),
            "15551234567@s.whatsapp.net"
        );
        assert_eq!(bare_jid("15551234567@s.whatsapp.net"), "15551234567@s.whatsapp.net");
        assert_eq!(bare_jid("15551234567:4"), "15551234567");
    }

    #[test]
    fn dispatch_errors_map_to_http_status() {
        assert_eq!(
            dispatch_err_status(&DispatchError::NotConnected),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            dispatch_err_status(&DispatchError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            dispatch_err_status(&DispatchError::SendFailed("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
