//! MCP-compatible JSON-RPC 2.0 endpoint exposing two tools.
//!
//! Tool failures are reported inside the result with `isError: true`;
//! JSON-RPC errors are reserved for protocol problems.

use super::{AppState, bare_jid};
use crate::dispatch::OutboundRequest;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Value, json};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const SEND_TOOL: &str = "send_whatsapp_message";
pub const STATUS_TOOL: &str = "get_whatsapp_status";

fn rpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn tool_text(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

pub fn tool_definitions() -> Value {
    json!([
        {
            "name": SEND_TOOL,
            "description": "Send a WhatsApp text message to a phone number or JID.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "number": {
                        "type": "string",
                        "description": "Phone number with country code (digits only) or a full JID"
                    },
                    "message": { "type": "string", "description": "Text to send" }
                },
                "required": ["number", "message"]
            }
        },
        {
            "name": STATUS_TOOL,
            "description": "Report whether the WhatsApp session is connected.",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

/// POST /mcp
pub async fn handle_mcp(State(state): State<AppState>, body: Bytes) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return Json(rpc_error(&Value::Null, PARSE_ERROR, &format!("Parse error: {e}")))
                .into_response();
        }
    };

    let Some(envelope) = request.as_object() else {
        return Json(rpc_error(&Value::Null, INVALID_REQUEST, "Request must be an object"))
            .into_response();
    };
    let id = envelope.get("id").cloned();
    let reply_id = id.clone().unwrap_or(Value::Null);

    if envelope.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Json(rpc_error(&reply_id, INVALID_REQUEST, "jsonrpc must be \"2.0\""))
            .into_response();
    }
    let Some(method) = envelope.get("method").and_then(Value::as_str) else {
        return Json(rpc_error(&reply_id, INVALID_REQUEST, "method is required")).into_response();
    };

    let params = envelope.get("params").cloned().unwrap_or(Value::Null);
    let outcome = dispatch_method(&state, method, &params).await;

    // Notifications get no body.
    if id.is_none() {
        return StatusCode::ACCEPTED.into_response();
    }

    let reply = match outcome {
        Ok(result) => rpc_result(&reply_id, result),
        Err((code, message)) => rpc_error(&reply_id, code, &message),
    };
    Json(reply).into_response()
}

async fn dispatch_method(
    state: &AppState,
    method: &str,
    params: &Value,
) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
        "notifications/initialized" => Ok(json!({})),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_definitions() })),
        "tools/call" => call_tool(state, params).await,
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
    }
}

async fn call_tool(state: &AppState, params: &Value) -> Result<Value, (i64, String)> {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return Err((INVALID_PARAMS, "params.name is required".into()));
    };
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        SEND_TOOL => {
            let arg = |key: &str| {
                args.get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let request = OutboundRequest {
                destination: arg("number"),
                text: arg("message"),
            };
            let destination = state.dispatcher.normalize_destination(request.destination.trim());
            Ok(match state.dispatcher.send_awaited(request).await {
                Ok(message_id) => tool_text(
                    json!({ "success": true, "messageId": message_id, "to": destination })
                        .to_string(),
                    false,
                ),
                Err(e) => tool_text(format!("Error: {e}"), true),
            })
        }
        STATUS_TOOL => {
            let snapshot = state.session.snapshot();
            let status = json!({
                "connected": snapshot.connectivity.is_connected(),
                "user": snapshot.connectivity.identity(),
                "jid": snapshot.connectivity.identity().map(bare_jid),
                "hasQR": snapshot.pairing.is_some(),
                "state": snapshot.connectivity.label(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            serde_json::to_string(&status)
                .map(|text| tool_text(text, false))
                .map_err(|e| (INTERNAL_ERROR, format!("Internal error: {e}")))
        }
        other => Err((INVALID_PARAMS, format!("Unknown tool: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_list_declares_both_tools() {
        let tools = tool_definitions();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert_eq!(names, vec![SEND_TOOL, STATUS_TOOL]);
        assert_eq!(
            tools[0]["inputSchema"]["required"],
            json!(["number", "message"])
        );
    }

    #[test]
    fn error_envelope_shape() {
        let err = rpc_error(&json!(3), METHOD_NOT_FOUND, "Method not found: x");
        assert_eq!(err["jsonrpc"], "2.0");
        assert_eq!(err["id"], 3);
        assert_eq!(err["error"]["code"], -32601);
        assert!(err.get("result").is_none());
    }
}
