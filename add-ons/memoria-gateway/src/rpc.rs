//! JSON-RPC 2.0 transport (spec §4.8), mounted at `/mcp` and
//! `/chatgpt-mcp`. Handles `initialize`, `tools/list`, `tools/call`; any
//! other method is a standard JSON-RPC `-32601 Method not found`.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::adapters::{shape_tool_result, AdapterKind};
use crate::auth::Principal;
use crate::facade;
use crate::state::AppState;

const GATEWAY_PROTOCOL_VERSION: &str = "2024-11-05";

fn tool_list() -> Value {
    json!([
        {
            "name": "memorize",
            "description": "Durably record a fact, profile field, table row, or free-form memory.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "category": { "type": "string", "description": "profile, a table name, or omitted for a free-form memory" },
                    "data": { "type": "object" },
                },
                "required": ["text"],
            },
            "annotations": { "readOnlyHint": false, "destructiveHint": false },
        },
        {
            "name": "recall",
            "description": "Retrieve context, targeted knowledge, or a table page.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "topic": { "type": "string" },
                    "mode": { "type": "string", "enum": ["context", "knowledge", "table"] },
                    "table": { "type": "string" },
                    "budget": { "type": "integer" },
                },
            },
            "annotations": { "readOnlyHint": true, "destructiveHint": false },
        },
        {
            "name": "review",
            "description": "List or resolve memories under contradiction review.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["list", "resolve"] },
                    "metaId": { "type": "integer" },
                    "resolution": { "type": "string", "enum": ["confirm", "reject", "keep_both"] },
                },
                "required": ["action"],
            },
            "annotations": { "readOnlyHint": false, "destructiveHint": false },
        },
    ])
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Value, code: i64, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// Entry point for both `/mcp` and `/chatgpt-mcp`: the wire protocol is
/// identical, the two paths only exist so a client can pin one or the
/// other without the gateway caring which it used.
pub async fn handle(State(state): State<AppState>, principal: Principal, Json(request): Json<Value>) -> Json<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    let response = match method {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": GATEWAY_PROTOCOL_VERSION,
                "serverInfo": { "name": "memoria", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": { "tools": {} },
            }),
        ),
        "tools/list" => rpc_result(id, json!({ "tools": tool_list() })),
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Json(rpc_error(id, -32602, "missing params.name".to_string()));
            };
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let result = facade::call_tool(&state, &principal, name, args).await;
            rpc_result(id, shape_tool_result(AdapterKind::McpStructured, result))
        }
        other => rpc_error(id, -32601, format!("method not found: {other}")),
    };
    Json(response)
}
