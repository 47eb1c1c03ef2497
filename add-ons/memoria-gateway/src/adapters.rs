//! Adapters (spec §4.7): the same facade result shaped for different
//! transports. `shape_tool_result` is shared by the JSON-RPC `tools/call`
//! dispatcher and the legacy `/mcp/call/:tool` REST shim; full REST routes
//! use [`crate::errors::GatewayError`]'s own `{data, meta}` envelope instead.

use crate::errors::GatewayError;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Text-only block, no structured payload (legacy REST shim).
    Plain,
    /// MCP tool result: text block plus `structuredContent`.
    McpStructured,
}

/// Shapes a facade result into `{content:[{type:'text',text}], structuredContent?, isError?}`.
pub fn shape_tool_result(kind: AdapterKind, result: Result<Value, GatewayError>) -> Value {
    match result {
        Ok(value) => {
            let text = summarize(&value);
            match kind {
                AdapterKind::Plain => json!({ "content": [{ "type": "text", "text": text }] }),
                AdapterKind::McpStructured => json!({
                    "content": [{ "type": "text", "text": text }],
                    "structuredContent": value,
                }),
            }
        }
        Err(err) => {
            let (code, message) = error_parts(&err);
            json!({
                "isError": true,
                "content": [{ "type": "text", "text": format!("{code}: {message}") }],
            })
        }
    }
}

/// A short, human-readable line summarizing the result for the plain text
/// block; agents that want structure read `structuredContent` instead.
fn summarize(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn error_parts(err: &GatewayError) -> (&'static str, String) {
    // Reuses the same code/message the REST envelope would render, without
    // constructing a full axum Response for a value that lives inside a
    // JSON-RPC result object.
    let body = err.to_error_body();
    (body.0, body.1)
}
