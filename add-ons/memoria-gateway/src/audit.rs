//! Audit log (spec §4.8 step 6). Every mutating call and every tool
//! invocation gets one `audit_log` row; the write-ingestion pipeline already
//! logs its own row for writes (see `memoria_core::ingest`), this helper
//! covers reads and tool-facade calls the pipeline never sees.

use memoria_core::tenant::TenantHandle;
use serde_json::Value;

pub fn record(handle: &TenantHandle, agent_id: Option<&str>, action: &str, resource: &str, details: Value) {
    let Ok(conn) = handle.connect() else { return };
    let ts = chrono::Utc::now().timestamp_millis();
    let _ = conn.execute(
        "INSERT INTO audit_log (agent_id, action, resource, details, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![agent_id, action, resource, details.to_string(), ts],
    );
}
