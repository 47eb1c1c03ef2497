//! Tool facade (spec §4.7): three tools — `memorize`, `recall`, `review` —
//! plus legacy alias translation for older agent integrations that still
//! call the pre-consolidation tool names. Every tool takes and returns
//! `serde_json::Value` so [`crate::rpc`] and [`crate::rest`] can shape the
//! same call for JSON-RPC or plain REST without duplicating the logic here.

use memoria_core::consent::{Action, ConsentEngine};
use memoria_core::enrichment::JobKind;
use memoria_core::graph::{Direction, GraphStore};
use memoria_core::ingest::{IngestKind, IngestPipeline};
use memoria_core::ledger::{Ledger, Origin, ResolveAction, Status};
use memoria_core::profile::ProfileStore;
use memoria_core::tables::TableStore;
use memoria_core::tenant::TenantHandle;
use memoria_core::vectors::VectorStore;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::Principal;
use crate::errors::GatewayError;
use crate::state::AppState;

const DEFAULT_BUDGET: i64 = 20;

fn tenant_id(principal: &Principal) -> Result<&str, GatewayError> {
    principal.tenant_id().ok_or_else(|| GatewayError::Unauthorized("authentication required".to_string()))
}

async fn handle_for(state: &AppState, principal: &Principal) -> Result<std::sync::Arc<TenantHandle>, GatewayError> {
    let tenant = tenant_id(principal)?;
    Ok(state.tenants.tenant_or_create(tenant)?)
}

fn str_arg(args: &Value, field: &str) -> Option<String> {
    args.get(field).and_then(Value::as_str).map(|s| s.to_string())
}

fn i64_arg(args: &Value, field: &str, default: i64) -> i64 {
    args.get(field).and_then(Value::as_i64).unwrap_or(default)
}

/// `memorize(text, category?, data?)` (spec §4.7): classifies the write by
/// `category` and funnels it through [`IngestPipeline::ingest`].
pub async fn memorize(state: &AppState, principal: &Principal, args: Value) -> Result<Value, GatewayError> {
    let handle = handle_for(state, principal).await?;
    let text = str_arg(&args, "text").ok_or_else(|| GatewayError::InvalidArgs("memorize requires text".to_string()))?;
    let category = str_arg(&args, "category");
    let data = args.get("data").cloned();
    let agent_id = principal.agent_id().to_string();

    // Agents may self-report a finer-grained origin than the principal-type
    // default via a top-level `origin` arg, covering the `ai_inferred` /
    // `ai_pattern` / `imported` / `system` rows of the origin table in
    // spec §4.3 that no principal type implies on its own.
    let origin = str_arg(&args, "origin").as_deref().and_then(Origin::parse).unwrap_or_else(|| {
        if matches!(principal, Principal::Session { .. }) { Origin::UserStated } else { Origin::AiStated }
    });

    let (kind, payload) = match category.as_deref() {
        Some("profile") => (IngestKind::Profile, data.unwrap_or_else(|| json!({ "note": text }))),
        Some("memory") | None => (
            IngestKind::MemoryText { collection: "memories".to_string() },
            json!({ "text": text, "metadata": data.unwrap_or(Value::Null) }),
        ),
        Some(table) => (IngestKind::TableRow { table: table.to_string() }, data.unwrap_or_else(|| json!({ "text": text }))),
    };

    let write_id = Uuid::new_v4().to_string();
    let result = IngestPipeline::ingest(
        &handle,
        &state.queue,
        state.embedding_provider.as_ref(),
        kind,
        payload,
        origin,
        &agent_id,
        &agent_id,
        &write_id,
    )
    .await?;

    Ok(json!({
        "success": true,
        "sourceRef": result.source_ref,
        "writeId": result.write_id,
        "writeStatus": result.write_status,
    }))
}

/// `recall(topic?, mode?, table?, budget?)` (spec §4.7). `mode` is one of
/// `context` (default), `knowledge`, `table`.
pub async fn recall(state: &AppState, principal: &Principal, args: Value) -> Result<Value, GatewayError> {
    let handle = handle_for(state, principal).await?;
    let agent_id = principal.agent_id();
    let mode = str_arg(&args, "mode").unwrap_or_else(|| "context".to_string());
    let budget = i64_arg(&args, "budget", DEFAULT_BUDGET).max(1);

    match mode.as_str() {
        "knowledge" => recall_knowledge(state, &handle, agent_id, &args, budget).await,
        "table" => recall_table(&handle, agent_id, &args, budget),
        _ => recall_context(&handle, agent_id, budget),
    }
}

fn consent_allows(handle: &TenantHandle, agent_id: &str, resource: &str, action: Action) -> bool {
    ConsentEngine::check(handle, agent_id, resource, action).unwrap_or(false)
}

fn recall_context(handle: &TenantHandle, agent_id: &str, budget: i64) -> Result<Value, GatewayError> {
    let profile = if consent_allows(handle, agent_id, "profile", Action::Read) {
        ProfileStore::current(handle)?.map(|v| v.data)
    } else {
        None
    };

    let tables = if consent_allows(handle, agent_id, "tables", Action::Read) {
        TableStore::list_tables(handle)?
            .into_iter()
            .take(budget as usize)
            .map(|t| json!({ "tableName": t.table_name, "recordCount": t.record_count }))
            .collect()
    } else {
        Vec::new()
    };

    let entities = if consent_allows(handle, agent_id, "graph", Action::Read) {
        GraphStore::list_entities(handle, None, None, None, budget, 0)?
    } else {
        Vec::new()
    };

    Ok(json!({
        "profile": profile,
        "tables": Value::Array(tables),
        "entities": entities,
    }))
}

async fn recall_knowledge(
    state: &AppState,
    handle: &TenantHandle,
    agent_id: &str,
    args: &Value,
    budget: i64,
) -> Result<Value, GatewayError> {
    let topic = str_arg(args, "topic").ok_or_else(|| GatewayError::InvalidArgs("recall mode=knowledge requires topic".to_string()))?;

    let mut planned_sources = vec!["vectors".to_string(), "graph".to_string(), "tables".to_string()];
    let mut queried_sources = Vec::new();
    let mut missing_sources = Vec::new();
    let mut facts = Vec::new();

    if consent_allows(handle, agent_id, "vectors", Action::Read) {
        queried_sources.push("vectors".to_string());
        if state.embedding_provider.is_available().await {
            if let Ok(embedding) = state.embedding_provider.embed(&topic).await {
                if let Ok(hits) = VectorStore::search(handle, "memories", &embedding, budget as usize) {
                    for (entry, score) in hits {
                        facts.push(json!({ "source": "vectors", "text": entry.text, "score": score }));
                    }
                }
            }
        } else {
            missing_sources.push("vectors".to_string());
        }
    } else {
        missing_sources.push("vectors".to_string());
    }

    if consent_allows(handle, agent_id, "graph", Action::Read) {
        queried_sources.push("graph".to_string());
        if let Ok(entities) = GraphStore::query_pattern(handle, &topic) {
            for e in entities {
                facts.push(json!({ "source": "graph", "entity": e }));
            }
        } else if let Ok(matches) = GraphStore::find_by_name(handle, &topic, None, budget as usize) {
            for e in matches {
                facts.push(json!({ "source": "graph", "entity": e }));
            }
        }
    } else {
        missing_sources.push("graph".to_string());
    }

    if consent_allows(handle, agent_id, "tables", Action::Read) {
        queried_sources.push("tables".to_string());
        for table in TableStore::list_tables(handle)? {
            if table.table_name.to_lowercase().contains(&topic.to_lowercase()) {
                for record in TableStore::list_records(handle, &table.table_name, budget, 0)? {
                    facts.push(json!({ "source": "tables", "table": table.table_name, "record": record }));
                }
            }
        }
    } else {
        missing_sources.push("tables".to_string());
    }

    planned_sources.sort();
    queried_sources.sort();
    missing_sources.sort();
    missing_sources.dedup();
    let score = if planned_sources.is_empty() { 0.0 } else { queried_sources.len() as f64 / planned_sources.len() as f64 };

    Ok(json!({
        "topic": topic,
        "facts": facts,
        "coverageDetails": {
            "score": score,
            "plannedSources": planned_sources,
            "queriedSources": queried_sources,
            "missingSources": missing_sources,
        },
    }))
}

fn recall_table(handle: &TenantHandle, agent_id: &str, args: &Value, budget: i64) -> Result<Value, GatewayError> {
    let table = str_arg(args, "table");
    let offset = i64_arg(args, "offset", 0);

    match table {
        None => {
            if !consent_allows(handle, agent_id, "tables", Action::Read) {
                return Err(GatewayError::ConsentDenied("tables".to_string()));
            }
            let tables = TableStore::list_tables(handle)?;
            Ok(json!({ "tables": tables }))
        }
        Some(name) => {
            let resource = format!("tables/{name}");
            if !consent_allows(handle, agent_id, &resource, Action::Read) {
                return Err(GatewayError::ConsentDenied(resource));
            }
            let records = TableStore::list_records(handle, &name, budget, offset)?;
            Ok(json!({ "table": name, "records": records }))
        }
    }
}

/// `review(action, metaId?, resolution?)` (spec §4.7, §4.3). `action` is
/// `list` or `resolve`.
pub async fn review(state: &AppState, principal: &Principal, args: Value) -> Result<Value, GatewayError> {
    let handle = handle_for(state, principal).await?;
    let agent_id = principal.agent_id();
    let action = str_arg(&args, "action").unwrap_or_else(|| "list".to_string());

    match action.as_str() {
        "list" => {
            let limit = i64_arg(&args, "budget", DEFAULT_BUDGET).max(1);
            let rows = Ledger::list_by_status(&handle, Status::Review, limit, 0)?;
            Ok(json!({ "reviewQueue": rows }))
        }
        "resolve" => {
            if !consent_allows(&handle, agent_id, "memory/review", Action::Write) {
                return Err(GatewayError::ConsentDenied("memory/review".to_string()));
            }
            let meta_id = args
                .get("metaId")
                .and_then(Value::as_i64)
                .ok_or_else(|| GatewayError::InvalidArgs("review action=resolve requires metaId".to_string()))?;
            let resolution = str_arg(&args, "resolution")
                .ok_or_else(|| GatewayError::InvalidArgs("review action=resolve requires resolution".to_string()))?;
            let resolve_action = ResolveAction::parse(&resolution)
                .ok_or_else(|| GatewayError::InvalidArgs(format!("unknown resolution: {resolution}")))?;
            let row = Ledger::resolve(&handle, meta_id, resolve_action)?;
            Ok(json!({ "resolved": row }))
        }
        other => Err(GatewayError::InvalidArgs(format!("unknown review action: {other}"))),
    }
}

/// Dispatches a tool by name, used by both the JSON-RPC `tools/call`
/// handler and the legacy `/mcp/call/:tool` REST shim.
pub async fn call_tool(state: &AppState, principal: &Principal, name: &str, args: Value) -> Result<Value, GatewayError> {
    match name {
        "memorize" => memorize(state, principal, args).await,
        "recall" => recall(state, principal, args).await,
        "review" => review(state, principal, args).await,
        other => {
            if let Some((translated, translated_args)) = translate_legacy(other, args) {
                return Box::pin(call_tool(state, principal, translated, translated_args)).await;
            }
            Err(GatewayError::UnknownTool(other.to_string()))
        }
    }
}

/// Translates a legacy alias into `(facade_tool_name, args)`. Returns
/// `None` for a name that is neither a facade tool nor a known alias.
pub fn translate_legacy(name: &str, args: Value) -> Option<(&'static str, Value)> {
    match name {
        "get_user_context" => Some(("recall", json!({ "mode": "context", "budget": args.get("budget").cloned() }))),
        "list_tables" => Some(("recall", json!({ "mode": "table" }))),
        "search_memory" => Some((
            "recall",
            json!({ "mode": "knowledge", "topic": args.get("query").or_else(|| args.get("topic")).cloned() }),
        )),
        "query_table" => Some((
            "recall",
            json!({
                "mode": "table",
                "table": args.get("table").cloned(),
                "budget": args.get("limit").cloned(),
                "offset": args.get("offset").cloned(),
            }),
        )),
        "query_graph" => Some((
            "recall",
            json!({ "mode": "knowledge", "topic": args.get("pattern").or_else(|| args.get("query")).cloned() }),
        )),
        "save_memory" => Some(("memorize", json!({ "text": args.get("text").cloned(), "category": args.get("category").cloned() }))),
        "update_profile" => Some(("memorize", json!({ "text": "profile update", "category": "profile", "data": args.get("data").or_else(|| args.get("patch")).cloned() }))),
        "add_record" => Some((
            "memorize",
            json!({ "text": "record", "category": args.get("table").cloned(), "data": args.get("data").cloned() }),
        )),
        "review_memories" => Some(("review", json!({ "action": "list" }))),
        _ => None,
    }
}
