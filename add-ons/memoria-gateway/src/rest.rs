//! REST surface (spec §6). Every handler returns `{data, meta?}` on success
//! via [`envelope`]/[`envelope_meta`]; failures are [`GatewayError`], which
//! already implements `IntoResponse` with the `{error:{...}}` shape.

use axum::extract::{Path, Query, State};
use axum::http::Method;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};

use memoria_core::consent::{Action, ConsentEngine};
use memoria_core::graph::{Direction, GraphStore};
use memoria_core::ingest::{IngestKind, IngestPipeline};
use memoria_core::ledger::{Ledger, Origin, ResolveAction, Status};
use memoria_core::profile::ProfileStore;
use memoria_core::sandbox;
use memoria_core::tables::TableStore;
use memoria_core::tenant::TenantHandle;
use memoria_core::vectors::VectorStore;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit;
use crate::auth::Principal;
use crate::errors::GatewayError;
use crate::state::AppState;

fn envelope(data: Value) -> Json<Value> {
    Json(json!({ "data": data }))
}

fn envelope_meta(data: Value, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

fn tenant_id(principal: &Principal) -> Result<&str, GatewayError> {
    principal.tenant_id().ok_or_else(|| GatewayError::Unauthorized("authentication required".to_string()))
}

async fn handle_for(state: &AppState, principal: &Principal) -> Result<std::sync::Arc<TenantHandle>, GatewayError> {
    Ok(state.tenants.tenant_or_create(tenant_id(principal)?)?)
}

fn require_session(principal: &Principal) -> Result<(), GatewayError> {
    if matches!(principal, Principal::Session { .. }) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden("this endpoint requires a dashboard session".to_string()))
    }
}

fn require_consent(handle: &TenantHandle, agent_id: &str, resource: &str, action: Action) -> Result<(), GatewayError> {
    if ConsentEngine::check(handle, agent_id, resource, action)? {
        Ok(())
    } else {
        Err(GatewayError::ConsentDenied(resource.to_string()))
    }
}

fn write_origin(principal: &Principal) -> Origin {
    if matches!(principal, Principal::Session { .. }) { Origin::UserStated } else { Origin::AiStated }
}

/// Agents may self-report a finer-grained origin than the principal-type
/// default (`ai_stated`) via `?origin=`, covering the `ai_inferred` /
/// `ai_pattern` / `imported` / `system` rows of the origin table in spec
/// §4.3 that no principal type implies on its own.
#[derive(Deserialize, Default)]
struct OriginParam {
    origin: Option<String>,
}

fn resolve_origin(principal: &Principal, raw: Option<&str>) -> Origin {
    raw.and_then(Origin::parse).unwrap_or_else(|| write_origin(principal))
}

#[derive(Deserialize, Default)]
pub struct PageParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// Strict CORS (known origins, credentials) for the session-only
/// dashboard endpoints (spec §4.8 step 1).
fn dashboard_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &axum::http::HeaderValue, _| {
            matches!(origin.to_str(), Ok("http://localhost:3000") | Ok("http://127.0.0.1:3000"))
        }))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

/// Permissive CORS (wildcard, no credentials) for agent/tool-facing
/// REST routes (spec §4.8 step 1).
fn tool_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

pub fn router() -> Router<AppState> {
    let dashboard = Router::new()
        .route("/v1/profile/history", get(profile_history))
        .route("/v1/memory/review", get(list_review))
        .route("/v1/consent/:agent", patch(update_consent))
        .route("/v1/activity", get(activity))
        .route("/v1/agents/:id", delete(remove_agent))
        .route("/v1/export", get(export))
        .layer(dashboard_cors());

    let agent_facing = Router::new()
        .route("/v1/profile", get(get_profile).patch(patch_profile))
        .route("/v1/tables", get(list_tables))
        .route("/v1/tables/:name/records", post(create_record))
        .route("/v1/tables/:name/query", post(query_table))
        .route("/v1/tables/:name/records/:id", patch(update_record).delete(delete_record))
        .route("/v1/vectors/:collection/add", post(vector_add))
        .route("/v1/vectors/:collection/search", post(vector_search))
        .route("/v1/graph/entities", get(list_entities))
        .route("/v1/graph/entities/:id", get(get_entity))
        .route("/v1/graph/entities/:id/neighbors", get(get_neighbors))
        .route("/v1/graph/traverse", post(graph_traverse))
        .route("/v1/graph/query", post(graph_query))
        .route("/v1/graph/pattern", post(graph_pattern))
        .route("/v1/graph/stats", get(graph_stats))
        .route("/v1/memory/review/:id/resolve", post(resolve_review))
        .route("/v1/memory/stats", get(memory_stats))
        .layer(tool_cors());

    dashboard.merge(agent_facing)
}

// ---- profile ----------------------------------------------------------

async fn get_profile(State(state): State<AppState>, principal: Principal) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "profile", Action::Read)?;
    let current = ProfileStore::current(&handle)?;
    if let Some(v) = &current {
        if let Some(meta_id) = v.meta_ref {
            let _ = Ledger::record_access(&handle, meta_id);
        }
    }
    audit::record(&handle, Some(principal.agent_id()), "read", "profile", json!({}));
    Ok(envelope(json!(current)))
}

async fn patch_profile(
    State(state): State<AppState>,
    principal: Principal,
    Query(origin_param): Query<OriginParam>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    let agent_id = principal.agent_id().to_string();
    let write_id = Uuid::new_v4().to_string();
    let result = IngestPipeline::ingest(
        &handle,
        &state.queue,
        state.embedding_provider.as_ref(),
        IngestKind::Profile,
        patch,
        resolve_origin(&principal, origin_param.origin.as_deref()),
        &agent_id,
        &agent_id,
        &write_id,
    )
    .await?;
    let current = ProfileStore::current(&handle)?;
    Ok(envelope_meta(json!(current), json!({ "writeStatus": result.write_status, "writeId": result.write_id })))
}

async fn profile_history(
    State(state): State<AppState>,
    principal: Principal,
    Query(page): Query<PageParams>,
) -> Result<Json<Value>, GatewayError> {
    require_session(&principal)?;
    let handle = handle_for(&state, &principal).await?;
    let history = ProfileStore::history(&handle, page.limit.unwrap_or(50), page.offset.unwrap_or(0))?;
    Ok(envelope(json!(history)))
}

// ---- tables -------------------------------------------------------------

async fn list_tables(State(state): State<AppState>, principal: Principal) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "tables", Action::Read)?;
    Ok(envelope(json!(TableStore::list_tables(&handle)?)))
}

async fn create_record(
    State(state): State<AppState>,
    principal: Principal,
    Path(name): Path<String>,
    Query(origin_param): Query<OriginParam>,
    Json(data): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    let agent_id = principal.agent_id().to_string();
    let write_id = Uuid::new_v4().to_string();
    let result = IngestPipeline::ingest(
        &handle,
        &state.queue,
        state.embedding_provider.as_ref(),
        IngestKind::TableRow { table: name.clone() },
        data,
        resolve_origin(&principal, origin_param.origin.as_deref()),
        &agent_id,
        &agent_id,
        &write_id,
    )
    .await?;
    let record = TableStore::get_record(&handle, &name, parse_record_id(&result.source_ref)?)?;
    Ok(envelope_meta(json!(record), json!({ "writeStatus": result.write_status })))
}

fn parse_record_id(source_ref: &str) -> Result<i64, GatewayError> {
    source_ref
        .rsplit(':')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| GatewayError::Internal(format!("malformed source_ref: {source_ref}")))
}

#[derive(Deserialize)]
struct QueryBody {
    query: String,
}

async fn query_table(
    State(state): State<AppState>,
    principal: Principal,
    Path(name): Path<String>,
    Json(body): Json<QueryBody>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), &format!("tables/{name}"), Action::Read)?;
    sandbox::validate(&body.query)?;
    let rows = run_readonly_query(&handle, &body.query)?;
    Ok(envelope(json!(rows)))
}

/// Executes a sandbox-validated, read-only query and turns each row into a
/// JSON object keyed by column name.
fn run_readonly_query(handle: &TenantHandle, query: &str) -> Result<Vec<Value>, GatewayError> {
    let conn = handle.connect().map_err(GatewayError::from)?;
    let mut stmt = conn.prepare(query).map_err(|e| GatewayError::SqlSandboxError(e.to_string()))?;
    let column_names: Vec<String> = stmt.column_names().into_iter().map(|s| s.to_string()).collect();
    let rows = stmt
        .query_map([], |row| {
            let mut obj = serde_json::Map::new();
            for (i, col) in column_names.iter().enumerate() {
                let value: Value = match row.get_ref(i)? {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(n) => json!(n),
                    rusqlite::types::ValueRef::Real(f) => json!(f),
                    rusqlite::types::ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
                    rusqlite::types::ValueRef::Blob(_) => Value::Null,
                };
                obj.insert(col.clone(), value);
            }
            Ok(Value::Object(obj))
        })
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(rows)
}

async fn update_record(
    State(state): State<AppState>,
    principal: Principal,
    Path((name, id)): Path<(String, i64)>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), &format!("tables/{name}"), Action::Write)?;
    let record = TableStore::update(&handle, &name, id, patch)?;
    audit::record(&handle, Some(principal.agent_id()), "update", &format!("tables/{name}"), json!({ "id": id }));
    Ok(envelope(json!(record)))
}

async fn delete_record(
    State(state): State<AppState>,
    principal: Principal,
    Path((name, id)): Path<(String, i64)>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), &format!("tables/{name}"), Action::Write)?;
    TableStore::soft_delete(&handle, &name, id)?;
    audit::record(&handle, Some(principal.agent_id()), "delete", &format!("tables/{name}"), json!({ "id": id }));
    Ok(envelope(json!({ "deleted": true })))
}

// ---- vectors -------------------------------------------------------------

#[derive(Deserialize)]
struct VectorAddBody {
    text: String,
    metadata: Option<Value>,
}

async fn vector_add(
    State(state): State<AppState>,
    principal: Principal,
    Path(collection): Path<String>,
    Query(origin_param): Query<OriginParam>,
    Json(body): Json<VectorAddBody>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    let agent_id = principal.agent_id().to_string();
    let write_id = Uuid::new_v4().to_string();
    let result = IngestPipeline::ingest(
        &handle,
        &state.queue,
        state.embedding_provider.as_ref(),
        IngestKind::MemoryText { collection },
        json!({ "text": body.text, "metadata": body.metadata.unwrap_or(Value::Null) }),
        resolve_origin(&principal, origin_param.origin.as_deref()),
        &agent_id,
        &agent_id,
        &write_id,
    )
    .await?;
    Ok(envelope(json!(result)))
}

#[derive(Deserialize)]
struct VectorSearchBody {
    text: String,
    limit: Option<usize>,
}

async fn vector_search(
    State(state): State<AppState>,
    principal: Principal,
    Path(collection): Path<String>,
    Json(body): Json<VectorSearchBody>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), &format!("vectors/{collection}"), Action::Read)?;
    if !state.embedding_provider.is_available().await {
        return Err(GatewayError::EmbeddingUnavailable);
    }
    let embedding = state.embedding_provider.embed(&body.text).await.map_err(|e| GatewayError::Internal(e.to_string()))?;
    let hits = VectorStore::search(&handle, &collection, &embedding, body.limit.unwrap_or(10))?;
    Ok(envelope(json!(hits
        .into_iter()
        .map(|(entry, score)| json!({ "entry": entry, "score": score }))
        .collect::<Vec<_>>())))
}

// ---- graph -------------------------------------------------------------

#[derive(Deserialize, Default)]
struct EntityListParams {
    #[serde(rename = "type")]
    entity_type: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    #[serde(rename = "edgeLimit")]
    edge_limit: Option<i64>,
    #[serde(rename = "stableMode")]
    stable_mode: Option<bool>,
    #[serde(rename = "stableConfidenceMin")]
    stable_confidence_min: Option<f64>,
}

async fn list_entities(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<EntityListParams>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "graph", Action::Read)?;
    let _ = params.edge_limit;
    let min_confidence = if params.stable_mode.unwrap_or(false) { params.stable_confidence_min.or(Some(0.70)) } else { None };
    let entities = GraphStore::list_entities(
        &handle,
        params.entity_type.as_deref(),
        min_confidence,
        None,
        params.limit.unwrap_or(50),
        params.offset.unwrap_or(0),
    )?;
    Ok(envelope(json!(entities)))
}

async fn get_entity(State(state): State<AppState>, principal: Principal, Path(id): Path<i64>) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "graph", Action::Read)?;
    Ok(envelope(json!(GraphStore::get_entity(&handle, id)?)))
}

#[derive(Deserialize, Default)]
struct NeighborParams {
    direction: Option<String>,
    relation: Option<String>,
    #[serde(rename = "confidenceMin")]
    confidence_min: Option<f64>,
}

fn parse_direction(s: Option<&str>) -> Direction {
    match s {
        Some("in") => Direction::In,
        Some("out") => Direction::Out,
        _ => Direction::Both,
    }
}

async fn get_neighbors(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    Query(params): Query<NeighborParams>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "graph", Action::Read)?;
    let neighbors = GraphStore::get_neighbors(
        &handle,
        id,
        parse_direction(params.direction.as_deref()),
        params.relation.as_deref(),
        params.confidence_min,
    )?;
    Ok(envelope(json!(neighbors
        .into_iter()
        .map(|(entity, edge)| json!({ "entity": entity, "edge": edge }))
        .collect::<Vec<_>>())))
}

#[derive(Deserialize)]
struct TraverseBody {
    #[serde(rename = "startId")]
    start_id: i64,
    #[serde(rename = "maxDepth")]
    max_depth: Option<u32>,
    relation: Option<String>,
    #[serde(rename = "entityType")]
    entity_type: Option<String>,
    #[serde(rename = "confidenceMin")]
    confidence_min: Option<f64>,
    limit: Option<usize>,
}

async fn graph_traverse(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<TraverseBody>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "graph", Action::Read)?;
    let entities = GraphStore::traverse(
        &handle,
        body.start_id,
        body.max_depth.unwrap_or(3),
        body.relation.as_deref(),
        body.entity_type.as_deref(),
        body.confidence_min,
        body.limit,
    )?;
    Ok(envelope(json!(entities)))
}

#[derive(Deserialize)]
struct GraphQueryBody {
    #[serde(rename = "fromId")]
    from_id: i64,
    #[serde(rename = "toId")]
    to_id: i64,
    #[serde(rename = "maxDepth")]
    max_depth: Option<u32>,
}

async fn graph_query(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<GraphQueryBody>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "graph", Action::Read)?;
    let path = GraphStore::path_between(&handle, body.from_id, body.to_id, body.max_depth.unwrap_or(6))?;
    Ok(envelope(json!({ "path": path })))
}

#[derive(Deserialize)]
struct GraphPatternBody {
    pattern: String,
}

async fn graph_pattern(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<GraphPatternBody>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "graph", Action::Read)?;
    let entities = GraphStore::query_pattern(&handle, &body.pattern)?;
    Ok(envelope(json!(entities)))
}

async fn graph_stats(State(state): State<AppState>, principal: Principal) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "graph", Action::Read)?;
    Ok(envelope(json!(GraphStore::stats(&handle)?)))
}

// ---- memory review / stats ----------------------------------------------

async fn list_review(
    State(state): State<AppState>,
    principal: Principal,
    Query(page): Query<PageParams>,
) -> Result<Json<Value>, GatewayError> {
    require_session(&principal)?;
    let handle = handle_for(&state, &principal).await?;
    let rows = Ledger::list_by_status(&handle, Status::Review, page.limit.unwrap_or(50), page.offset.unwrap_or(0))?;
    Ok(envelope(json!(rows)))
}

#[derive(Deserialize)]
struct ResolveBody {
    resolution: String,
}

async fn resolve_review(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    require_consent(&handle, principal.agent_id(), "memory/review", Action::Write)?;
    let action = ResolveAction::parse(&body.resolution)
        .ok_or_else(|| GatewayError::InvalidArgs(format!("unknown resolution: {}", body.resolution)))?;
    let row = Ledger::resolve(&handle, id, action)?;
    audit::record(&handle, Some(principal.agent_id()), "resolve", "memory/review", json!({ "id": id, "resolution": body.resolution }));
    Ok(envelope(json!(row)))
}

async fn memory_stats(State(state): State<AppState>, principal: Principal) -> Result<Json<Value>, GatewayError> {
    let handle = handle_for(&state, &principal).await?;
    let counts = Ledger::status_counts(&handle)?;
    Ok(envelope(json!(counts
        .into_iter()
        .map(|(status, count)| json!({ "status": status, "count": count }))
        .collect::<Vec<_>>())))
}

// ---- consent / activity / agents / export -------------------------------

#[derive(Deserialize)]
struct ConsentEntry {
    resource: String,
    permission: String,
}

#[derive(Deserialize)]
struct ConsentBody {
    permissions: Vec<ConsentEntry>,
}

const VALID_PERMISSIONS: [&str; 3] = ["read", "write", "none"];

/// A resource pattern is a `/`-delimited path of identifier segments,
/// optionally ending in the `*` wildcard segment (spec §4.2). Rejects
/// empty segments and the metacharacters the matcher treats literally
/// rather than silently storing an un-matchable rule.
fn valid_resource_pattern(resource: &str) -> bool {
    if resource.is_empty() {
        return false;
    }
    let segments: Vec<&str> = resource.split('/').collect();
    segments.iter().enumerate().all(|(i, seg)| {
        if i == segments.len() - 1 && *seg == "*" {
            return true;
        }
        !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

async fn update_consent(
    State(state): State<AppState>,
    principal: Principal,
    Path(agent): Path<String>,
    Json(body): Json<ConsentBody>,
) -> Result<Json<Value>, GatewayError> {
    require_session(&principal)?;
    for entry in &body.permissions {
        if !VALID_PERMISSIONS.contains(&entry.permission.as_str()) {
            return Err(GatewayError::InvalidArgs(format!("unknown permission: {}", entry.permission)));
        }
        if !valid_resource_pattern(&entry.resource) {
            return Err(GatewayError::InvalidArgs(format!("unknown resource: {}", entry.resource)));
        }
    }
    let handle = handle_for(&state, &principal).await?;
    let mut rules = Vec::with_capacity(body.permissions.len());
    for entry in &body.permissions {
        let rule = ConsentEngine::grant(&handle, &agent, &entry.resource, &entry.permission)?;
        audit::record(
            &handle,
            Some(principal.agent_id()),
            "consent_grant",
            &entry.resource,
            json!({ "agent": agent, "permission": entry.permission }),
        );
        rules.push(rule);
    }
    Ok(envelope(json!(rules)))
}

async fn activity(
    State(state): State<AppState>,
    principal: Principal,
    Query(page): Query<PageParams>,
) -> Result<Json<Value>, GatewayError> {
    require_session(&principal)?;
    let handle = handle_for(&state, &principal).await?;
    let conn = handle.connect().map_err(GatewayError::from)?;
    let mut stmt = conn.prepare(
        "SELECT id, agent_id, action, resource, details, created_at_ms FROM audit_log
         ORDER BY id DESC LIMIT ?1 OFFSET ?2",
    )?;
    let rows = stmt
        .query_map([page.limit.unwrap_or(100), page.offset.unwrap_or(0)], |r| {
            let details_str: String = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "agentId": r.get::<_, Option<String>>(1)?,
                "action": r.get::<_, String>(2)?,
                "resource": r.get::<_, String>(3)?,
                "details": serde_json::from_str::<Value>(&details_str).unwrap_or(Value::Null),
                "createdAtMs": r.get::<_, i64>(5)?,
            }))
        })
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(envelope(json!(rows)))
}

async fn remove_agent(State(state): State<AppState>, principal: Principal, Path(agent): Path<String>) -> Result<Json<Value>, GatewayError> {
    require_session(&principal)?;
    let handle = handle_for(&state, &principal).await?;
    let revoked = ConsentEngine::revoke_all_for_agent(&handle, &agent)?;
    audit::record(&handle, Some(principal.agent_id()), "agent_removed", &agent, json!({ "revokedRules": revoked }));
    Ok(envelope(json!({ "agentId": agent, "revokedRules": revoked })))
}

async fn export(State(state): State<AppState>, principal: Principal) -> Result<Json<Value>, GatewayError> {
    require_session(&principal)?;
    let handle = handle_for(&state, &principal).await?;
    let profile = ProfileStore::current(&handle)?;
    let tables = TableStore::list_tables(&handle)?;
    let entities = GraphStore::list_entities(&handle, None, None, None, 10_000, 0)?;
    let graph_stats = GraphStore::stats(&handle)?;
    audit::record(&handle, Some(principal.agent_id()), "export", "account", json!({}));
    Ok(envelope(json!({
        "profile": profile,
        "tables": tables,
        "entities": entities,
        "graphStats": graph_stats,
    })))
}
