//! Gateway entry point: wires the REST surface, the JSON-RPC tool-call
//! transport, and the shared middleware stack (spec §4.8) into one axum
//! `Router`.

mod adapters;
mod audit;
mod auth;
mod errors;
mod facade;
mod middleware;
mod payment;
mod rate_limit;
mod rest;
mod rpc;
mod state;

use axum::extract::{Path, State};
use axum::middleware as axum_middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::timeout::TimeoutLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use memoria_core::config::Config;
use memoria_core::enrichment::{EnrichmentQueue, EnrichmentWorker};

use crate::auth::Principal;
use crate::errors::GatewayError;
use crate::middleware::{payment_gate, rate_limit};
use crate::state::AppState;

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `/mcp/call/:tool` legacy REST shim (spec §6), gated by
/// `MCP_ENABLE_LEGACY_REST_ENDPOINTS`. Returns `410 Gone` when disabled.
async fn legacy_call(
    State(state): State<AppState>,
    principal: Principal,
    Path(tool): Path<String>,
    Json(args): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    if !state.config.legacy_rest_endpoints_enabled {
        return Err(GatewayError::LegacyEndpointDisabled);
    }
    let result = facade::call_tool(&state, &principal, &tool, args).await?;
    Ok(Json(json!({ "data": result })))
}

/// Drains enrichment jobs for every known tenant each time the queue
/// signals, plus a periodic sweep so a signal dropped under backpressure
/// (spec §5) still gets picked up. Runs for the life of the process; the
/// standalone daemon (`memoria-daemon`) additionally sweeps ledger decay
/// and pending vectors independently of this signal.
async fn run_enrichment_listener(state: AppState, mut rx: tokio::sync::mpsc::Receiver<()>) {
    let mut ticker = tokio::time::interval(state.config.tick_rate);
    loop {
        tokio::select! {
            signal = rx.recv() => {
                if signal.is_none() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }
        let Ok(tenant_ids) = state.tenants.list_tenant_ids() else { continue };
        for tenant_id in tenant_ids {
            let Ok(handle) = state.tenants.tenant(&tenant_id) else { continue };
            if let Err(e) = EnrichmentWorker::drain(&handle, state.embedding_provider.as_ref(), 50).await {
                tracing::warn!(%tenant_id, error = %e, "enrichment drain failed");
            }
        }
    }
}

fn build_app(state: AppState) -> Router {
    let deadline = state.config.request_deadline();
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(rpc::handle))
        .route("/chatgpt-mcp", post(rpc::handle))
        .route("/mcp/call/:tool", post(legacy_call))
        .merge(rest::router())
        .layer(axum_middleware::from_fn_with_state(state.clone(), payment_gate))
        .layer(axum_middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(TimeoutLayer::new(deadline))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("no .env file loaded: {e} (using process environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into())))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load();
    std::fs::create_dir_all(config.data_dir.join("tenants")).expect("create data dir");

    let (queue, rx) = EnrichmentQueue::new();
    let state = AppState::new(config, queue).expect("initialize application state");

    tokio::spawn(run_enrichment_listener(state.clone(), rx));

    let addr = std::env::var("MEMORIA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("bind listener");
    tracing::info!(%addr, "memoria gateway listening");

    let app = build_app(state);
    axum::serve(listener, app).await.expect("server error");
}

/// End-to-end scenarios from spec §8, driving the real `axum::Router`
/// in-process via `tower::ServiceExt::oneshot` rather than a live socket,
/// following the teacher's `tower = { features = ["util"] }` dev-dependency.
#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use memoria_core::config::RateLimitConfig;
    use memoria_core::consent::ConsentEngine;
    use memoria_core::ledger::Ledger;
    use memoria_core::profile::ProfileStore;
    use std::time::Duration as StdDuration;
    use tower::ServiceExt;

    use crate::auth::{ApiKeyRecord, SessionRecord, Tier};

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            app_env: "test".to_string(),
            data_dir: dir.to_path_buf(),
            session_secret: None,
            embedding_provider_key: None,
            legacy_rest_endpoints_enabled: false,
            legacy_tool_translation_enabled: true,
            load_tests_enabled: false,
            rate_limit: RateLimitConfig::default(),
            tick_rate: StdDuration::from_secs(3600),
        }
    }

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _rx) = EnrichmentQueue::new();
        let state = AppState::new(test_config(dir.path()), queue).unwrap();
        (dir, state)
    }

    /// Registers a session token bound to `tenant_id` and grants the
    /// "user" agent read+write on `resource` (the human owner of a tenant
    /// still goes through the same consent plumbing an agent would).
    fn seed_session(state: &AppState, tenant_id: &str, token: &str, resources: &[&str]) {
        let handle = state.tenants.tenant_or_create(tenant_id).unwrap();
        for resource in resources {
            ConsentEngine::grant(&handle, "user", resource, "write").unwrap();
        }
        state.auth.register_session(
            token,
            SessionRecord { tenant_id: tenant_id.to_string(), expires_at_ms: i64::MAX },
        );
    }

    fn seed_api_key(state: &AppState, tenant_id: &str, agent_id: &str, token: &str, resources: &[&str]) {
        let handle = state.tenants.tenant_or_create(tenant_id).unwrap();
        for resource in resources {
            ConsentEngine::grant(&handle, agent_id, resource, "write").unwrap();
        }
        state.auth.register_api_key(
            token,
            ApiKeyRecord { tenant_id: tenant_id.to_string(), agent_id: agent_id.to_string(), tier: Tier::Free },
        );
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    fn session_request(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, format!("memoria_session={token}"))
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn bearer_request(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    /// Scenario 1 (spec §8): contradicting a trusted profile field moves
    /// both facts to `review`; confirming one promotes it to `trusted`.
    #[tokio::test]
    async fn contradiction_then_review_then_resolve() {
        let (_dir, state) = test_state();
        seed_session(&state, "scenario1", "tok1", &["profile", "memory/review"]);
        let app = build_app(state.clone());

        let res = app
            .clone()
            .oneshot(session_request("PATCH", "/v1/profile", "tok1", json!({ "name": "Alice" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(session_request("PATCH", "/v1/profile", "tok1", json!({ "name": "Bob" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(session_request("GET", "/v1/memory/review", "tok1", Value::Null))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 2, "both the prior and the contradicting fact move to review");
        for row in rows {
            assert_eq!(row["status"], "review");
        }
        let target_id = rows[0]["id"].as_i64().unwrap();

        let res = app
            .clone()
            .oneshot(session_request(
                "POST",
                &format!("/v1/memory/review/{target_id}/resolve"),
                "tok1",
                json!({ "resolution": "confirm" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["data"]["status"], "trusted");
        let confidence = body["data"]["confidence"].as_f64().unwrap();
        assert!((confidence - 0.95).abs() < 1e-9);
    }

    /// Scenario 2 (spec §8): an `ai_inferred` fact starts `unvetted` and
    /// is promoted to `active` after enough reinforcing reads.
    #[tokio::test]
    async fn reinforcement_promotes_ai_inferred_to_active() {
        let (_dir, state) = test_state();
        seed_api_key(&state, "scenario2", "agent-1", "key2", &["profile"]);
        let app = build_app(state.clone());

        let res = app
            .clone()
            .oneshot(bearer_request("PATCH", "/v1/profile?origin=ai_inferred", "key2", json!({ "nickname": "runner" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        for _ in 0..5 {
            let res = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("GET")
                        .uri("/v1/profile")
                        .header(header::AUTHORIZATION, "Bearer key2")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }

        let handle = state.tenants.tenant_or_create("scenario2").unwrap();
        let current = ProfileStore::current(&handle).unwrap().unwrap();
        let meta = Ledger::get(&handle, current.meta_ref.unwrap()).unwrap();
        assert!(meta.access_count > 0, "access_count must increase on every read");
        assert!(meta.confidence >= 0.50);
        assert_eq!(meta.status, "active");
    }

    /// Scenario 3 (spec §8): a patch that would overwrite the identity
    /// field with a known family member's name is rejected with 409.
    #[tokio::test]
    async fn family_member_identity_guard_returns_409() {
        let (_dir, state) = test_state();
        seed_session(&state, "scenario3", "tok3", &["profile"]);
        let app = build_app(state.clone());

        let res = app
            .clone()
            .oneshot(session_request(
                "PATCH",
                "/v1/profile",
                "tok3",
                json!({ "family": [{ "name": "Georgia", "relation": "daughter" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(session_request("PATCH", "/v1/profile", "tok3", json!({ "name": "Georgia" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        let body = json_body(res).await;
        let message = body["error"]["message"].as_str().unwrap().to_lowercase();
        assert!(message.contains("identity"));
    }

    /// Scenario 4 (spec §8): the SQL sandbox allows a plain `SELECT` and
    /// rejects DDL/DML and catalog references.
    #[tokio::test]
    async fn sql_sandbox_allows_select_and_blocks_everything_else() {
        let (_dir, state) = test_state();
        seed_api_key(&state, "scenario4", "agent-1", "key4", &["tables/workouts"]);
        let app = build_app(state.clone());

        let res = app
            .clone()
            .oneshot(bearer_request(
                "POST",
                "/v1/tables/workouts/records",
                "key4",
                json!({ "type": "run", "minutes": 30 }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(bearer_request(
                "POST",
                "/v1/tables/workouts/query",
                "key4",
                json!({ "query": "SELECT * FROM workouts" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        for blocked in [
            "DROP TABLE workouts",
            "DELETE FROM workouts",
            "SELECT * FROM pg_tables",
            "SELECT * FROM user_xxx.profile",
        ] {
            let res = app
                .clone()
                .oneshot(bearer_request("POST", "/v1/tables/workouts/query", "key4", json!({ "query": blocked })))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "expected {blocked} to be rejected");
            let body = json_body(res).await;
            assert_eq!(body["error"]["code"], "SQL_SANDBOX_ERROR");
        }
    }

    /// Scenario 6 (spec §8): the 21st unauthenticated request within a
    /// minute is rate-limited with a `Retry-After` header in `[1, 300]`.
    #[tokio::test]
    async fn unauth_rate_limit_returns_429_with_retry_after() {
        let (_dir, state) = test_state();
        let app = build_app(state);

        let mut last = None;
        for _ in 0..21 {
            let res = app.clone().oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
            last = Some(res);
        }
        let res = last.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = res
            .headers()
            .get(header::RETRY_AFTER)
            .expect("429 must carry a Retry-After header")
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=300).contains(&retry_after));
    }

    struct DenyGate;

    #[async_trait::async_trait]
    impl crate::payment::PaymentGate for DenyGate {
        async fn authorize(&self, _tenant_id: &str, _operation: &str) -> bool {
            false
        }
    }

    /// Spec §4.8 step 5: a free-tier API key is subject to the payment
    /// gate, so a denying gate blocks the request before it reaches the
    /// handler.
    #[tokio::test]
    async fn payment_gate_blocks_free_tier_when_provider_denies() {
        let (_dir, mut state) = test_state();
        seed_api_key(&state, "alice", "agent-1", "key-1", &["profile"]);
        state.payment_gate = std::sync::Arc::new(DenyGate);
        let app = build_app(state);

        let req = bearer_request("GET", "/v1/profile", "key-1", Value::Null);
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    /// A session principal (the tenant's own dashboard) is never routed
    /// through the payment gate, even when a denying gate is installed.
    #[tokio::test]
    async fn payment_gate_does_not_apply_to_session_principals() {
        let (_dir, mut state) = test_state();
        seed_session(&state, "alice", "sess-1", &["profile"]);
        state.payment_gate = std::sync::Arc::new(DenyGate);
        let app = build_app(state);

        let req = session_request("GET", "/v1/profile", "sess-1", Value::Null);
        let res = app.oneshot(req).await.unwrap();
        assert_ne!(res.status(), StatusCode::FORBIDDEN);
    }
}
