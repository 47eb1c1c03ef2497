//! Rate-limit middleware (spec §4.8 step 4). Runs before every handler;
//! auth resolution happens twice (here and again in the handler's
//! `Principal` extractor) since [`crate::auth::resolve`] is a cheap,
//! side-effect-free DashMap lookup and keeping the two concerns separate
//! avoids threading a resolved principal through `Request` extensions.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::auth::{self, Principal, Tier};
use crate::errors::GatewayError;
use crate::state::AppState;

fn remote_ip(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let principal = match auth::resolve(&state, &parts) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let remote_ip = remote_ip(&parts.headers);
    let key = principal.rate_limit_key(&remote_ip);
    let capacity = principal.rate_limit_capacity(&state.config.rate_limit);
    let outcome = state.rate_limiter.check(&key, capacity);

    let mut response = if !outcome.allowed {
        GatewayError::RateLimitExceeded { retry_after_secs: outcome.retry_after_secs }.into_response()
    } else {
        next.run(Request::from_parts(parts, body)).await
    };

    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", header_value(outcome.limit));
    headers.insert("X-RateLimit-Remaining", header_value(outcome.remaining));
    headers.insert("X-RateLimit-Reset", header_value(60));
    response
}

fn header_value(n: u32) -> axum::http::HeaderValue {
    axum::http::HeaderValue::from_str(&n.to_string()).expect("digits are valid header bytes")
}

/// Payment gate (spec §4.8 step 5). Only a free-tier, agent-authenticated
/// caller is billable; a session principal (the tenant's own dashboard) and
/// paid/MCP API keys bypass the check entirely. `PaymentGate::authorize`
/// itself fails open, so a degraded or unreachable billing provider never
/// blocks a request; this layer just decides who it applies to.
pub async fn payment_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let principal = match auth::resolve(&state, &parts) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    if let Principal::ApiKey { tier: Tier::Free, tenant_id, .. } = &principal {
        let operation = parts.uri.path().to_string();
        if !state.payment_gate.authorize(tenant_id, &operation).await {
            return GatewayError::TierLimitExceeded(
                "free tier requires billing setup for this operation".to_string(),
            )
            .into_response();
        }
    }
    next.run(Request::from_parts(parts, body)).await
}
