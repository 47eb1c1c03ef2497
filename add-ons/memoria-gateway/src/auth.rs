//! Auth resolver (spec §4.8 step 2): session cookie or bearer API key,
//! both compared by SHA-256 digest so the registry never stores secrets
//! in the clear. Issuance (login, key minting) is out of scope here —
//! the teacher's own dashboard/OAuth layer owns that; this module only
//! verifies tokens a caller already holds, generalizing the teacher's
//! single `X-API-Key`-or-`Bearer` header check into a two-scheme lookup.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::errors::GatewayError;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub tenant_id: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub tenant_id: String,
    pub agent_id: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Paid,
    Mcp,
}

pub struct AuthRegistry {
    sessions: DashMap<String, SessionRecord>,
    api_keys: DashMap<String, ApiKeyRecord>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self { sessions: DashMap::new(), api_keys: DashMap::new() }
    }

    pub fn hash(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        hex::encode(digest)
    }

    pub fn register_session(&self, token: &str, record: SessionRecord) {
        self.sessions.insert(Self::hash(token), record);
    }

    pub fn register_api_key(&self, token: &str, record: ApiKeyRecord) {
        self.api_keys.insert(Self::hash(token), record);
    }

    pub fn revoke_session(&self, token: &str) {
        self.sessions.remove(&Self::hash(token));
    }

    fn resolve_session(&self, token: &str) -> Option<SessionRecord> {
        self.sessions.get(&Self::hash(token)).map(|r| r.clone())
    }

    fn resolve_api_key(&self, token: &str) -> Option<ApiKeyRecord> {
        self.api_keys.get(&Self::hash(token)).map(|r| r.clone())
    }
}

impl Default for AuthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal hex encoder so the auth module doesn't need a whole extra crate
/// just to stringify a SHA-256 digest.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut s = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            write!(s, "{b:02x}").unwrap();
        }
        s
    }
}

#[derive(Debug, Clone)]
pub enum Principal {
    Session { tenant_id: String },
    ApiKey { tenant_id: String, agent_id: String, tier: Tier },
    Unauthenticated,
}

impl Principal {
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Principal::Session { tenant_id } => Some(tenant_id),
            Principal::ApiKey { tenant_id, .. } => Some(tenant_id),
            Principal::Unauthenticated => None,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Principal::Session { .. } => "user",
            Principal::ApiKey { agent_id, .. } => agent_id,
            Principal::Unauthenticated => "anonymous",
        }
    }

    pub fn rate_limit_key(&self, remote_ip: &str) -> String {
        match self {
            Principal::Session { tenant_id } => format!("session:{tenant_id}"),
            Principal::ApiKey { tenant_id, agent_id, .. } => format!("key:{tenant_id}:{agent_id}"),
            Principal::Unauthenticated => format!("ip:{remote_ip}"),
        }
    }

    pub fn rate_limit_capacity(&self, cfg: &memoria_core::config::RateLimitConfig) -> u32 {
        match self {
            Principal::Session { .. } => cfg.paid_per_min,
            Principal::ApiKey { tier: Tier::Mcp, .. } => cfg.mcp_per_min,
            Principal::ApiKey { tier: Tier::Paid, .. } => cfg.paid_per_min,
            Principal::ApiKey { tier: Tier::Free, .. } => cfg.free_per_min,
            Principal::Unauthenticated => cfg.unauth_per_min,
        }
    }
}

const SESSION_COOKIE_NAME: &str = "memoria_session";

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|s| s.trim().to_string())
}

fn api_key_header(parts: &Parts) -> Option<String> {
    parts.headers.get("X-API-Key").and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

fn session_cookie(parts: &Parts) -> Option<String> {
    let raw = parts.headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|kv| {
        let (k, v) = kv.trim().split_once('=')?;
        (k == SESSION_COOKIE_NAME).then(|| v.to_string())
    })
}

/// Resolves a `Principal` out of cookie/header state without rejecting
/// the request: unauthenticated callers still reach rate-limited public
/// routes (spec §4.8), individual handlers decide whether `Unauthenticated`
/// is acceptable for that route.
pub fn resolve(state: &AppState, parts: &Parts) -> Result<Principal, GatewayError> {
    if let Some(cookie) = session_cookie(parts) {
        let record = state.auth.resolve_session(&cookie).ok_or(GatewayError::InvalidSession)?;
        let now = chrono::Utc::now().timestamp_millis();
        if record.expires_at_ms < now {
            return Err(GatewayError::SessionExpired);
        }
        return Ok(Principal::Session { tenant_id: record.tenant_id });
    }
    if let Some(key) = bearer_token(parts).or_else(|| api_key_header(parts)) {
        let record = state
            .auth
            .resolve_api_key(&key)
            .ok_or_else(|| GatewayError::Unauthorized("invalid API key".to_string()))?;
        return Ok(Principal::ApiKey {
            tenant_id: record.tenant_id,
            agent_id: record.agent_id,
            tier: record.tier,
        });
    }
    Ok(Principal::Unauthenticated)
}

pub struct RequirePrincipal(pub Principal);

#[async_trait::async_trait]
impl FromRequestParts<AppState> for RequirePrincipal {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let principal = resolve(state, parts)?;
        if matches!(principal, Principal::Unauthenticated) {
            return Err(GatewayError::Unauthorized("authentication required".to_string()));
        }
        Ok(RequirePrincipal(principal))
    }
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        resolve(state, parts)
    }
}
