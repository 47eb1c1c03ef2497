//! Gateway error taxonomy (spec §7) and its HTTP envelope.
//!
//! Every crate-local error from `memoria-core` is mapped here by variant,
//! never by matching on a string message, so the `{error:{code,message,
//! retryAfter?}}` body stays accurate as the core's error types evolve.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use memoria_core::error::{
    ConsentError, EnrichmentError, GraphError, IngestError, LedgerError, ProfileError,
    SandboxError, TablesError, TenantError,
};
use serde::Serialize;

#[derive(Debug)]
pub enum GatewayError {
    Unauthorized(String),
    InvalidSession,
    SessionExpired,
    ConsentDenied(String),
    Forbidden(String),
    FeatureDisabled(String),
    LegacyEndpointDisabled,
    BadRequest(String),
    InvalidArgs(String),
    InvalidCollection(String),
    SqlSandboxError(String),
    IdentityConflict(String),
    InvalidState(String),
    NotFound(String),
    UnknownTool(String),
    PatternNotRecognized(String),
    TierLimitExceeded(String),
    RateLimitExceeded { retry_after_secs: u64 },
    PayloadTooLarge,
    EmbeddingUnavailable,
    Internal(String),
}

impl GatewayError {
    fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::InvalidSession => "INVALID_SESSION",
            GatewayError::SessionExpired => "SESSION_EXPIRED",
            GatewayError::ConsentDenied(_) => "CONSENT_DENIED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::FeatureDisabled(_) => "FEATURE_DISABLED",
            GatewayError::LegacyEndpointDisabled => "LEGACY_ENDPOINT_DISABLED",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::InvalidArgs(_) => "INVALID_ARGS",
            GatewayError::InvalidCollection(_) => "INVALID_COLLECTION",
            GatewayError::SqlSandboxError(_) => "SQL_SANDBOX_ERROR",
            GatewayError::IdentityConflict(_) => "IDENTITY_CONFLICT",
            GatewayError::InvalidState(_) => "INVALID_STATE",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::UnknownTool(_) => "UNKNOWN_TOOL",
            GatewayError::PatternNotRecognized(_) => "PATTERN_NOT_RECOGNIZED",
            GatewayError::TierLimitExceeded(_) => "TIER_LIMIT_EXCEEDED",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayError::EmbeddingUnavailable => "EMBEDDING_UNAVAILABLE",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) | GatewayError::InvalidSession | GatewayError::SessionExpired => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::ConsentDenied(_) | GatewayError::Forbidden(_) | GatewayError::FeatureDisabled(_) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::LegacyEndpointDisabled => StatusCode::GONE,
            GatewayError::BadRequest(_)
            | GatewayError::InvalidArgs(_)
            | GatewayError::InvalidCollection(_)
            | GatewayError::SqlSandboxError(_) => StatusCode::BAD_REQUEST,
            GatewayError::IdentityConflict(_) | GatewayError::InvalidState(_) => StatusCode::CONFLICT,
            GatewayError::NotFound(_) | GatewayError::PatternNotRecognized(_) | GatewayError::UnknownTool(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::TierLimitExceeded(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::EmbeddingUnavailable => StatusCode::OK,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::Unauthorized(m) => m.clone(),
            GatewayError::InvalidSession => "session cookie is invalid".to_string(),
            GatewayError::SessionExpired => "session has expired".to_string(),
            GatewayError::ConsentDenied(resource) => format!("consent denied for resource {resource}"),
            GatewayError::Forbidden(m) => m.clone(),
            GatewayError::FeatureDisabled(m) => m.clone(),
            GatewayError::LegacyEndpointDisabled => "legacy endpoint is disabled".to_string(),
            GatewayError::BadRequest(m) => m.clone(),
            GatewayError::InvalidArgs(m) => m.clone(),
            GatewayError::InvalidCollection(m) => m.clone(),
            GatewayError::SqlSandboxError(m) => m.clone(),
            GatewayError::IdentityConflict(m) => m.clone(),
            GatewayError::InvalidState(m) => m.clone(),
            GatewayError::NotFound(m) => m.clone(),
            GatewayError::UnknownTool(name) => format!("unknown tool: {name}"),
            GatewayError::PatternNotRecognized(m) => m.clone(),
            GatewayError::TierLimitExceeded(m) => m.clone(),
            GatewayError::RateLimitExceeded { .. } => "rate limit exceeded".to_string(),
            GatewayError::PayloadTooLarge => "payload too large".to_string(),
            GatewayError::EmbeddingUnavailable => "embedding provider unavailable, write is pending".to_string(),
            GatewayError::Internal(_) => "internal error".to_string(),
        }
    }

    /// `(code, message)` for transports that don't build a full axum
    /// `Response`, e.g. a JSON-RPC `tools/call` result.
    pub fn to_error_body(&self) -> (&'static str, String) {
        (self.code(), self.message())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(detail) = &self {
            tracing::error!(%detail, "uncaught gateway error");
        }
        let retry_after = match &self {
            GatewayError::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let status = self.status();
        let body = ErrorEnvelope {
            error: ErrorBody { code: self.code(), message: self.message(), retry_after },
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<TenantError> for GatewayError {
    fn from(e: TenantError) -> Self {
        match e {
            TenantError::NotFound(id) => GatewayError::NotFound(format!("tenant not found: {id}")),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<ConsentError> for GatewayError {
    fn from(e: ConsentError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl From<SandboxError> for GatewayError {
    fn from(e: SandboxError) -> Self {
        GatewayError::SqlSandboxError(e.to_string())
    }
}

impl From<LedgerError> for GatewayError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(id) => GatewayError::NotFound(format!("memory_meta row not found: {id}")),
            LedgerError::InvalidState(id) => GatewayError::InvalidState(format!("row {id} is not in review")),
            LedgerError::Sqlite(inner) => GatewayError::Internal(inner.to_string()),
        }
    }
}

impl From<ProfileError> for GatewayError {
    fn from(e: ProfileError) -> Self {
        match e {
            ProfileError::IdentityConflict => GatewayError::IdentityConflict(e.to_string()),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<TablesError> for GatewayError {
    fn from(e: TablesError) -> Self {
        match e {
            TablesError::InvalidIdentifier(name) => GatewayError::InvalidCollection(name),
            TablesError::RecordNotFound(table, id) => {
                GatewayError::NotFound(format!("record {id} not found in table {table}"))
            }
            TablesError::Sqlite(inner) => GatewayError::Internal(inner.to_string()),
        }
    }
}

impl From<GraphError> for GatewayError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::EntityNotFound(id) => GatewayError::NotFound(format!("entity not found: {id}")),
            GraphError::EdgeNotFound(id) => GatewayError::NotFound(format!("edge not found: {id}")),
            GraphError::PatternNotRecognized(p) => GatewayError::PatternNotRecognized(p),
            GraphError::Sqlite(inner) => GatewayError::Internal(inner.to_string()),
        }
    }
}

impl From<EnrichmentError> for GatewayError {
    fn from(e: EnrichmentError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl From<IngestError> for GatewayError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::ConsentDenied(resource) => GatewayError::ConsentDenied(resource),
            IngestError::IdentityConflict(msg) => GatewayError::IdentityConflict(msg),
            IngestError::InvalidArgs(msg) => GatewayError::InvalidArgs(msg),
            IngestError::InvalidCollection(name) => GatewayError::InvalidCollection(name),
            IngestError::Tenant(inner) => inner.into(),
            IngestError::Ledger(inner) => inner.into(),
            IngestError::Profile(inner) => inner.into(),
            IngestError::Tables(inner) => inner.into(),
            IngestError::Sqlite(inner) => GatewayError::Internal(inner.to_string()),
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Internal(e.to_string())
    }
}
