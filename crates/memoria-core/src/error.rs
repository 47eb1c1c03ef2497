//! Crate-local error types. Each subsystem gets its own `thiserror` enum so the
//! gateway can match on variant and map to the HTTP/JSON-RPC error taxonomy in
//! spec §7 without guessing from a string message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant already exists: {0}")]
    AlreadyExists(String),
    #[error("tenant not found: {0}")]
    NotFound(String),
    #[error("DDL failed: {0}")]
    DdlFailed(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("multiple statements are not allowed")]
    MultipleStatements,
    #[error("only SELECT (or WITH ... SELECT) queries are allowed, found: {0}")]
    NotReadOnly(String),
    #[error("schema-qualified reference is not allowed: {0}")]
    SchemaQualifiedReference(String),
    #[error("reference to system catalog is not allowed: {0}")]
    SystemCatalog(String),
    #[error("query exceeds the maximum allowed length ({0} bytes)")]
    TooLong(usize),
    #[error("query contains a disallowed identifier character")]
    InvalidIdentifier,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("memory_meta row not found: {0}")]
    NotFound(i64),
    #[error("invalid state transition for row {0}")]
    InvalidState(i64),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("identity conflict: patch would overwrite the identity field with a known family member name")]
    IdentityConflict,
    #[error("could not allocate a monotonic profile version after {0} retries")]
    VersionContention(u32),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum TablesError {
    #[error("invalid table identifier: {0}")]
    InvalidIdentifier(String),
    #[error("record not found in table {0}: {1}")]
    RecordNotFound(String, i64),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("entity not found: {0}")]
    EntityNotFound(i64),
    #[error("edge not found: {0}")]
    EdgeNotFound(i64),
    #[error("pattern not recognized: {0}")]
    PatternNotRecognized(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum ClaimsError {
    #[error("knowledge claim not found: {0}")]
    NotFound(i64),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("consent denied for resource {0}")]
    ConsentDenied(String),
    #[error("identity conflict: {0}")]
    IdentityConflict(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("invalid table or collection name: {0}")]
    InvalidCollection(String),
    #[error(transparent)]
    Tenant(#[from] TenantError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Tables(#[from] TablesError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("enrichment queue is full, job was dropped")]
    QueueFull,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors surfaced by an [`crate::vectors::EmbeddingProvider`].
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("embedding request timed out")]
    Timeout,
}
