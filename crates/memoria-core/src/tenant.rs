//! Tenant & Schema Manager (spec §4.1).
//!
//! Each tenant gets its own SQLite file under `{data_dir}/tenants/{namespace}.db`
//! instead of the source's per-tenant Postgres schema — filesystem separation is
//! a stronger guarantee of Invariant T1 (no query ever reaches across tenants)
//! than a shared connection with a runtime `search_path`.
//!
//! Mirrors the teacher's `ChronosSqlite` connection-per-call pattern: handles
//! are cheap, `rusqlite::Connection` is not `Send`-shared, so every operation
//! opens a fresh connection and the caller wraps blocking calls in
//! `tokio::task::spawn_blocking`.

use crate::error::TenantError;
use dashmap::DashMap;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Deterministic, hyphen-free namespace derived from a user id: `t_` + first 16
/// hex chars of SHA-256(user_id).
pub fn namespace_for(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("t_{}", &hex[..16])
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub namespace: String,
    pub tier: String,
    pub created_at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to one tenant's isolated SQLite file. Cheap to clone (just a path).
#[derive(Debug, Clone)]
pub struct TenantHandle {
    pub tenant_id: String,
    pub namespace: String,
    pub db_path: PathBuf,
}

impl TenantHandle {
    /// Opens a fresh connection bound to this tenant's file only.
    pub fn connect(&self) -> Result<Connection, TenantError> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }
}

/// Owns the shared tenant registry and a cache of provisioned tenant handles.
pub struct TenantManager {
    data_dir: PathBuf,
    registry_path: PathBuf,
    handles: DashMap<String, Arc<TenantHandle>>,
}

const SCHEMA_VERSION: i64 = 1;

const TENANT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER NOT NULL);

CREATE TABLE IF NOT EXISTS profile_versions (
    version INTEGER PRIMARY KEY,
    data TEXT NOT NULL,
    changed_by TEXT NOT NULL,
    changed_fields TEXT NOT NULL,
    changed_at_ms INTEGER NOT NULL,
    meta_ref INTEGER
);

CREATE TABLE IF NOT EXISTS table_registry (
    table_name TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    inferred_schema TEXT NOT NULL DEFAULT '[]',
    record_count INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS vector_collections (
    name TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    embedding_dim INTEGER,
    entry_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS vectors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    text TEXT NOT NULL,
    embedding TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at_ms INTEGER NOT NULL,
    deleted_at_ms INTEGER,
    meta_ref INTEGER
);
CREATE INDEX IF NOT EXISTS idx_vectors_collection ON vectors(collection);

CREATE TABLE IF NOT EXISTS pending_vectors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    text TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at_ms INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS memory_backlog (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    text TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    lower_name TEXT NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    confidence REAL NOT NULL DEFAULT 0.5,
    mention_count INTEGER NOT NULL DEFAULT 1,
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms INTEGER NOT NULL,
    deleted_at_ms INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_type_name ON entities(type, lower_name) WHERE deleted_at_ms IS NULL;
"#;

// Split into a second batch purely for readability; `lower_name` is a plain
// column (not a generated one) maintained by the graph module on every write,
// since the bundled SQLite build here targets 3.8+ compatibility rather than
// assuming generated-column support (added in 3.31).
const TENANT_SCHEMA_PART2: &str = r#"
CREATE TABLE IF NOT EXISTS edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES entities(id),
    target_id INTEGER NOT NULL REFERENCES entities(id),
    relation TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence TEXT NOT NULL DEFAULT '[]',
    properties TEXT NOT NULL DEFAULT '{}',
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms INTEGER NOT NULL,
    deleted_at_ms INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_edges_unique ON edges(source_id, target_id, relation);
CREATE INDEX IF NOT EXISTS idx_edges_traversal ON edges(source_id, relation, target_id);

CREATE TABLE IF NOT EXISTS memory_meta (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_type TEXT NOT NULL,
    source_ref TEXT NOT NULL UNIQUE,
    origin TEXT NOT NULL,
    agent_source TEXT,
    confidence REAL NOT NULL,
    status TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_ms INTEGER,
    last_reinforced_ms INTEGER,
    contradictions TEXT NOT NULL DEFAULT '[]',
    promote_history TEXT NOT NULL DEFAULT '[]',
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_meta_status ON memory_meta(status);

CREATE TABLE IF NOT EXISTS consent_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    resource TEXT NOT NULL,
    permission TEXT NOT NULL,
    granted_at_ms INTEGER NOT NULL,
    revoked_at_ms INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_consent_active ON consent_rules(agent_id, resource) WHERE revoked_at_ms IS NULL;

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT,
    action TEXT NOT NULL,
    resource TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '{}',
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS knowledge_claims (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    claim_type TEXT NOT NULL,
    subject TEXT NOT NULL,
    predicate TEXT NOT NULL,
    object TEXT NOT NULL,
    confidence REAL NOT NULL,
    method TEXT,
    origin TEXT NOT NULL,
    source_ref TEXT,
    agent_id TEXT,
    valid_from_ms INTEGER NOT NULL,
    valid_to_ms INTEGER,
    memory_meta_id INTEGER
);

CREATE TABLE IF NOT EXISTS claim_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    claim_id INTEGER NOT NULL REFERENCES knowledge_claims(id),
    from_status TEXT,
    to_status TEXT NOT NULL,
    at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS enrichment_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_kind TEXT NOT NULL,
    source_ref TEXT NOT NULL,
    meta_id INTEGER,
    write_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    processed_at_ms INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_enrichment_jobs_idempotent ON enrichment_jobs(meta_id, job_kind);
CREATE INDEX IF NOT EXISTS idx_enrichment_jobs_status ON enrichment_jobs(status);
"#;

impl TenantManager {
    pub fn new(data_dir: PathBuf) -> Result<Self, TenantError> {
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(data_dir.join("tenants"))?;
        let registry_path = data_dir.join("tenants.db");
        let conn = Connection::open(&registry_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL UNIQUE,
                tier TEXT NOT NULL DEFAULT 'free',
                created_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            data_dir,
            registry_path,
            handles: DashMap::new(),
        })
    }

    fn registry_conn(&self) -> Result<Connection, TenantError> {
        Ok(Connection::open(&self.registry_path)?)
    }

    /// Provisions a new tenant: registers it and runs DDL for its SQLite file.
    /// `embedding_dim` is recorded for the tenant's default "memories" collection,
    /// should the caller choose to pre-create one; the write pipeline also
    /// auto-creates collections lazily so this is advisory only.
    pub fn create_tenant(
        &self,
        user_id: &str,
        tier: &str,
        _embedding_dim: Option<u32>,
    ) -> Result<TenantRecord, TenantError> {
        let namespace = namespace_for(user_id);
        let conn = self.registry_conn()?;
        let exists: Option<String> = conn
            .query_row(
                "SELECT tenant_id FROM tenants WHERE tenant_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(TenantError::AlreadyExists(user_id.to_string()));
        }
        let created_at_ms = now_ms();
        conn.execute(
            "INSERT INTO tenants (tenant_id, namespace, tier, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, namespace, tier, created_at_ms],
        )?;

        let db_path = self.data_dir.join("tenants").join(format!("{namespace}.db"));
        let handle = TenantHandle {
            tenant_id: user_id.to_string(),
            namespace: namespace.clone(),
            db_path,
        };
        self.run_ddl(&handle)?;
        self.handles.insert(user_id.to_string(), Arc::new(handle));

        info!(tenant_id = user_id, namespace = %namespace, "tenant provisioned");
        Ok(TenantRecord {
            tenant_id: user_id.to_string(),
            namespace,
            tier: tier.to_string(),
            created_at_ms,
        })
    }

    fn run_ddl(&self, handle: &TenantHandle) -> Result<(), TenantError> {
        let conn = handle.connect()?;
        let applied: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0);
        if applied >= SCHEMA_VERSION {
            return Ok(());
        }
        conn.execute_batch(TENANT_SCHEMA)
            .map_err(|e| TenantError::DdlFailed(e.to_string()))?;
        conn.execute_batch(TENANT_SCHEMA_PART2)
            .map_err(|e| TenantError::DdlFailed(e.to_string()))?;
        conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Opens (provisioning if necessary) the handle for an existing tenant.
    pub fn tenant(&self, user_id: &str) -> Result<Arc<TenantHandle>, TenantError> {
        if let Some(h) = self.handles.get(user_id) {
            return Ok(Arc::clone(&h));
        }
        let conn = self.registry_conn()?;
        let namespace: Option<String> = conn
            .query_row(
                "SELECT namespace FROM tenants WHERE tenant_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        let namespace = namespace.ok_or_else(|| TenantError::NotFound(user_id.to_string()))?;
        let db_path = self.data_dir.join("tenants").join(format!("{namespace}.db"));
        let handle = Arc::new(TenantHandle {
            tenant_id: user_id.to_string(),
            namespace,
            db_path,
        });
        self.run_ddl(&handle)?;
        self.handles.insert(user_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Provisions the tenant on first use. Use this from request handlers that
    /// should never fail merely because the caller hasn't called `createTenant`
    /// explicitly (mirrors the source's lazy-provisioning behavior for new users).
    pub fn tenant_or_create(&self, user_id: &str) -> Result<Arc<TenantHandle>, TenantError> {
        match self.tenant(user_id) {
            Ok(h) => Ok(h),
            Err(TenantError::NotFound(_)) => {
                self.create_tenant(user_id, "free", None)?;
                self.tenant(user_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Binds `user_id`'s namespace for the duration of `f`, guaranteeing
    /// release on every exit path (the handle is just an `Arc`, so "release"
    /// is simply letting it drop — there is no connection-pool slot to return
    /// because each call opens its own connection).
    pub fn with_tenant<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&TenantHandle) -> Result<T, TenantError>,
    ) -> Result<T, TenantError> {
        let handle = self.tenant_or_create(user_id)?;
        f(&handle)
    }

    pub fn drop_tenant(&self, user_id: &str) -> Result<(), TenantError> {
        let conn = self.registry_conn()?;
        let namespace: Option<String> = conn
            .query_row(
                "SELECT namespace FROM tenants WHERE tenant_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        let namespace = namespace.ok_or_else(|| TenantError::NotFound(user_id.to_string()))?;
        conn.execute("DELETE FROM tenants WHERE tenant_id = ?1", params![user_id])?;
        self.handles.remove(user_id);
        let db_path = self.data_dir.join("tenants").join(format!("{namespace}.db"));
        let _ = std::fs::remove_file(&db_path);
        info!(tenant_id = user_id, "tenant dropped");
        Ok(())
    }

    /// All provisioned tenant ids, for background jobs (decay scan,
    /// pending-vector flush) that sweep across the whole installation
    /// rather than a single request's tenant.
    pub fn list_tenant_ids(&self) -> Result<Vec<String>, TenantError> {
        let conn = self.registry_conn()?;
        let mut stmt = conn.prepare("SELECT tenant_id FROM tenants ORDER BY tenant_id")?;
        let ids = stmt.query_map([], |r| r.get(0))?.collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, TenantManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TenantManager::new(dir.path().to_path_buf()).unwrap();
        (dir, mgr)
    }

    #[test]
    fn namespace_is_deterministic_hex_no_hyphens() {
        let a = namespace_for("user-123");
        let b = namespace_for("user-123");
        assert_eq!(a, b);
        assert!(!a.contains('-') || a.starts_with("t_"));
        assert!(a.chars().skip(2).all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn create_then_fetch_tenant_round_trips() {
        let (_dir, mgr) = manager();
        let rec = mgr.create_tenant("alice", "free", None).unwrap();
        let handle = mgr.tenant("alice").unwrap();
        assert_eq!(handle.namespace, rec.namespace);
        assert!(handle.db_path.exists() || handle.connect().is_ok());
    }

    #[test]
    fn duplicate_create_fails() {
        let (_dir, mgr) = manager();
        mgr.create_tenant("bob", "free", None).unwrap();
        let err = mgr.create_tenant("bob", "free", None);
        assert!(matches!(err, Err(TenantError::AlreadyExists(_))));
    }

    #[test]
    fn cross_tenant_rows_never_visible() {
        let (_dir, mgr) = manager();
        let a = mgr.tenant_or_create("tenant-a").unwrap();
        let b = mgr.tenant_or_create("tenant-b").unwrap();
        let conn_a = a.connect().unwrap();
        conn_a
            .execute(
                "INSERT INTO profile_versions (version, data, changed_by, changed_fields, changed_at_ms) VALUES (1, '{}', 'x', '[]', 0)",
                [],
            )
            .unwrap();
        let conn_b = b.connect().unwrap();
        let count: i64 = conn_b
            .query_row("SELECT COUNT(*) FROM profile_versions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0, "tenant B must never see tenant A's rows");
    }
}
