//! Dynamic table registry (spec §3, §4.5 step 3).
//!
//! Agents may create arbitrary tables simply by naming them in a write. A
//! registry entry is created on first insert and column types are inferred
//! from the first observed value per field (text, integer, real, boolean,
//! date), then only ever *extended* — never narrowed — as later inserts
//! reveal a wider type. Physical rows are stored schemaless (an `id` +
//! timestamps envelope around a JSON `data` blob) since agent payloads are
//! duck-typed (spec §9): SQLite's own dynamic typing makes a `TEXT` column
//! per physical row sufficient, and `inferred_schema` is the only place the
//! per-column type story is tracked.

use crate::error::TablesError;
use crate::tenant::TenantHandle;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Integer,
    Real,
    Date,
    Text,
}

impl ColumnType {
    fn as_str(self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Date => "date",
            ColumnType::Text => "text",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "boolean" => ColumnType::Boolean,
            "integer" => ColumnType::Integer,
            "real" => ColumnType::Real,
            "date" => ColumnType::Date,
            _ => ColumnType::Text,
        }
    }

    /// Widens `self` toward `other` if `other` cannot be represented by
    /// `self`'s type; types only ever widen, matching the registry's
    /// "extended, never narrowed" contract. `Text` is the universal
    /// supertype.
    fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        if self == other {
            return self;
        }
        match (self, other) {
            (Integer, Real) | (Real, Integer) => Real,
            (Boolean, Integer) | (Integer, Boolean) => Integer,
            _ => Text,
        }
    }
}

fn infer_type(value: &Value) -> ColumnType {
    match value {
        Value::Bool(_) => ColumnType::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
        Value::Number(_) => ColumnType::Real,
        Value::String(s) if looks_like_date(s) => ColumnType::Date,
        _ => ColumnType::Text,
    }
}

fn looks_like_date(s: &str) -> bool {
    s.len() >= 10
        && s.as_bytes()[4] == b'-'
        && s.as_bytes()[7] == b'-'
        && s[0..4].chars().all(|c| c.is_ascii_digit())
        && s[5..7].chars().all(|c| c.is_ascii_digit())
        && s[8..10].chars().all(|c| c.is_ascii_digit())
}

static IDENTIFIER: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,63}$").unwrap());

/// `true` when `name` is safe to use as a table or column identifier: a
/// bounded alphanumeric/underscore token starting with a letter or
/// underscore, rejecting anything that could escape a quoted identifier.
pub fn is_safe_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub table_name: String,
    pub description: String,
    pub inferred_schema: Vec<ColumnSchema>,
    pub record_count: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub id: i64,
    pub table_name: String,
    pub data: Value,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub meta_ref: Option<i64>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct TableStore;

impl TableStore {
    pub fn get_table(handle: &TenantHandle, table_name: &str) -> Result<Option<TableInfo>, TablesError> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        Self::get_table_conn(&conn, table_name)
    }

    fn get_table_conn(conn: &rusqlite::Connection, table_name: &str) -> Result<Option<TableInfo>, TablesError> {
        conn.query_row(
            "SELECT table_name, description, inferred_schema, record_count, created_at_ms, updated_at_ms
             FROM table_registry WHERE table_name = ?1",
            params![table_name],
            row_to_table_info,
        )
        .optional()
        .map_err(TablesError::from)
    }

    pub fn list_tables(handle: &TenantHandle) -> Result<Vec<TableInfo>, TablesError> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let mut stmt = conn.prepare(
            "SELECT table_name, description, inferred_schema, record_count, created_at_ms, updated_at_ms
             FROM table_registry ORDER BY table_name",
        )?;
        let rows = stmt.query_map([], row_to_table_info)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Creates the registry entry and backing physical table if absent.
    /// Idempotent: a second call against an existing table is a no-op.
    fn ensure_table(conn: &rusqlite::Connection, table_name: &str) -> Result<(), TablesError> {
        if !is_safe_identifier(table_name) {
            return Err(TablesError::InvalidIdentifier(table_name.to_string()));
        }
        let ts = now_ms();
        conn.execute(
            "INSERT INTO table_registry (table_name, description, inferred_schema, record_count, created_at_ms, updated_at_ms)
             VALUES (?1, '', '[]', 0, ?2, ?2)
             ON CONFLICT(table_name) DO NOTHING",
            params![table_name, ts],
        )?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"rec_{table_name}\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                deleted_at_ms INTEGER,
                meta_ref INTEGER
            );"
        ))?;
        Self::sync_view(conn, table_name)
    }

    /// Envelope columns every table view exposes alongside the dynamic
    /// ones; a record field sharing one of these names is not re-exposed
    /// under its own name to avoid a duplicate-column view definition.
    const RESERVED_COLUMNS: [&'static str; 5] =
        ["id", "created_at_ms", "updated_at_ms", "meta_ref", "deleted_at_ms"];

    /// Rereads `table_name`'s current `inferred_schema` and rebuilds its
    /// logical view from it. Called whenever the schema may have changed so
    /// the view the SQL sandbox queries against never drifts from the
    /// registry.
    fn sync_view(conn: &rusqlite::Connection, table_name: &str) -> Result<(), TablesError> {
        let schema_json: String = conn.query_row(
            "SELECT inferred_schema FROM table_registry WHERE table_name = ?1",
            params![table_name],
            |r| r.get(0),
        )?;
        let schema: Vec<ColumnSchema> = serde_json::from_str(&schema_json).unwrap_or_default();
        Self::rebuild_view(conn, table_name, &schema)
    }

    /// (Re)creates the SQL view an agent's sandboxed query addresses by the
    /// table's logical name (e.g. `workouts`), projecting `rec_<name>`'s
    /// JSON `data` blob out into one `json_extract`-derived column per
    /// inferred field, alongside the envelope columns. This is what lets
    /// `sandbox::validate`'s output run unmodified against the tenant's
    /// connection (spec §4.4 execution contract): the physical table stays
    /// `rec_<name>`, but the name the agent wrote is a real, queryable view.
    fn rebuild_view(conn: &rusqlite::Connection, table_name: &str, schema: &[ColumnSchema]) -> Result<(), TablesError> {
        let mut projections = vec![
            "id".to_string(),
            "created_at_ms".to_string(),
            "updated_at_ms".to_string(),
            "meta_ref".to_string(),
        ];
        for col in schema {
            if Self::RESERVED_COLUMNS.contains(&col.name.as_str()) {
                continue;
            }
            let sql_type = match ColumnType::from_str(&col.column_type) {
                ColumnType::Integer => "INTEGER",
                ColumnType::Real => "REAL",
                ColumnType::Boolean => "INTEGER",
                ColumnType::Date | ColumnType::Text => "TEXT",
            };
            projections.push(format!(
                "CAST(json_extract(data, '$.{name}') AS {sql_type}) AS \"{name}\"",
                name = col.name,
            ));
        }
        conn.execute_batch(&format!("DROP VIEW IF EXISTS \"{table_name}\";"))?;
        conn.execute_batch(&format!(
            "CREATE VIEW \"{table_name}\" AS SELECT {select} FROM \"rec_{table_name}\" WHERE deleted_at_ms IS NULL;",
            select = projections.join(", "),
        ))?;
        Ok(())
    }

    /// Widens `table_registry.inferred_schema` with any column in `record`
    /// not yet known, or whose observed type is wider than the recorded one.
    fn extend_schema(conn: &rusqlite::Connection, table_name: &str, record: &Value) -> Result<(), TablesError> {
        let Value::Object(fields) = record else {
            return Ok(());
        };
        let current_json: String = conn.query_row(
            "SELECT inferred_schema FROM table_registry WHERE table_name = ?1",
            params![table_name],
            |r| r.get(0),
        )?;
        let mut current: Vec<ColumnSchema> = serde_json::from_str(&current_json).unwrap_or_default();
        let mut by_name: std::collections::HashMap<String, ColumnType> = current
            .iter()
            .map(|c| (c.name.clone(), ColumnType::from_str(&c.column_type)))
            .collect();

        let mut changed = false;
        for (name, value) in fields {
            if !is_safe_identifier(name) {
                continue;
            }
            let observed = infer_type(value);
            let widened = match by_name.get(name) {
                Some(existing) => existing.widen(observed),
                None => observed,
            };
            if by_name.get(name) != Some(&widened) {
                by_name.insert(name.clone(), widened);
                changed = true;
            }
        }

        if changed {
            current = by_name
                .into_iter()
                .map(|(name, column_type)| ColumnSchema { name, column_type: column_type.as_str().to_string() })
                .collect();
            current.sort_by(|a, b| a.name.cmp(&b.name));
            conn.execute(
                "UPDATE table_registry SET inferred_schema = ?1, updated_at_ms = ?2 WHERE table_name = ?3",
                params![serde_json::to_string(&current).unwrap_or_default(), now_ms(), table_name],
            )?;
            Self::rebuild_view(conn, table_name, &current)?;
        }
        Ok(())
    }

    /// Inserts `data` into `table_name`, auto-creating the table and
    /// extending its inferred schema as needed.
    pub fn insert(handle: &TenantHandle, table_name: &str, data: Value) -> Result<Record, TablesError> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        Self::ensure_table(&conn, table_name)?;
        Self::extend_schema(&conn, table_name, &data)?;

        let ts = now_ms();
        conn.execute(
            &format!("INSERT INTO \"rec_{table_name}\" (data, created_at_ms, updated_at_ms) VALUES (?1, ?2, ?2)"),
            params![data.to_string(), ts],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE table_registry SET record_count = record_count + 1, updated_at_ms = ?1 WHERE table_name = ?2",
            params![ts, table_name],
        )?;

        Ok(Record { id, table_name: table_name.to_string(), data, created_at_ms: ts, updated_at_ms: ts, meta_ref: None })
    }

    pub fn set_meta_ref(handle: &TenantHandle, table_name: &str, id: i64, meta_id: i64) -> Result<(), TablesError> {
        if !is_safe_identifier(table_name) {
            return Err(TablesError::InvalidIdentifier(table_name.to_string()));
        }
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        conn.execute(
            &format!("UPDATE \"rec_{table_name}\" SET meta_ref = ?1 WHERE id = ?2"),
            params![meta_id, id],
        )?;
        Ok(())
    }

    pub fn get_record(handle: &TenantHandle, table_name: &str, id: i64) -> Result<Record, TablesError> {
        if !is_safe_identifier(table_name) {
            return Err(TablesError::InvalidIdentifier(table_name.to_string()));
        }
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        conn.query_row(
            &format!(
                "SELECT id, data, created_at_ms, updated_at_ms, meta_ref FROM \"rec_{table_name}\"
                 WHERE id = ?1 AND deleted_at_ms IS NULL"
            ),
            params![id],
            |r| row_to_record(r, table_name),
        )
        .optional()?
        .ok_or_else(|| TablesError::RecordNotFound(table_name.to_string(), id))
    }

    /// Lists non-deleted records, newest first, paginated.
    pub fn list_records(handle: &TenantHandle, table_name: &str, limit: i64, offset: i64) -> Result<Vec<Record>, TablesError> {
        if !is_safe_identifier(table_name) {
            return Err(TablesError::InvalidIdentifier(table_name.to_string()));
        }
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, data, created_at_ms, updated_at_ms, meta_ref FROM \"rec_{table_name}\"
             WHERE deleted_at_ms IS NULL ORDER BY id DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit, offset], |r| row_to_record(r, table_name))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deep-merges `patch` into an existing record's `data` (same field-wise
    /// merge semantics as [`crate::profile::deep_merge`]) and widens the
    /// table's inferred schema for any newly observed field.
    pub fn update(handle: &TenantHandle, table_name: &str, id: i64, patch: Value) -> Result<Record, TablesError> {
        if !is_safe_identifier(table_name) {
            return Err(TablesError::InvalidIdentifier(table_name.to_string()));
        }
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let existing = Self::get_record(handle, table_name, id)?;
        let merged = crate::profile::deep_merge(existing.data, patch);
        Self::extend_schema(&conn, table_name, &merged)?;
        let ts = now_ms();
        conn.execute(
            &format!("UPDATE \"rec_{table_name}\" SET data = ?1, updated_at_ms = ?2 WHERE id = ?3 AND deleted_at_ms IS NULL"),
            params![merged.to_string(), ts, id],
        )?;
        Self::get_record(handle, table_name, id)
    }

    pub fn soft_delete(handle: &TenantHandle, table_name: &str, id: i64) -> Result<(), TablesError> {
        if !is_safe_identifier(table_name) {
            return Err(TablesError::InvalidIdentifier(table_name.to_string()));
        }
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let n = conn.execute(
            &format!("UPDATE \"rec_{table_name}\" SET deleted_at_ms = ?1 WHERE id = ?2 AND deleted_at_ms IS NULL"),
            params![now_ms(), id],
        )?;
        if n == 0 {
            return Err(TablesError::RecordNotFound(table_name.to_string(), id));
        }
        conn.execute(
            "UPDATE table_registry SET record_count = record_count - 1 WHERE table_name = ?1",
            params![table_name],
        )?;
        Ok(())
    }
}

fn row_to_table_info(r: &rusqlite::Row) -> rusqlite::Result<TableInfo> {
    let schema_str: String = r.get(2)?;
    Ok(TableInfo {
        table_name: r.get(0)?,
        description: r.get(1)?,
        inferred_schema: serde_json::from_str(&schema_str).unwrap_or_default(),
        record_count: r.get(3)?,
        created_at_ms: r.get(4)?,
        updated_at_ms: r.get(5)?,
    })
}

fn row_to_record(r: &rusqlite::Row, table_name: &str) -> rusqlite::Result<Record> {
    let data_str: String = r.get(1)?;
    Ok(Record {
        id: r.get(0)?,
        table_name: table_name.to_string(),
        data: serde_json::from_str(&data_str).unwrap_or(Value::Null),
        created_at_ms: r.get(2)?,
        updated_at_ms: r.get(3)?,
        meta_ref: r.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantManager;

    fn handle() -> (tempfile::TempDir, std::sync::Arc<TenantHandle>) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TenantManager::new(dir.path().to_path_buf()).unwrap();
        let h = mgr.tenant_or_create("alice").unwrap();
        (dir, h)
    }

    #[test]
    fn first_insert_auto_creates_table_and_registry_entry() {
        let (_d, h) = handle();
        TableStore::insert(&h, "workouts", serde_json::json!({"type": "run", "minutes": 30})).unwrap();
        let info = TableStore::get_table(&h, "workouts").unwrap().unwrap();
        assert_eq!(info.record_count, 1);
        assert!(info.inferred_schema.iter().any(|c| c.name == "minutes" && c.column_type == "integer"));
    }

    #[test]
    fn column_type_widens_integer_to_real_never_narrows() {
        let (_d, h) = handle();
        TableStore::insert(&h, "workouts", serde_json::json!({"distance": 5})).unwrap();
        TableStore::insert(&h, "workouts", serde_json::json!({"distance": 5.5})).unwrap();
        let info = TableStore::get_table(&h, "workouts").unwrap().unwrap();
        let col = info.inferred_schema.iter().find(|c| c.name == "distance").unwrap();
        assert_eq!(col.column_type, "real");
    }

    #[test]
    fn reject_unsafe_table_identifier() {
        let (_d, h) = handle();
        let err = TableStore::insert(&h, "bad; DROP TABLE x", serde_json::json!({}));
        assert!(matches!(err, Err(TablesError::InvalidIdentifier(_))));
    }

    #[test]
    fn soft_delete_excludes_record_from_listing_and_decrements_count() {
        let (_d, h) = handle();
        let rec = TableStore::insert(&h, "workouts", serde_json::json!({"type": "run"})).unwrap();
        TableStore::soft_delete(&h, "workouts", rec.id).unwrap();
        let rows = TableStore::list_records(&h, "workouts", 10, 0).unwrap();
        assert!(rows.is_empty());
        let info = TableStore::get_table(&h, "workouts").unwrap().unwrap();
        assert_eq!(info.record_count, 0);
    }

    #[test]
    fn list_records_orders_newest_first() {
        let (_d, h) = handle();
        TableStore::insert(&h, "journal", serde_json::json!({"text": "first"})).unwrap();
        TableStore::insert(&h, "journal", serde_json::json!({"text": "second"})).unwrap();
        let rows = TableStore::list_records(&h, "journal", 10, 0).unwrap();
        assert_eq!(rows[0].data["text"], "second");
    }

    #[test]
    fn logical_view_projects_json_fields_as_real_columns() {
        let (_d, h) = handle();
        TableStore::insert(&h, "workouts", serde_json::json!({"type": "run", "minutes": 30})).unwrap();
        let conn = h.connect().unwrap();
        let minutes: i64 = conn
            .query_row("SELECT minutes FROM workouts WHERE type = 'run'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(minutes, 30);
    }

    #[test]
    fn logical_view_hides_soft_deleted_rows() {
        let (_d, h) = handle();
        let rec = TableStore::insert(&h, "workouts", serde_json::json!({"type": "run"})).unwrap();
        TableStore::soft_delete(&h, "workouts", rec.id).unwrap();
        let conn = h.connect().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM workouts", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
