//! Profile document (spec §3, §4.5 step 3).
//!
//! The profile is an append-only versioned JSON document: each write
//! deep-merges the patch into the latest version (nested objects merge
//! field-wise, arrays replace wholesale) and inserts a new row rather than
//! mutating in place. `version` is enforced monotonic by `profile_versions`'
//! own PRIMARY KEY — a concurrent second writer racing for the same next
//! version loses the `INSERT` and retries at `v+1` (Invariant P1).

use crate::error::ProfileError;
use crate::tenant::TenantHandle;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

const IDENTITY_FIELD: &str = "name";
const MAX_VERSION_RETRIES: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ProfileVersion {
    pub version: i64,
    pub data: Value,
    pub changed_by: String,
    pub changed_fields: Vec<String>,
    pub changed_at_ms: i64,
    pub meta_ref: Option<i64>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct ProfileStore;

impl ProfileStore {
    /// The latest version, or `None` if the profile has never been written.
    pub fn current(handle: &TenantHandle) -> Result<Option<ProfileVersion>, ProfileError> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        Self::current_conn(&conn)
    }

    fn current_conn(conn: &rusqlite::Connection) -> Result<Option<ProfileVersion>, ProfileError> {
        conn.query_row(
            "SELECT version, data, changed_by, changed_fields, changed_at_ms, meta_ref
             FROM profile_versions ORDER BY version DESC LIMIT 1",
            [],
            row_to_version,
        )
        .optional()
        .map_err(ProfileError::from)
    }

    pub fn history(handle: &TenantHandle, limit: i64, offset: i64) -> Result<Vec<ProfileVersion>, ProfileError> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let mut stmt = conn.prepare(
            "SELECT version, data, changed_by, changed_fields, changed_at_ms, meta_ref
             FROM profile_versions ORDER BY version DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], row_to_version)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Applies `patch` via deep-merge onto the current profile (or `{}` if
    /// none exists yet), returning the new version. Fails with
    /// [`ProfileError::IdentityConflict`] when the patch overwrites the
    /// identity field (`name`) with a value already present as a
    /// `profile.family[].name` entry — guarding against an agent silently
    /// reassigning the user's own identity to a relative's.
    pub fn patch(
        handle: &TenantHandle,
        patch: Value,
        changed_by: &str,
    ) -> Result<ProfileVersion, ProfileError> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let current = Self::current_conn(&conn)?;
        let current_data = current.as_ref().map(|c| c.data.clone()).unwrap_or(serde_json::json!({}));

        if identity_conflict(&current_data, &patch) {
            return Err(ProfileError::IdentityConflict);
        }

        let merged = deep_merge(current_data.clone(), patch);
        let changed = changed_fields(&current_data, &merged);
        let ts = now_ms();
        let next_version = current.as_ref().map(|c| c.version + 1).unwrap_or(1);

        for attempt in 0..MAX_VERSION_RETRIES {
            let candidate = next_version + attempt as i64;
            let result = conn.execute(
                "INSERT INTO profile_versions (version, data, changed_by, changed_fields, changed_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![candidate, merged.to_string(), changed_by, serde_json::to_string(&changed).unwrap_or_default(), ts],
            );
            match result {
                Ok(_) => {
                    return Ok(ProfileVersion {
                        version: candidate,
                        data: merged,
                        changed_by: changed_by.to_string(),
                        changed_fields: changed,
                        changed_at_ms: ts,
                        meta_ref: None,
                    });
                }
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                    continue;
                }
                Err(e) => return Err(ProfileError::from(e)),
            }
        }
        Err(ProfileError::VersionContention(MAX_VERSION_RETRIES))
    }

    /// Records the ledger row id a version was registered under, so
    /// `source_ref = "profile:v{version}"` round-trips to its meta row.
    pub fn set_meta_ref(handle: &TenantHandle, version: i64, meta_id: i64) -> Result<(), ProfileError> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        conn.execute("UPDATE profile_versions SET meta_ref = ?1 WHERE version = ?2", params![meta_id, version])?;
        Ok(())
    }
}

fn row_to_version(r: &rusqlite::Row) -> rusqlite::Result<ProfileVersion> {
    let data_str: String = r.get(1)?;
    let changed_fields_str: String = r.get(3)?;
    Ok(ProfileVersion {
        version: r.get(0)?,
        data: serde_json::from_str(&data_str).unwrap_or(Value::Null),
        changed_by: r.get(2)?,
        changed_fields: serde_json::from_str(&changed_fields_str).unwrap_or_default(),
        changed_at_ms: r.get(4)?,
        meta_ref: r.get(5)?,
    })
}

/// Nested objects merge field-wise; arrays and scalars are replaced
/// wholesale by the incoming value (spec §3 Profile semantics).
pub fn deep_merge(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                let merged = match base_map.remove(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v,
                };
                base_map.insert(k, merged);
            }
            Value::Object(base_map)
        }
        (_, patch) => patch,
    }
}

/// Dotted paths (e.g. `address.city`) where the merged value differs from
/// the pre-merge value, computed by walking both trees together.
fn changed_fields(before: &Value, after: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_changed_fields(before, after, "", &mut out);
    out
}

fn collect_changed_fields(before: &Value, after: &Value, prefix: &str, out: &mut Vec<String>) {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            for (k, av) in a {
                let path = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                match b.get(k) {
                    Some(bv) => collect_changed_fields(bv, av, &path, out),
                    None => out.push(path),
                }
            }
        }
        _ => {
            if before != after {
                out.push(prefix.to_string());
            }
        }
    }
}

/// `true` when `patch` would set the identity field to a name already
/// present in `current.family[].name` — an agent attempting to overwrite
/// the user's own identity with a relative's.
fn identity_conflict(current: &Value, patch: &Value) -> bool {
    let Some(new_name) = patch.get(IDENTITY_FIELD).and_then(Value::as_str) else {
        return false;
    };
    let Some(family) = current.get("family").and_then(Value::as_array) else {
        return false;
    };
    family
        .iter()
        .filter_map(|m| m.get("name").and_then(Value::as_str))
        .any(|name| name.eq_ignore_ascii_case(new_name))
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
    fn first_patch_creates_version_one() {
        let (_d, h) = handle();
        let v = ProfileStore::patch(&h, serde_json::json!({"name": "Alice"}), "agent-1").unwrap();
        assert_eq!(v.version, 1);
        assert_eq!(v.data["name"], "Alice");
    }

    #[test]
    fn versions_are_a_contiguous_monotonic_range() {
        let (_d, h) = handle();
        for i in 1..=5 {
            let v = ProfileStore::patch(&h, serde_json::json!({"count": i}), "agent-1").unwrap();
            assert_eq!(v.version, i as i64);
        }
        let current = ProfileStore::current(&h).unwrap().unwrap();
        assert_eq!(current.version, 5);
    }

    #[test]
    fn nested_object_merges_field_wise() {
        let (_d, h) = handle();
        ProfileStore::patch(&h, serde_json::json!({"address": {"city": "Berlin", "zip": "10115"}}), "agent-1").unwrap();
        let v = ProfileStore::patch(&h, serde_json::json!({"address": {"city": "Munich"}}), "agent-1").unwrap();
        assert_eq!(v.data["address"]["city"], "Munich");
        assert_eq!(v.data["address"]["zip"], "10115");
    }

    #[test]
    fn array_patch_replaces_rather_than_merges() {
        let (_d, h) = handle();
        ProfileStore::patch(&h, serde_json::json!({"tags": ["a", "b"]}), "agent-1").unwrap();
        let v = ProfileStore::patch(&h, serde_json::json!({"tags": ["c"]}), "agent-1").unwrap();
        assert_eq!(v.data["tags"], serde_json::json!(["c"]));
    }

    #[test]
    fn changed_fields_lists_dotted_paths_that_actually_changed() {
        let (_d, h) = handle();
        ProfileStore::patch(&h, serde_json::json!({"name": "Alice", "address": {"city": "Berlin"}}), "agent-1").unwrap();
        let v = ProfileStore::patch(&h, serde_json::json!({"address": {"city": "Munich"}}), "agent-1").unwrap();
        assert_eq!(v.changed_fields, vec!["address.city".to_string()]);
    }

    #[test]
    fn identity_conflict_is_rejected() {
        let (_d, h) = handle();
        ProfileStore::patch(
            &h,
            serde_json::json!({"name": "Alice", "family": [{"name": "Georgia", "relation": "daughter"}]}),
            "agent-1",
        )
        .unwrap();
        let err = ProfileStore::patch(&h, serde_json::json!({"name": "Georgia"}), "agent-1");
        assert!(matches!(err, Err(ProfileError::IdentityConflict)));
    }

    #[test]
    fn renaming_to_an_unrelated_name_is_not_a_conflict() {
        let (_d, h) = handle();
        ProfileStore::patch(
            &h,
            serde_json::json!({"name": "Alice", "family": [{"name": "Georgia", "relation": "daughter"}]}),
            "agent-1",
        )
        .unwrap();
        let v = ProfileStore::patch(&h, serde_json::json!({"name": "Alicia"}), "agent-1").unwrap();
        assert_eq!(v.data["name"], "Alicia");
    }
}
