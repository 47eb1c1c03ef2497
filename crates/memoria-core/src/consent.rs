//! Consent Engine (spec §4.2).
//!
//! Resources are hierarchical `/`-delimited paths (`tables/user_notes`,
//! `graph/stats`). A rule's `resource` pattern `P` matches a concrete
//! resource `R` iff one of:
//!
//! 1. `P == R` (exact).
//! 2. `P` ends with `/*` and `R` starts with `P[:-2] + "/"` or equals `P[:-2]`.
//! 3. `R` starts with `P + "/"` (hierarchical: a rule on `graph` covers
//!    `graph/stats`).
//!
//! Matching is plain Rust string/segment comparison, never a SQL `LIKE`, so
//! `%`, `_`, and `\` in a resource name or a granted pattern are ordinary
//! characters — never wildcards (H-6). A rule with `permission=none` denies
//! even when it is the most specific match; `write` implies `read`.

use crate::error::ConsentError;
use crate::tenant::TenantHandle;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    None,
}

impl Permission {
    fn from_str(s: &str) -> Self {
        match s {
            "write" => Permission::Write,
            "read" => Permission::Read,
            _ => Permission::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::None => "none",
        }
    }

    /// `write` implies `read`: an agent granted write access may also read.
    fn satisfies(self, required: Action) -> bool {
        match (self, required) {
            (Permission::None, _) => false,
            (Permission::Read, Action::Read) => true,
            (Permission::Read, Action::Write) => false,
            (Permission::Write, _) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsentRule {
    pub id: i64,
    pub agent_id: String,
    pub resource: String,
    pub permission: String,
    pub granted_at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct ConsentEngine;

impl ConsentEngine {
    /// Grants `permission` on `resource` to `agent_id`. Upserts: re-granting
    /// an active rule replaces its permission; a previously revoked rule for
    /// the same `(agent, resource)` is reactivated rather than duplicated.
    pub fn grant(
        handle: &TenantHandle,
        agent_id: &str,
        resource: &str,
        permission: &str,
    ) -> Result<ConsentRule, ConsentError> {
        let conn = handle.connect().map_err(|_| ConsentError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let granted_at_ms = now_ms();
        conn.execute(
            "INSERT INTO consent_rules (agent_id, resource, permission, granted_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id, resource) WHERE revoked_at_ms IS NULL
             DO UPDATE SET permission = excluded.permission, granted_at_ms = excluded.granted_at_ms",
            params![agent_id, resource, permission, granted_at_ms],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM consent_rules WHERE agent_id = ?1 AND resource = ?2 AND revoked_at_ms IS NULL",
            params![agent_id, resource],
            |r| r.get(0),
        )?;
        Ok(ConsentRule {
            id,
            agent_id: agent_id.to_string(),
            resource: resource.to_string(),
            permission: permission.to_string(),
            granted_at_ms,
        })
    }

    pub fn revoke(handle: &TenantHandle, agent_id: &str, resource: &str) -> Result<bool, ConsentError> {
        let conn = handle.connect().map_err(|_| ConsentError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let n = conn.execute(
            "UPDATE consent_rules SET revoked_at_ms = ?1 WHERE agent_id = ?2 AND resource = ?3 AND revoked_at_ms IS NULL",
            params![now_ms(), agent_id, resource],
        )?;
        Ok(n > 0)
    }

    pub fn revoke_all_for_agent(handle: &TenantHandle, agent_id: &str) -> Result<u64, ConsentError> {
        let conn = handle.connect().map_err(|_| ConsentError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let n = conn.execute(
            "UPDATE consent_rules SET revoked_at_ms = ?1 WHERE agent_id = ?2 AND revoked_at_ms IS NULL",
            params![now_ms(), agent_id],
        )?;
        Ok(n as u64)
    }

    pub fn list_for_agent(handle: &TenantHandle, agent_id: &str) -> Result<Vec<ConsentRule>, ConsentError> {
        let conn = handle.connect().map_err(|_| ConsentError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, resource, permission, granted_at_ms FROM consent_rules
             WHERE agent_id = ?1 AND revoked_at_ms IS NULL ORDER BY resource",
        )?;
        let rows = stmt
            .query_map(params![agent_id], |r| {
                Ok(ConsentRule {
                    id: r.get(0)?,
                    agent_id: r.get(1)?,
                    resource: r.get(2)?,
                    permission: r.get(3)?,
                    granted_at_ms: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `true` iff `agent_id` holds a rule matching `resource` whose
    /// permission satisfies `action` (write implies read). The most specific
    /// matching rule wins on conflicting grants; a `none` rule at the winning
    /// specificity denies regardless of any broader `read`/`write` rule.
    pub fn check(
        handle: &TenantHandle,
        agent_id: &str,
        resource: &str,
        action: Action,
    ) -> Result<bool, ConsentError> {
        let rules = Self::list_for_agent(handle, agent_id)?;
        let mut best: Option<(usize, Permission)> = None;
        for rule in &rules {
            if let Some(specificity) = match_specificity(&rule.resource, resource) {
                let perm = Permission::from_str(&rule.permission);
                match &best {
                    Some((s, _)) if *s >= specificity => {}
                    _ => best = Some((specificity, perm)),
                }
            }
        }
        Ok(best.map(|(_, p)| p.satisfies(action)).unwrap_or(false))
    }
}

/// Returns `Some(specificity)` (the matched rule's segment count — higher
/// wins on ties) if `pattern` covers `resource`, else `None`. Segment
/// comparison is exact string equality per path component; `%`, `_`, `\`
/// never behave as wildcards because this never becomes a SQL `LIKE`.
fn match_specificity(pattern: &str, resource: &str) -> Option<usize> {
    if pattern == resource {
        return Some(split_segments(pattern).len().max(1));
    }

    if let Some(prefix) = pattern.strip_suffix("/*") {
        if resource == prefix || resource.starts_with(&format!("{prefix}/")) {
            return Some(split_segments(prefix).len() + 1);
        }
        return None;
    }

    if resource.starts_with(&format!("{pattern}/")) {
        return Some(split_segments(pattern).len());
    }

    None
}

fn split_segments(s: &str) -> Vec<&str> {
    s.split('/').collect()
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
    fn exact_grant_matches_exact_resource() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "profile", "read").unwrap();
        assert!(ConsentEngine::check(&h, "agent-1", "profile", Action::Read).unwrap());
    }

    #[test]
    fn hierarchical_grant_covers_children() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "graph", "write").unwrap();
        assert!(ConsentEngine::check(&h, "agent-1", "graph/stats", Action::Read).unwrap());
    }

    #[test]
    fn write_implies_read() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "tables/workouts", "write").unwrap();
        assert!(ConsentEngine::check(&h, "agent-1", "tables/workouts", Action::Read).unwrap());
    }

    #[test]
    fn read_does_not_imply_write() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "tables/workouts", "read").unwrap();
        assert!(!ConsentEngine::check(&h, "agent-1", "tables/workouts", Action::Write).unwrap());
    }

    #[test]
    fn no_grant_means_no_access() {
        let (_d, h) = handle();
        assert!(!ConsentEngine::check(&h, "agent-1", "profile", Action::Read).unwrap());
    }

    #[test]
    fn revoke_removes_access() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "profile", "read").unwrap();
        assert!(ConsentEngine::revoke(&h, "agent-1", "profile").unwrap());
        assert!(!ConsentEngine::check(&h, "agent-1", "profile", Action::Read).unwrap());
    }

    /// Pins Testable Property H-6 (spec §8): a rule on `tables/user_notes`
    /// must not match `tables/userXnotes` for any single character `X`,
    /// including `_` and `%`, which would be wildcards under SQL `LIKE`.
    #[test]
    fn underscore_and_percent_are_literal_not_wildcards() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "tables/user_notes", "read").unwrap();
        for x in ['X', '_', '%', 'a'] {
            let probe = format!("tables/user{x}notes");
            if probe == "tables/user_notes" {
                continue;
            }
            assert!(
                !ConsentEngine::check(&h, "agent-1", &probe, Action::Read).unwrap(),
                "{probe} must not match tables/user_notes"
            );
        }
    }

    #[test]
    fn explicit_wildcard_suffix_covers_subtree() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "memories/health/*", "write").unwrap();
        assert!(ConsentEngine::check(&h, "agent-1", "memories/health/medication/dosage", Action::Read).unwrap());
        assert!(ConsentEngine::check(&h, "agent-1", "memories/health", Action::Read).unwrap());
    }

    #[test]
    fn none_permission_denies_even_as_most_specific_rule() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "memories", "write").unwrap();
        ConsentEngine::grant(&h, "agent-1", "memories/secret", "none").unwrap();
        assert!(!ConsentEngine::check(&h, "agent-1", "memories/secret", Action::Read).unwrap());
        assert!(ConsentEngine::check(&h, "agent-1", "memories/other", Action::Read).unwrap());
    }

    #[test]
    fn more_specific_rule_wins_on_conflicting_grants() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "memories", "read").unwrap();
        ConsentEngine::grant(&h, "agent-1", "memories/health", "write").unwrap();
        assert!(ConsentEngine::check(&h, "agent-1", "memories/health", Action::Write).unwrap());
    }
}
