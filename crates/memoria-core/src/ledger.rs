//! Memory-quality ledger (spec §4.3).
//!
//! Every durable write gets a `memory_meta` row tracking provenance and a
//! confidence score that nudges toward 1.0 on reinforcement/access. Status
//! moves through a small state machine:
//!
//! ```text
//! unvetted -> active            (promotion: N reinforcements/reads, confidence >= 0.50)
//! (active | trusted) -> review  (contradiction against a high-confidence fact)
//! review -> trusted | active | rejected   (resolve: confirm | keep_both | reject)
//! unvetted -> decayed           (inactivity, decay_scan)
//! ```

use crate::error::LedgerError;
use crate::tenant::TenantHandle;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

/// Confidence nudge factor: `c <- c + (1 - c) * ALPHA` on each reinforcement
/// or read access. Small enough that a single access never swings trust.
pub const ALPHA: f64 = 0.05;
/// Reinforcements or reads required before an `unvetted` fact is eligible
/// for promotion to `active`.
pub const PROMOTE_AFTER: i64 = 5;
/// Days of inactivity before an `unvetted` row is marked `decayed`.
pub const DECAY_AFTER_DAYS: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Unvetted,
    Active,
    Trusted,
    Review,
    Decayed,
    Rejected,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unvetted => "unvetted",
            Status::Active => "active",
            Status::Trusted => "trusted",
            Status::Review => "review",
            Status::Decayed => "decayed",
            Status::Rejected => "rejected",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "active" => Status::Active,
            "trusted" => Status::Trusted,
            "review" => Status::Review,
            "decayed" => Status::Decayed,
            "rejected" => Status::Rejected,
            _ => Status::Unvetted,
        }
    }
}

/// An agent-reported fact's provenance (spec §3 GLOSSARY). Determines the
/// initial `(confidence, status)` pair a registered fact starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    UserStated,
    UserTyped,
    AiStated,
    AiInferred,
    AiPattern,
    Imported,
    System,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::UserStated => "user_stated",
            Origin::UserTyped => "user_typed",
            Origin::AiStated => "ai_stated",
            Origin::AiInferred => "ai_inferred",
            Origin::AiPattern => "ai_pattern",
            Origin::Imported => "imported",
            Origin::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user_stated" => Origin::UserStated,
            "user_typed" => Origin::UserTyped,
            "ai_stated" => Origin::AiStated,
            "ai_inferred" => Origin::AiInferred,
            "ai_pattern" => Origin::AiPattern,
            "imported" => Origin::Imported,
            "system" => Origin::System,
            _ => return None,
        })
    }

    /// Initial `(confidence, status)` per the origin table in spec §4.3.
    fn initial(self) -> (f64, Status) {
        match self {
            Origin::UserStated | Origin::UserTyped => (0.85, Status::Trusted),
            Origin::AiStated => (0.50, Status::Unvetted),
            Origin::AiInferred => (0.40, Status::Unvetted),
            Origin::AiPattern => (0.30, Status::Unvetted),
            Origin::Imported | Origin::System => (0.70, Status::Active),
        }
    }
}

/// One `{field, old_value, new_value, at, prior_meta_id}` contradiction entry.
#[derive(Debug, Clone, Serialize)]
pub struct Contradiction {
    pub field: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub at_ms: i64,
    pub prior_meta_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryMeta {
    pub id: i64,
    pub source_type: String,
    pub source_ref: String,
    pub origin: String,
    pub agent_source: Option<String>,
    pub confidence: f64,
    pub status: String,
    pub access_count: i64,
    pub last_accessed_ms: Option<i64>,
    pub last_reinforced_ms: Option<i64>,
    pub contradictions: Vec<serde_json::Value>,
    pub promote_history: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Confirm,
    Reject,
    KeepBoth,
}

impl ResolveAction {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "confirm" => ResolveAction::Confirm,
            "reject" => ResolveAction::Reject,
            "keep_both" => ResolveAction::KeepBoth,
            _ => return None,
        })
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Ledger;

impl Ledger {
    /// Registers a new fact with the confidence/status the origin table
    /// prescribes. Idempotent on `(source_type, source_ref)`: re-registering
    /// the same ref reinforces the existing row instead of duplicating it.
    pub fn register_fact(
        handle: &TenantHandle,
        source_type: &str,
        source_ref: &str,
        origin: Origin,
        agent_source: Option<&str>,
    ) -> Result<MemoryMeta, LedgerError> {
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM memory_meta WHERE source_ref = ?1", params![source_ref], |r| r.get(0))
            .optional()?;
        if let Some(id) = existing {
            return Self::reinforce(handle, id);
        }
        let (confidence, status) = origin.initial();
        let ts = now_ms();
        conn.execute(
            "INSERT INTO memory_meta
             (source_type, source_ref, origin, agent_source, confidence, status, access_count, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![source_type, source_ref, origin.as_str(), agent_source, confidence, status.as_str(), ts],
        )?;
        let id = conn.last_insert_rowid();
        Self::get(handle, id)
    }

    pub fn get(handle: &TenantHandle, id: i64) -> Result<MemoryMeta, LedgerError> {
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        Self::get_conn(&conn, id)
    }

    fn get_conn(conn: &rusqlite::Connection, id: i64) -> Result<MemoryMeta, LedgerError> {
        conn.query_row(
            "SELECT id, source_type, source_ref, origin, agent_source, confidence, status, access_count,
                    last_accessed_ms, last_reinforced_ms, contradictions, promote_history
             FROM memory_meta WHERE id = ?1",
            params![id],
            |r| {
                let contradictions_json: String = r.get(10)?;
                let promote_history_json: String = r.get(11)?;
                Ok(MemoryMeta {
                    id: r.get(0)?,
                    source_type: r.get(1)?,
                    source_ref: r.get(2)?,
                    origin: r.get(3)?,
                    agent_source: r.get(4)?,
                    confidence: r.get(5)?,
                    status: r.get(6)?,
                    access_count: r.get(7)?,
                    last_accessed_ms: r.get(8)?,
                    last_reinforced_ms: r.get(9)?,
                    contradictions: serde_json::from_str(&contradictions_json).unwrap_or_default(),
                    promote_history: serde_json::from_str(&promote_history_json).unwrap_or_default(),
                })
            },
        )
        .optional()?
        .ok_or(LedgerError::NotFound(id))
    }

    fn nudge(confidence: f64) -> f64 {
        (confidence + (1.0 - confidence) * ALPHA).min(1.0)
    }

    /// Promotes `unvetted -> active` once `access_count` has crossed
    /// [`PROMOTE_AFTER`] and the nudged confidence is at least 0.50 (spec
    /// §4.3 promotion rule). No other status transition happens implicitly.
    fn promoted(status: Status, access_count: i64, confidence: f64) -> Status {
        if status == Status::Unvetted && access_count >= PROMOTE_AFTER && confidence >= 0.50 {
            Status::Active
        } else {
            status
        }
    }

    /// A reinforcement (e.g. the written value recurs unchanged, or an
    /// explicit agent confirmation): nudges confidence, increments
    /// `access_count`, and applies the promotion rule.
    pub fn reinforce(handle: &TenantHandle, id: i64) -> Result<MemoryMeta, LedgerError> {
        let current = Self::get(handle, id)?;
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let new_confidence = Self::nudge(current.confidence);
        let new_count = current.access_count + 1;
        let ts = now_ms();
        let current_status = Status::from_str(&current.status);
        let new_status = Self::promoted(current_status, new_count, new_confidence);

        conn.execute(
            "UPDATE memory_meta SET confidence = ?1, access_count = ?2, status = ?3,
             last_reinforced_ms = ?4, updated_at_ms = ?4 WHERE id = ?5",
            params![new_confidence, new_count, new_status.as_str(), ts, id],
        )?;
        Self::append_promote_history(&conn, id, current_status, new_status, ts, "reinforce")?;
        Self::get_conn(&conn, id)
    }

    /// A read access (e.g. `GET /v1/profile`): same nudge/promotion contract
    /// as reinforcement, recorded against `last_accessed_ms` instead.
    pub fn record_access(handle: &TenantHandle, id: i64) -> Result<MemoryMeta, LedgerError> {
        let current = Self::get(handle, id)?;
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let new_confidence = Self::nudge(current.confidence);
        let new_count = current.access_count + 1;
        let ts = now_ms();
        let current_status = Status::from_str(&current.status);
        let new_status = Self::promoted(current_status, new_count, new_confidence);

        conn.execute(
            "UPDATE memory_meta SET confidence = ?1, access_count = ?2, status = ?3,
             last_accessed_ms = ?4, updated_at_ms = ?4 WHERE id = ?5",
            params![new_confidence, new_count, new_status.as_str(), ts, id],
        )?;
        Self::append_promote_history(&conn, id, current_status, new_status, ts, "access")?;
        Self::get_conn(&conn, id)
    }

    /// Records a contradiction on `meta_id` against `prior_meta_id`'s prior
    /// value for `field`. If the *prior* fact had `confidence >= 0.70` and
    /// `status in (active, trusted)` before this call, both rows move to
    /// `review` (spec §4.3); otherwise only the contradiction is logged.
    pub fn record_contradiction(
        handle: &TenantHandle,
        meta_id: i64,
        field: &str,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
        prior_meta_id: i64,
    ) -> Result<MemoryMeta, LedgerError> {
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let ts = now_ms();

        let current = Self::get_conn(&conn, meta_id)?;
        let mut contradictions = current.contradictions.clone();
        contradictions.push(serde_json::json!({
            "field": field,
            "old_value": old_value,
            "new_value": new_value,
            "at_ms": ts,
            "prior_meta_id": prior_meta_id,
        }));
        let contradictions_json = serde_json::to_string(&contradictions).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "UPDATE memory_meta SET contradictions = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![contradictions_json, ts, meta_id],
        )?;

        let prior = Self::get_conn(&conn, prior_meta_id)?;
        let prior_status = Status::from_str(&prior.status);
        let high_confidence_conflict =
            prior.confidence >= 0.70 && matches!(prior_status, Status::Active | Status::Trusted);

        if high_confidence_conflict {
            let current_status = Status::from_str(&current.status);
            conn.execute(
                "UPDATE memory_meta SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
                params![Status::Review.as_str(), ts, meta_id],
            )?;
            Self::append_promote_history(&conn, meta_id, current_status, Status::Review, ts, "contradiction")?;

            conn.execute(
                "UPDATE memory_meta SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
                params![Status::Review.as_str(), ts, prior_meta_id],
            )?;
            Self::append_promote_history(&conn, prior_meta_id, prior_status, Status::Review, ts, "contradiction")?;
        }

        Self::get_conn(&conn, meta_id)
    }

    /// Resolves a `review` row. `confirm` trusts this row at confidence
    /// 0.95; `reject` withdraws it; `keep_both` reactivates both this row
    /// and the prior fact named in its most recent contradiction entry.
    /// Only a `review` row may be resolved.
    pub fn resolve(handle: &TenantHandle, id: i64, action: ResolveAction) -> Result<MemoryMeta, LedgerError> {
        let current = Self::get(handle, id)?;
        let current_status = Status::from_str(&current.status);
        if current_status != Status::Review {
            return Err(LedgerError::InvalidState(id));
        }
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let ts = now_ms();

        match action {
            ResolveAction::Confirm => {
                conn.execute(
                    "UPDATE memory_meta SET status = ?1, confidence = 0.95, updated_at_ms = ?2 WHERE id = ?3",
                    params![Status::Trusted.as_str(), ts, id],
                )?;
                Self::append_promote_history(&conn, id, current_status, Status::Trusted, ts, "resolve:confirm")?;
            }
            ResolveAction::Reject => {
                conn.execute(
                    "UPDATE memory_meta SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
                    params![Status::Rejected.as_str(), ts, id],
                )?;
                Self::append_promote_history(&conn, id, current_status, Status::Rejected, ts, "resolve:reject")?;
            }
            ResolveAction::KeepBoth => {
                conn.execute(
                    "UPDATE memory_meta SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
                    params![Status::Active.as_str(), ts, id],
                )?;
                Self::append_promote_history(&conn, id, current_status, Status::Active, ts, "resolve:keep_both")?;

                if let Some(prior_id) = current
                    .contradictions
                    .last()
                    .and_then(|c| c.get("prior_meta_id"))
                    .and_then(|v| v.as_i64())
                {
                    if let Ok(prior) = Self::get_conn(&conn, prior_id) {
                        let prior_status = Status::from_str(&prior.status);
                        conn.execute(
                            "UPDATE memory_meta SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
                            params![Status::Active.as_str(), ts, prior_id],
                        )?;
                        Self::append_promote_history(&conn, prior_id, prior_status, Status::Active, ts, "resolve:keep_both")?;
                    }
                }
            }
        }
        Self::get_conn(&conn, id)
    }

    /// Marks every `unvetted` row whose `last_accessed`/`last_reinforced`
    /// (falling back to `created_at`) is older than [`DECAY_AFTER_DAYS`] as
    /// `decayed`. Intended to run periodically from the enrichment daemon,
    /// never from a request path. Returns the number of rows transitioned.
    pub fn decay_scan(handle: &TenantHandle) -> Result<u64, LedgerError> {
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let ts = now_ms();
        let cutoff = ts - DECAY_AFTER_DAYS * 24 * 60 * 60 * 1000;
        let n = conn.execute(
            "UPDATE memory_meta SET status = 'decayed', updated_at_ms = ?1
             WHERE status = 'unvetted'
             AND COALESCE(last_accessed_ms, last_reinforced_ms, created_at_ms) < ?2",
            params![ts, cutoff],
        )?;
        Ok(n as u64)
    }

    /// Lists rows in `status`, most recently updated first, for the review
    /// queue and similar status-scoped listings.
    pub fn list_by_status(
        handle: &TenantHandle,
        status: Status,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MemoryMeta>, LedgerError> {
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut stmt = conn.prepare(
            "SELECT id FROM memory_meta WHERE status = ?1 ORDER BY updated_at_ms DESC LIMIT ?2 OFFSET ?3",
        )?;
        let ids: Vec<i64> = stmt.query_map(params![status.as_str(), limit, offset], |r| r.get(0))?.collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        ids.into_iter().map(|id| Self::get_conn(&conn, id)).collect()
    }

    /// Row count per status, for `/v1/memory/stats`.
    pub fn status_counts(handle: &TenantHandle) -> Result<Vec<(String, i64)>, LedgerError> {
        let conn = handle.connect().map_err(|_| LedgerError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM memory_meta GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn append_promote_history(
        conn: &rusqlite::Connection,
        id: i64,
        from: Status,
        to: Status,
        ts: i64,
        reason: &str,
    ) -> Result<(), LedgerError> {
        if from == to {
            return Ok(());
        }
        let history_json: String =
            conn.query_row("SELECT promote_history FROM memory_meta WHERE id = ?1", params![id], |r| r.get(0))?;
        let mut history: Vec<serde_json::Value> = serde_json::from_str(&history_json).unwrap_or_default();
        history.push(serde_json::json!({ "from": from.as_str(), "to": to.as_str(), "at_ms": ts, "reason": reason }));
        let updated = serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string());
        conn.execute("UPDATE memory_meta SET promote_history = ?1 WHERE id = ?2", params![updated, id])?;
        Ok(())
    }
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
    fn user_stated_starts_trusted() {
        let (_d, h) = handle();
        let meta = Ledger::register_fact(&h, "profile", "profile:v1", Origin::UserStated, None).unwrap();
        assert_eq!(meta.status, "trusted");
        assert!((meta.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn ai_inferred_promotes_to_active_after_five_reads() {
        let (_d, h) = handle();
        let meta = Ledger::register_fact(&h, "profile", "profile.nickname", Origin::AiInferred, None).unwrap();
        assert_eq!(meta.status, "unvetted");
        assert!((meta.confidence - 0.40).abs() < 1e-9);

        let mut last = meta;
        for _ in 0..5 {
            last = Ledger::record_access(&h, last.id).unwrap();
        }
        assert_eq!(last.access_count, 5);
        assert!(last.confidence >= 0.50);
        assert_eq!(last.status, "active", "5 reads at ai_inferred confidence must promote to active, not trusted");
    }

    #[test]
    fn confidence_never_exceeds_one() {
        let (_d, h) = handle();
        let meta = Ledger::register_fact(&h, "fact", "table:1", Origin::Imported, None).unwrap();
        let mut last = meta;
        for _ in 0..200 {
            last = Ledger::reinforce(&h, last.id).unwrap();
        }
        assert!(last.confidence <= 1.0);
    }

    #[test]
    fn access_count_is_strictly_monotonic() {
        let (_d, h) = handle();
        let meta = Ledger::register_fact(&h, "fact", "table:1", Origin::Imported, None).unwrap();
        let mut last_count = meta.access_count;
        let mut cur = meta;
        for _ in 0..10 {
            cur = Ledger::reinforce(&h, cur.id).unwrap();
            assert!(cur.access_count > last_count);
            last_count = cur.access_count;
        }
    }

    #[test]
    fn contradiction_against_high_confidence_fact_moves_both_to_review() {
        let (_d, h) = handle();
        let prior = Ledger::register_fact(&h, "profile", "profile:v1", Origin::UserStated, None).unwrap();
        let next = Ledger::register_fact(&h, "profile", "profile:v2", Origin::UserStated, None).unwrap();
        let updated = Ledger::record_contradiction(
            &h,
            next.id,
            "name",
            serde_json::json!("Alice"),
            serde_json::json!("Bob"),
            prior.id,
        )
        .unwrap();
        assert_eq!(updated.status, "review");
        let prior_after = Ledger::get(&h, prior.id).unwrap();
        assert_eq!(prior_after.status, "review");
    }

    #[test]
    fn contradiction_against_low_confidence_fact_does_not_force_review() {
        let (_d, h) = handle();
        let prior = Ledger::register_fact(&h, "profile", "profile:v1", Origin::AiPattern, None).unwrap();
        let next = Ledger::register_fact(&h, "profile", "profile:v2", Origin::AiPattern, None).unwrap();
        let updated = Ledger::record_contradiction(
            &h,
            next.id,
            "mood",
            serde_json::json!("ok"),
            serde_json::json!("great"),
            prior.id,
        )
        .unwrap();
        assert_eq!(updated.status, "unvetted");
    }

    #[test]
    fn resolve_confirm_sets_trusted_and_raises_confidence() {
        let (_d, h) = handle();
        let prior = Ledger::register_fact(&h, "profile", "profile:v1", Origin::UserStated, None).unwrap();
        let next = Ledger::register_fact(&h, "profile", "profile:v2", Origin::UserStated, None).unwrap();
        Ledger::record_contradiction(&h, next.id, "name", serde_json::json!("Alice"), serde_json::json!("Bob"), prior.id).unwrap();

        let resolved = Ledger::resolve(&h, next.id, ResolveAction::Confirm).unwrap();
        assert_eq!(resolved.status, "trusted");
        assert!((resolved.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn resolve_keep_both_reactivates_prior_and_current() {
        let (_d, h) = handle();
        let prior = Ledger::register_fact(&h, "profile", "profile:v1", Origin::UserStated, None).unwrap();
        let next = Ledger::register_fact(&h, "profile", "profile:v2", Origin::UserStated, None).unwrap();
        Ledger::record_contradiction(&h, next.id, "name", serde_json::json!("Alice"), serde_json::json!("Bob"), prior.id).unwrap();

        let resolved = Ledger::resolve(&h, next.id, ResolveAction::KeepBoth).unwrap();
        assert_eq!(resolved.status, "active");
        assert_eq!(Ledger::get(&h, prior.id).unwrap().status, "active");
    }

    #[test]
    fn resolve_on_non_review_row_is_invalid_state() {
        let (_d, h) = handle();
        let meta = Ledger::register_fact(&h, "fact", "table:1", Origin::AiStated, None).unwrap();
        let err = Ledger::resolve(&h, meta.id, ResolveAction::Confirm);
        assert!(matches!(err, Err(LedgerError::InvalidState(_))));
    }

    #[test]
    fn re_registering_same_source_ref_reinforces_instead_of_duplicating() {
        let (_d, h) = handle();
        let first = Ledger::register_fact(&h, "fact", "table:1", Origin::AiStated, None).unwrap();
        let second = Ledger::register_fact(&h, "fact", "table:1", Origin::AiStated, None).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.access_count, 1);
    }

    #[test]
    fn promote_history_is_append_only() {
        let (_d, h) = handle();
        let meta = Ledger::register_fact(&h, "fact", "table:1", Origin::AiInferred, None).unwrap();
        let mut last = meta;
        let mut prev_len = 0;
        for _ in 0..6 {
            last = Ledger::reinforce(&h, last.id).unwrap();
            assert!(last.promote_history.len() >= prev_len);
            prev_len = last.promote_history.len();
        }
    }
}
