//! Knowledge claims (spec §3, "Knowledge Claims (event ledger)").
//!
//! An append-only log of `{subject, predicate, object}` assertions the
//! ingestion pipeline observes while writing a fact, plus a sub-log of
//! status transitions on each claim. Distinct from `memory_meta`: the
//! ledger tracks one row of quality state *per durable fact*, while a
//! claim is a structured record of *what the fact asserted* at the
//! moment it was written, kept for explain-trail queries
//! (`why does the store believe X?`) rather than for primary reads. No
//! facade route reads this table back yet; it exists so a future
//! explain-trail endpoint has history to query, and so re-ingesting a
//! corrected value leaves a trace of what it superseded.

use crate::error::ClaimsError;
use crate::tenant::TenantHandle;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Claim {
    pub id: i64,
    pub claim_type: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f64,
    pub method: Option<String>,
    pub origin: String,
    pub source_ref: Option<String>,
    pub agent_id: Option<String>,
    pub valid_from_ms: i64,
    pub valid_to_ms: Option<i64>,
    pub memory_meta_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimEvent {
    pub id: i64,
    pub claim_id: i64,
    pub from_status: Option<String>,
    pub to_status: String,
    pub at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct ClaimsLedger;

impl ClaimsLedger {
    /// Appends one claim row and its opening `recorded` event. `method`
    /// describes how the claim was derived (e.g. `"direct_write"`,
    /// `"entity_extraction"`); `source_ref`/`memory_meta_id` tie it back
    /// to the durable fact it was observed from, when one exists.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        handle: &TenantHandle,
        claim_type: &str,
        subject: &str,
        predicate: &str,
        object: &str,
        confidence: f64,
        method: Option<&str>,
        origin: &str,
        source_ref: Option<&str>,
        agent_id: Option<&str>,
        memory_meta_id: Option<i64>,
    ) -> Result<Claim, ClaimsError> {
        let conn = handle.connect().map_err(|_| ClaimsError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let ts = now_ms();
        conn.execute(
            "INSERT INTO knowledge_claims
             (claim_type, subject, predicate, object, confidence, method, origin,
              source_ref, agent_id, valid_from_ms, memory_meta_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                claim_type, subject, predicate, object, confidence, method, origin,
                source_ref, agent_id, ts, memory_meta_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::record_event(&conn, id, None, "recorded", ts)?;
        Self::get_conn(&conn, id)
    }

    /// Closes out a claim's validity window (e.g. a contradiction
    /// supersedes it) and logs a `superseded` event.
    pub fn supersede(handle: &TenantHandle, id: i64) -> Result<Claim, ClaimsError> {
        let conn = handle.connect().map_err(|_| ClaimsError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let ts = now_ms();
        let n = conn.execute(
            "UPDATE knowledge_claims SET valid_to_ms = ?1 WHERE id = ?2 AND valid_to_ms IS NULL",
            params![ts, id],
        )?;
        if n == 0 {
            return Err(ClaimsError::NotFound(id));
        }
        Self::record_event(&conn, id, Some("recorded"), "superseded", ts)?;
        Self::get_conn(&conn, id)
    }

    pub fn get(handle: &TenantHandle, id: i64) -> Result<Claim, ClaimsError> {
        let conn = handle.connect().map_err(|_| ClaimsError::Sqlite(rusqlite::Error::InvalidQuery))?;
        Self::get_conn(&conn, id)
    }

    fn get_conn(conn: &rusqlite::Connection, id: i64) -> Result<Claim, ClaimsError> {
        conn.query_row(
            "SELECT id, claim_type, subject, predicate, object, confidence, method, origin,
                    source_ref, agent_id, valid_from_ms, valid_to_ms, memory_meta_id
             FROM knowledge_claims WHERE id = ?1",
            params![id],
            |r| {
                Ok(Claim {
                    id: r.get(0)?,
                    claim_type: r.get(1)?,
                    subject: r.get(2)?,
                    predicate: r.get(3)?,
                    object: r.get(4)?,
                    confidence: r.get(5)?,
                    method: r.get(6)?,
                    origin: r.get(7)?,
                    source_ref: r.get(8)?,
                    agent_id: r.get(9)?,
                    valid_from_ms: r.get(10)?,
                    valid_to_ms: r.get(11)?,
                    memory_meta_id: r.get(12)?,
                })
            },
        )
        .optional()?
        .ok_or(ClaimsError::NotFound(id))
    }

    fn record_event(
        conn: &rusqlite::Connection,
        claim_id: i64,
        from_status: Option<&str>,
        to_status: &str,
        at_ms: i64,
    ) -> Result<(), ClaimsError> {
        conn.execute(
            "INSERT INTO claim_events (claim_id, from_status, to_status, at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![claim_id, from_status, to_status, at_ms],
        )?;
        Ok(())
    }

    /// The explain-trail for a fact: every claim recorded against
    /// `source_ref`, oldest first, each with its event history.
    pub fn explain_trail(handle: &TenantHandle, source_ref: &str) -> Result<Vec<(Claim, Vec<ClaimEvent>)>, ClaimsError> {
        let conn = handle.connect().map_err(|_| ClaimsError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut stmt = conn.prepare(
            "SELECT id FROM knowledge_claims WHERE source_ref = ?1 ORDER BY valid_from_ms ASC",
        )?;
        let ids: Vec<i64> = stmt.query_map(params![source_ref], |r| r.get(0))?.collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let claim = Self::get_conn(&conn, id)?;
            let mut ev_stmt = conn.prepare(
                "SELECT id, claim_id, from_status, to_status, at_ms FROM claim_events WHERE claim_id = ?1 ORDER BY at_ms ASC",
            )?;
            let events = ev_stmt
                .query_map(params![id], |r| {
                    Ok(ClaimEvent {
                        id: r.get(0)?,
                        claim_id: r.get(1)?,
                        from_status: r.get(2)?,
                        to_status: r.get(3)?,
                        at_ms: r.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            out.push((claim, events));
        }
        Ok(out)
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
    fn record_creates_a_recorded_event() {
        let (_d, h) = handle();
        let claim = ClaimsLedger::record(
            &h, "fact", "user", "name", "Alice", 0.85,
            Some("direct_write"), "user_stated", Some("profile:v1"), None, None,
        )
        .unwrap();
        assert!(claim.valid_to_ms.is_none());
        let trail = ClaimsLedger::explain_trail(&h, "profile:v1").unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].1.len(), 1);
        assert_eq!(trail[0].1[0].to_status, "recorded");
    }

    #[test]
    fn supersede_closes_validity_and_logs_event() {
        let (_d, h) = handle();
        let claim = ClaimsLedger::record(
            &h, "fact", "user", "name", "Alice", 0.85,
            Some("direct_write"), "user_stated", Some("profile:v1"), None, None,
        )
        .unwrap();
        let superseded = ClaimsLedger::supersede(&h, claim.id).unwrap();
        assert!(superseded.valid_to_ms.is_some());
        let trail = ClaimsLedger::explain_trail(&h, "profile:v1").unwrap();
        assert_eq!(trail[0].1.len(), 2);
        assert_eq!(trail[0].1[1].to_status, "superseded");
    }

    #[test]
    fn supersede_unknown_claim_is_not_found() {
        let (_d, h) = handle();
        let err = ClaimsLedger::supersede(&h, 999);
        assert!(matches!(err, Err(ClaimsError::NotFound(999))));
    }

    #[test]
    fn explain_trail_orders_oldest_first() {
        let (_d, h) = handle();
        ClaimsLedger::record(&h, "fact", "user", "name", "Alice", 0.85, None, "user_stated", Some("profile:v1"), None, None).unwrap();
        ClaimsLedger::record(&h, "fact", "user", "name", "Bob", 0.85, None, "user_stated", Some("profile:v1"), None, None).unwrap();
        let trail = ClaimsLedger::explain_trail(&h, "profile:v1").unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].0.object, "Alice");
        assert_eq!(trail[1].0.object, "Bob");
    }
}
