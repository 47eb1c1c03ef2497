//! Write Ingestion Pipeline (spec §4.5).
//!
//! The single funnel every agent-authored write passes through: consent
//! check, identity-safety guard, durable write, ledger registration,
//! contradiction-vs-reinforcement branching, enrichment enqueue, audit.
//! Steps 1-5 and 7 can fail the call; step 6 (enrichment) never does —
//! its error is logged and swallowed, matching the teacher's
//! best-effort-background-work idiom already used for `flush_pending`.

use crate::claims::ClaimsLedger;
use crate::consent::{Action, ConsentEngine};
use crate::enrichment::{EnrichmentQueue, JobKind};
use crate::error::{IngestError, ProfileError};
use crate::ledger::{Ledger, Origin};
use crate::profile::ProfileStore;
use crate::tables::TableStore;
use crate::tenant::TenantHandle;
use crate::vectors::{EmbeddingProvider, VectorStore};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum IngestKind {
    Profile,
    TableRow { table: String },
    MemoryText { collection: String },
}

impl IngestKind {
    fn resource(&self) -> String {
        match self {
            IngestKind::Profile => "profile".to_string(),
            IngestKind::TableRow { table } => format!("tables/{table}"),
            IngestKind::MemoryText { collection } => format!("vectors/{collection}"),
        }
    }

    fn source_type(&self) -> &'static str {
        match self {
            IngestKind::Profile => "profile",
            IngestKind::TableRow { .. } => "table_row",
            IngestKind::MemoryText { .. } => "memory_text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Accepted,
    PendingEnrichment,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub write_id: String,
    pub write_status: WriteStatus,
    pub source_ref: String,
    pub meta_id: i64,
    pub job_id: Option<i64>,
}

pub struct IngestPipeline;

impl IngestPipeline {
    /// Runs steps 1-8 of the write-ingestion pipeline for `kind`. `payload`
    /// is the patch (profile), row (table_row), or `{text, metadata?}`
    /// (memory_text).
    pub async fn ingest(
        handle: &TenantHandle,
        queue: &EnrichmentQueue,
        embedding_provider: &dyn EmbeddingProvider,
        kind: IngestKind,
        payload: Value,
        origin: Origin,
        changed_by: &str,
        agent_id: &str,
        write_id: &str,
    ) -> Result<IngestResult, IngestError> {
        let resource = kind.resource();

        // 1. Authorization.
        let allowed = ConsentEngine::check(handle, agent_id, &resource, Action::Write)
            .map_err(|_| IngestError::ConsentDenied(resource.clone()))?;
        if !allowed {
            return Err(IngestError::ConsentDenied(resource));
        }

        match kind {
            IngestKind::Profile => Self::ingest_profile(handle, queue, payload, origin, changed_by, write_id).await,
            IngestKind::TableRow { table } => {
                Self::ingest_table_row(handle, queue, &table, payload, origin, agent_id, write_id).await
            }
            IngestKind::MemoryText { collection } => {
                Self::ingest_memory_text(handle, queue, embedding_provider, &collection, payload, origin, agent_id, write_id).await
            }
        }
    }

    async fn ingest_profile(
        handle: &TenantHandle,
        queue: &EnrichmentQueue,
        patch: Value,
        origin: Origin,
        changed_by: &str,
        write_id: &str,
    ) -> Result<IngestResult, IngestError> {
        // 2. Identity safety + 3. durable write (deep-merge + version insert).
        let before = ProfileStore::current(handle)?;
        let version = match ProfileStore::patch(handle, patch.clone(), changed_by) {
            Ok(v) => v,
            Err(ProfileError::IdentityConflict) => {
                return Err(IngestError::IdentityConflict(
                    "patch would overwrite the identity field with a known family member name".to_string(),
                ));
            }
            Err(e) => return Err(IngestError::from(e)),
        };
        let source_ref = format!("profile:v{}", version.version);

        // 4. Ledger.
        let meta = Ledger::register_fact(handle, "profile", &source_ref, origin, None)?;
        ProfileStore::set_meta_ref(handle, version.version, meta.id)?;

        // 5. Contradiction / reinforcement, per leaf path present in the
        // incoming patch (not just `changed_fields`, since an unchanged
        // leaf is a reinforcement of the prior fact rather than a no-op).
        // Every leaf is also logged as a knowledge claim regardless of
        // whether a prior value existed to compare against.
        let prior_meta_id = before.as_ref().and_then(|b| b.meta_ref);
        let mut leaves = Vec::new();
        collect_leaves(&patch, "", &mut leaves);
        for path in &leaves {
            let Some(new_value) = get_path(&version.data, path) else { continue };
            record_claim_best_effort(
                handle, "fact", "profile", path, &new_value.to_string(),
                meta.confidence, origin.as_str(), &source_ref, meta.id,
            );
            let Some(prior_meta_id) = prior_meta_id else { continue };
            let Some(before) = &before else { continue };
            let Some(old_value) = get_path(&before.data, path) else { continue };
            if old_value == *new_value {
                let _ = Ledger::reinforce(handle, prior_meta_id);
            } else {
                let _ = Ledger::record_contradiction(
                    handle, meta.id, path, old_value.clone(), new_value.clone(), prior_meta_id,
                );
            }
        }

        Self::finish(handle, queue, JobKind::EntityExtraction, &source_ref, meta.id, write_id, WriteStatus::Accepted).await
    }

    async fn ingest_table_row(
        handle: &TenantHandle,
        queue: &EnrichmentQueue,
        table: &str,
        row: Value,
        origin: Origin,
        agent_id: &str,
        write_id: &str,
    ) -> Result<IngestResult, IngestError> {
        if !crate::tables::is_safe_identifier(table) {
            return Err(IngestError::InvalidCollection(table.to_string()));
        }
        // 3. Durable write: auto-create table, infer/extend schema, insert.
        let record = TableStore::insert(handle, table, row)?;
        let source_ref = format!("table:{table}:{}", record.id);

        // 4. Ledger.
        let meta = Ledger::register_fact(handle, "table_row", &source_ref, origin, Some(agent_id))?;
        TableStore::set_meta_ref(handle, table, record.id, meta.id)?;
        record_claim_best_effort(
            handle, "table_row", table, "row", &record.data.to_string(),
            meta.confidence, origin.as_str(), &source_ref, meta.id,
        );

        // Step 5 (contradiction detection) does not apply: table rows have
        // no prior-value concept independent of the identity the caller
        // assigns each insert, so each row is its own fact.

        Self::finish(handle, queue, JobKind::EntityExtraction, &source_ref, meta.id, write_id, WriteStatus::Accepted).await
    }

    async fn ingest_memory_text(
        handle: &TenantHandle,
        queue: &EnrichmentQueue,
        embedding_provider: &dyn EmbeddingProvider,
        collection: &str,
        payload: Value,
        origin: Origin,
        agent_id: &str,
        write_id: &str,
    ) -> Result<IngestResult, IngestError> {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| IngestError::InvalidArgs("memory_text payload requires a \"text\" field".to_string()))?;
        let metadata = payload.get("metadata").cloned().unwrap_or_else(|| serde_json::json!({}));

        // 3. Durable write, tiered fallback: embed -> vector, else pending,
        // else memory_backlog so the text is never lost.
        let embedding = if embedding_provider.is_available().await {
            embedding_provider.embed(text).await.ok()
        } else {
            None
        };
        let degraded = embedding.is_none();

        let vector_id = match VectorStore::insert(handle, collection, text, embedding, metadata.clone()) {
            Ok(id) => id,
            Err(_) => {
                warn!(collection, "pending_vectors insert failed, writing memory_backlog as a last resort");
                let backlog_id = VectorStore::write_backlog(handle, collection, text, metadata)?;
                -backlog_id
            }
        };
        let source_ref = format!("vector:{collection}:{}", vector_id.abs());

        // 4. Ledger.
        let meta = Ledger::register_fact(handle, "memory_text", &source_ref, origin, Some(agent_id))?;
        if vector_id > 0 {
            VectorStore::set_meta_ref(handle, vector_id, meta.id)?;
        }
        record_claim_best_effort(
            handle, "memory_text", collection, "text", text,
            meta.confidence, origin.as_str(), &source_ref, meta.id,
        );

        // Step 5 does not apply: free-text memories carry no prior-value
        // field to diff against.

        let status = if degraded { WriteStatus::PendingEnrichment } else { WriteStatus::Accepted };
        Self::finish(handle, queue, JobKind::VectorEmbed, &source_ref, meta.id, write_id, status).await
    }

    /// Steps 6-8, shared by every kind: enrichment enqueue (best-effort),
    /// audit log, and the `{writeId, writeStatus, sourceRef, meta_id,
    /// jobId?}` return.
    async fn finish(
        handle: &TenantHandle,
        queue: &EnrichmentQueue,
        job_kind: JobKind,
        source_ref: &str,
        meta_id: i64,
        write_id: &str,
        status: WriteStatus,
    ) -> Result<IngestResult, IngestError> {
        let job_id = match queue.enqueue(handle, job_kind, source_ref, Some(meta_id), Some(write_id)) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(source_ref, %e, "enrichment enqueue failed, write remains durable and accepted");
                None
            }
        };

        append_audit(handle, None, "ingest", source_ref)?;
        info!(source_ref, meta_id, "write ingested");

        Ok(IngestResult {
            write_id: write_id.to_string(),
            write_status: status,
            source_ref: source_ref.to_string(),
            meta_id,
            job_id,
        })
    }
}

/// Logs one knowledge claim for an ingested leaf/record/text. Best-effort:
/// the explain-trail is a convenience, not a durability guarantee, so a
/// failure here is logged and swallowed rather than failing the write.
#[allow(clippy::too_many_arguments)]
fn record_claim_best_effort(
    handle: &TenantHandle,
    claim_type: &str,
    subject: &str,
    predicate: &str,
    object: &str,
    confidence: f64,
    origin: &str,
    source_ref: &str,
    meta_id: i64,
) {
    if let Err(e) = ClaimsLedger::record(
        handle, claim_type, subject, predicate, object, confidence, Some("direct_write"),
        origin, Some(source_ref), None, Some(meta_id),
    ) {
        warn!(subject, predicate, %e, "knowledge claim record failed, explain-trail entry skipped");
    }
}

fn append_audit(handle: &TenantHandle, agent_id: Option<&str>, action: &str, resource: &str) -> Result<(), IngestError> {
    let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
    let ts = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO audit_log (agent_id, action, resource, details, created_at_ms) VALUES (?1, ?2, ?3, '{}', ?4)",
        rusqlite::params![agent_id, action, resource, ts],
    )?;
    Ok(())
}

/// Recursively collects dotted-path leaves of a patch object (mirrors
/// `profile::collect_changed_fields`'s walk, but over one tree rather than
/// a diff of two).
fn collect_leaves(value: &Value, prefix: &str, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                collect_leaves(v, &path, out);
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.push(prefix.to_string());
            }
        }
    }
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::ConsentEngine;
    use crate::tenant::TenantManager;
    use crate::vectors::NullEmbeddingProvider;

    fn handle() -> (tempfile::TempDir, std::sync::Arc<TenantHandle>) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TenantManager::new(dir.path().to_path_buf()).unwrap();
        let h = mgr.tenant_or_create("alice").unwrap();
        (dir, h)
    }

    #[tokio::test]
    async fn ingest_without_consent_is_denied() {
        let (_d, h) = handle();
        let (q, _rx) = EnrichmentQueue::new();
        let result = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile, serde_json::json!({"name": "Alice"}),
            Origin::UserStated, "agent-1", "agent-1", "w1",
        ).await;
        assert!(matches!(result, Err(IngestError::ConsentDenied(_))));
    }

    #[tokio::test]
    async fn profile_ingest_registers_fact_and_returns_accepted() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "profile", "write").unwrap();
        let (q, _rx) = EnrichmentQueue::new();
        let result = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile, serde_json::json!({"name": "Alice"}),
            Origin::UserStated, "agent-1", "agent-1", "w1",
        ).await.unwrap();
        assert_eq!(result.write_status, WriteStatus::Accepted);
        assert_eq!(result.source_ref, "profile:v1");
        let meta = Ledger::get(&h, result.meta_id).unwrap();
        assert_eq!(meta.status, "trusted");
    }

    #[tokio::test]
    async fn repeating_the_same_profile_value_reinforces_prior_meta() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "profile", "write").unwrap();
        let (q, _rx) = EnrichmentQueue::new();
        let first = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile, serde_json::json!({"mood": "good"}),
            Origin::AiInferred, "agent-1", "agent-1", "w1",
        ).await.unwrap();
        IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile, serde_json::json!({"mood": "good"}),
            Origin::AiInferred, "agent-1", "agent-1", "w2",
        ).await.unwrap();
        let meta = Ledger::get(&h, first.meta_id).unwrap();
        assert_eq!(meta.access_count, 1, "unchanged field reinforces the prior fact");
    }

    #[tokio::test]
    async fn contradicting_a_trusted_profile_field_moves_both_rows_to_review() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "profile", "write").unwrap();
        let (q, _rx) = EnrichmentQueue::new();
        let first = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile, serde_json::json!({"name": "Alice"}),
            Origin::UserStated, "agent-1", "agent-1", "w1",
        ).await.unwrap();
        let second = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile, serde_json::json!({"name": "Bob"}),
            Origin::UserStated, "agent-1", "agent-1", "w2",
        ).await.unwrap();
        assert_eq!(Ledger::get(&h, first.meta_id).unwrap().status, "review");
        assert_eq!(Ledger::get(&h, second.meta_id).unwrap().status, "review");
    }

    #[tokio::test]
    async fn profile_ingest_leaves_a_claim_explain_trail() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "profile", "write").unwrap();
        let (q, _rx) = EnrichmentQueue::new();
        let first = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile, serde_json::json!({"name": "Alice"}),
            Origin::UserStated, "agent-1", "agent-1", "w1",
        ).await.unwrap();
        let trail = crate::claims::ClaimsLedger::explain_trail(&h, &first.source_ref).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].0.subject, "profile");
        assert_eq!(trail[0].0.predicate, "name");
    }

    #[tokio::test]
    async fn identity_conflict_is_surfaced_as_ingest_error() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "profile", "write").unwrap();
        let (q, _rx) = EnrichmentQueue::new();
        IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile,
            serde_json::json!({"name": "Alice", "family": [{"name": "Georgia", "relation": "daughter"}]}),
            Origin::UserStated, "agent-1", "agent-1", "w1",
        ).await.unwrap();
        let result = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::Profile, serde_json::json!({"name": "Georgia"}),
            Origin::UserStated, "agent-1", "agent-1", "w2",
        ).await;
        assert!(matches!(result, Err(IngestError::IdentityConflict(_))));
    }

    #[tokio::test]
    async fn table_row_ingest_auto_creates_table_and_registers_fact() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "tables/workouts", "write").unwrap();
        let (q, _rx) = EnrichmentQueue::new();
        let result = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::TableRow { table: "workouts".to_string() },
            serde_json::json!({"type": "run", "minutes": 30}),
            Origin::AiStated, "agent-1", "agent-1", "w1",
        ).await.unwrap();
        assert_eq!(result.write_status, WriteStatus::Accepted);
        assert!(result.source_ref.starts_with("table:workouts:"));
    }

    #[tokio::test]
    async fn memory_text_without_embedding_provider_degrades_to_pending_enrichment() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "vectors/memories", "write").unwrap();
        let (q, _rx) = EnrichmentQueue::new();
        let result = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::MemoryText { collection: "memories".to_string() },
            serde_json::json!({"text": "I like hiking"}),
            Origin::AiStated, "agent-1", "agent-1", "w1",
        ).await.unwrap();
        assert_eq!(result.write_status, WriteStatus::PendingEnrichment);
    }

    #[tokio::test]
    async fn memory_text_requires_a_text_field() {
        let (_d, h) = handle();
        ConsentEngine::grant(&h, "agent-1", "vectors/memories", "write").unwrap();
        let (q, _rx) = EnrichmentQueue::new();
        let result = IngestPipeline::ingest(
            &h, &q, &NullEmbeddingProvider,
            IngestKind::MemoryText { collection: "memories".to_string() },
            serde_json::json!({}),
            Origin::AiStated, "agent-1", "agent-1", "w1",
        ).await;
        assert!(matches!(result, Err(IngestError::InvalidArgs(_))));
    }
}
