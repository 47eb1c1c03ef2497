//! Vector collections and the embedding provider seam (spec §3, §4.5).
//!
//! Mirrors the teacher's `VectorStore` trait shape (an async capability
//! object with an availability check rather than a hard dependency): when no
//! provider is configured, or the configured one is unreachable, writes fall
//! back to a `pending_vectors` queue that the daemon drains once a provider
//! comes back online, instead of blocking or failing the write.

use crate::error::EmbeddingError;
use crate::tenant::TenantHandle;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Cheap liveness check; callers should not attempt `embed` when this
    /// returns `false`.
    async fn is_available(&self) -> bool;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
    fn dimensions(&self) -> u32;
}

/// Default provider when `EMBEDDING_PROVIDER_KEY` is unset. Always reports
/// unavailable so callers route straight to the pending-vector queue.
pub struct NullEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for NullEmbeddingProvider {
    async fn is_available(&self) -> bool {
        false
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Unavailable("no embedding provider configured".to_string()))
    }
    fn dimensions(&self) -> u32 {
        0
    }
}

/// Calls an OpenAI-compatible embeddings endpoint over HTTP.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    dims: u32,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, dims: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn is_available(&self) -> bool {
        self.client
            .get(&self.endpoint)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().as_u16() == 405)
            .unwrap_or(false)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "input": text }))
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(EmbeddingError::Unavailable(format!("status {}", resp.status())));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
        let vector = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| EmbeddingError::Unavailable("missing embedding in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect();
        Ok(vector)
    }

    fn dimensions(&self) -> u32 {
        self.dims
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorEntry {
    pub id: i64,
    pub collection: String,
    pub text: String,
    pub has_embedding: bool,
}

pub struct VectorStore;

impl VectorStore {
    pub fn ensure_collection(handle: &TenantHandle, name: &str, embedding_dim: Option<u32>) -> Result<(), rusqlite::Error> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        conn.execute(
            "INSERT INTO vector_collections (name, embedding_dim, entry_count) VALUES (?1, ?2, 0)
             ON CONFLICT(name) DO NOTHING",
            params![name, embedding_dim],
        )?;
        Ok(())
    }

    /// Inserts `text` into `collection`. When `embedding` is `Some`, it is
    /// stored directly; otherwise the row lands in `pending_vectors` for the
    /// daemon to backfill once a provider is available.
    pub fn insert(
        handle: &TenantHandle,
        collection: &str,
        text: &str,
        embedding: Option<Vec<f32>>,
        metadata: serde_json::Value,
    ) -> Result<i64, rusqlite::Error> {
        Self::ensure_collection(handle, collection, None)?;
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let ts = chrono::Utc::now().timestamp_millis();

        if let Some(vec) = embedding {
            let embedding_json = serde_json::to_string(&vec).unwrap_or_default();
            conn.execute(
                "INSERT INTO vectors (collection, text, embedding, metadata, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![collection, text, embedding_json, metadata.to_string(), ts],
            )?;
            conn.execute(
                "UPDATE vector_collections SET entry_count = entry_count + 1 WHERE name = ?1",
                params![collection],
            )?;
            Ok(conn.last_insert_rowid())
        } else {
            conn.execute(
                "INSERT INTO pending_vectors (collection, text, metadata, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
                params![collection, text, metadata.to_string(), ts],
            )?;
            Ok(-conn.last_insert_rowid())
        }
    }

    /// Drains up to `limit` pending rows, embedding them via `provider` and
    /// promoting successes into `vectors`. Returns the number embedded.
    /// Rows whose embedding attempt fails stay pending with `attempts`
    /// incremented, to be retried on the next scan.
    pub async fn flush_pending(
        handle: &TenantHandle,
        provider: &dyn EmbeddingProvider,
        limit: u32,
    ) -> Result<u64, rusqlite::Error> {
        if !provider.is_available().await {
            return Ok(0);
        }
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let mut stmt = conn.prepare(
            "SELECT id, collection, text, metadata FROM pending_vectors ORDER BY id LIMIT ?1",
        )?;
        let rows: Vec<(i64, String, String, String)> = stmt
            .query_map(params![limit], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut embedded = 0u64;
        for (id, collection, text, metadata) in rows {
            match provider.embed(&text).await {
                Ok(vec) => {
                    let embedding_json = serde_json::to_string(&vec).unwrap_or_default();
                    let ts = chrono::Utc::now().timestamp_millis();
                    conn.execute(
                        "INSERT INTO vectors (collection, text, embedding, metadata, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![collection, text, embedding_json, metadata, ts],
                    )?;
                    conn.execute("DELETE FROM pending_vectors WHERE id = ?1", params![id])?;
                    conn.execute(
                        "UPDATE vector_collections SET entry_count = entry_count + 1 WHERE name = ?1",
                        params![collection],
                    )?;
                    embedded += 1;
                }
                Err(_) => {
                    conn.execute(
                        "UPDATE pending_vectors SET attempts = attempts + 1 WHERE id = ?1",
                        params![id],
                    )?;
                }
            }
        }
        Ok(embedded)
    }

    /// Cosine-similarity search over embedded rows in `collection`. Rows
    /// still pending embedding are invisible to search until flushed.
    pub fn search(
        handle: &TenantHandle,
        collection: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(VectorEntry, f32)>, rusqlite::Error> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let mut stmt = conn.prepare(
            "SELECT id, collection, text, embedding FROM vectors WHERE collection = ?1 AND deleted_at_ms IS NULL",
        )?;
        let rows: Vec<(i64, String, String, Option<String>)> = stmt
            .query_map(params![collection], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut scored: Vec<(VectorEntry, f32)> = rows
            .into_iter()
            .filter_map(|(id, collection, text, embedding_json)| {
                let embedding_json = embedding_json?;
                let embedding: Vec<f32> = serde_json::from_str(&embedding_json).ok()?;
                let score = cosine_similarity(query_embedding, &embedding);
                Some((
                    VectorEntry { id, collection, text, has_embedding: true },
                    score,
                ))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn pending_count(handle: &TenantHandle) -> Result<i64, rusqlite::Error> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        conn.query_row("SELECT COUNT(*) FROM pending_vectors", [], |r| r.get(0))
    }

    /// Links an embedded row to its ledger entry. No-op for rows still in
    /// `pending_vectors`; the daemon calls this again once they're flushed.
    pub fn set_meta_ref(handle: &TenantHandle, id: i64, meta_id: i64) -> Result<(), rusqlite::Error> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        conn.execute("UPDATE vectors SET meta_ref = ?1 WHERE id = ?2", params![meta_id, id])?;
        Ok(())
    }

    /// Last-resort durable fallback when even `pending_vectors` insertion
    /// fails: the raw text is never lost (spec §4.5 step 3).
    pub fn write_backlog(
        handle: &TenantHandle,
        collection: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<i64, rusqlite::Error> {
        let conn = handle.connect().map_err(|_| rusqlite::Error::InvalidQuery)?;
        let ts = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO memory_backlog (collection, text, metadata, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![collection, text, metadata.to_string(), ts],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
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
    fn insert_without_embedding_lands_in_pending_queue() {
        let (_d, h) = handle();
        let id = VectorStore::insert(&h, "memories", "hello world", None, serde_json::json!({})).unwrap();
        assert!(id < 0, "pending rows are reported with a negative id sentinel");
        assert_eq!(VectorStore::pending_count(&h).unwrap(), 1);
    }

    #[test]
    fn insert_with_embedding_is_searchable() {
        let (_d, h) = handle();
        VectorStore::insert(&h, "memories", "cats are great", Some(vec![1.0, 0.0]), serde_json::json!({})).unwrap();
        VectorStore::insert(&h, "memories", "dogs are great", Some(vec![0.0, 1.0]), serde_json::json!({})).unwrap();
        let results = VectorStore::search(&h, "memories", &[1.0, 0.0], 5).unwrap();
        assert_eq!(results[0].0.text, "cats are great");
    }

    #[tokio::test]
    async fn flush_pending_is_noop_when_provider_unavailable() {
        let (_d, h) = handle();
        VectorStore::insert(&h, "memories", "hello", None, serde_json::json!({})).unwrap();
        let n = VectorStore::flush_pending(&h, &NullEmbeddingProvider, 10).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(VectorStore::pending_count(&h).unwrap(), 1);
    }
}
