//! Memoria enrichment daemon.
//!
//! A long-running process separate from the gateway that periodically
//! sweeps every tenant: drains pending enrichment jobs, scans the ledger
//! for decay candidates, and flushes the pending-vector backlog. The
//! gateway itself only enqueues work and best-effort wakes an in-process
//! listener; this daemon is the out-of-band sweep that still makes
//! forward progress if the gateway process never ran a listener, was
//! restarted, or dropped a wake signal under backpressure (spec §5).

use std::sync::Arc;

use memoria_core::config::Config;
use memoria_core::enrichment::EnrichmentWorker;
use memoria_core::ledger::Ledger;
use memoria_core::tenant::TenantManager;
use memoria_core::vectors::{EmbeddingProvider, HttpEmbeddingProvider, NullEmbeddingProvider};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Jobs pulled per tenant per tick; keeps a single slow tenant from
/// starving the rest of the sweep.
const JOBS_PER_TICK: u32 = 50;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[memoria-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load();
    let tenants = Arc::new(TenantManager::new(config.data_dir.clone()).expect("open tenant registry"));
    let embedding_provider: Arc<dyn EmbeddingProvider> = match &config.embedding_provider_key {
        Some(key) if !key.is_empty() => Arc::new(HttpEmbeddingProvider::new(
            std::env::var("EMBEDDING_ENDPOINT").unwrap_or_default(),
            key.clone(),
            std::env::var("EMBEDDING_DIMS").ok().and_then(|v| v.parse().ok()).unwrap_or(1536),
        )),
        _ => Arc::new(NullEmbeddingProvider),
    };

    tracing::info!(
        tick_rate_secs = config.tick_rate.as_secs(),
        data_dir = %config.data_dir.display(),
        "memoria daemon started"
    );

    let mut interval = tokio::time::interval(config.tick_rate);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tick(Arc::clone(&tenants), Arc::clone(&embedding_provider)).await {
                    tracing::warn!(error = %e, "daemon tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }
}

async fn tick(
    tenants: Arc<TenantManager>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for tenant_id in tenants.list_tenant_ids()? {
        let handle = match tenants.tenant(&tenant_id) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(%tenant_id, error = %e, "skipping tenant, could not open handle");
                continue;
            }
        };

        match EnrichmentWorker::drain(&handle, embedding_provider.as_ref(), JOBS_PER_TICK).await {
            Ok(processed) if processed > 0 => {
                tracing::debug!(%tenant_id, processed, "enrichment jobs drained");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(%tenant_id, error = %e, "enrichment drain failed"),
        }

        match Ledger::decay_scan(&handle) {
            Ok(decayed) if decayed > 0 => {
                tracing::debug!(%tenant_id, decayed, "ledger rows decayed");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(%tenant_id, error = %e, "ledger decay scan failed"),
        }
    }

    Ok(())
}
