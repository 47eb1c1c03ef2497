//! Shared application state handed to every axum handler.

use std::sync::Arc;

use memoria_core::config::Config;
use memoria_core::enrichment::EnrichmentQueue;
use memoria_core::tenant::TenantManager;
use memoria_core::vectors::{EmbeddingProvider, HttpEmbeddingProvider, NullEmbeddingProvider};

use crate::auth::AuthRegistry;
use crate::payment::{NullPaymentGate, PaymentGate};
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<TenantManager>,
    pub queue: EnrichmentQueue,
    pub embedding_provider: Arc<dyn EmbeddingProvider>,
    pub config: Arc<Config>,
    pub auth: Arc<AuthRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub payment_gate: Arc<dyn PaymentGate>,
}

impl AppState {
    pub fn new(config: Config, queue: EnrichmentQueue) -> Result<Self, memoria_core::error::TenantError> {
        let tenants = TenantManager::new(config.data_dir.clone())?;
        let embedding_provider: Arc<dyn EmbeddingProvider> = match &config.embedding_provider_key {
            Some(key) if !key.is_empty() => Arc::new(HttpEmbeddingProvider::new(
                std::env::var("EMBEDDING_ENDPOINT").unwrap_or_default(),
                key.clone(),
                std::env::var("EMBEDDING_DIMS").ok().and_then(|v| v.parse().ok()).unwrap_or(1536),
            )),
            _ => Arc::new(NullEmbeddingProvider),
        };
        Ok(Self {
            tenants: Arc::new(tenants),
            queue,
            embedding_provider,
            config: Arc::new(config),
            auth: Arc::new(AuthRegistry::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
            payment_gate: Arc::new(NullPaymentGate),
        })
    }
}
