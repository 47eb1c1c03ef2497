//! Payment gate seam (spec §4.8 step 5, §1 Non-goals: x402/billing is out of
//! scope). A trait object so a real metering integration can be dropped in
//! later without touching the request pipeline, mirroring the
//! [`memoria_core::vectors::EmbeddingProvider`] availability-check shape.

use async_trait::async_trait;

#[async_trait]
pub trait PaymentGate: Send + Sync {
    /// `true` when `tenant_id` may proceed with a billable operation.
    /// The stub fails open: an operation is never blocked for lack of a
    /// wired billing provider.
    async fn authorize(&self, tenant_id: &str, operation: &str) -> bool;
}

pub struct NullPaymentGate;

#[async_trait]
impl PaymentGate for NullPaymentGate {
    async fn authorize(&self, _tenant_id: &str, _operation: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_gate_always_authorizes() {
        let gate = NullPaymentGate;
        assert!(gate.authorize("alice", "memorize").await);
    }
}
