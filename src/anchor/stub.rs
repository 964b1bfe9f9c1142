/// Deterministic in-process backend for development and wiring tests.
///
/// Submissions succeed instantly with a digest-derived handle; finality
/// arrives after a configurable number of polls. Payment lookups accept
/// any signature and credit the configured wallet, which keeps the
/// premium path exercisable without a cluster.
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{AnchorBackend, BackendError, PaymentFact, PaymentLedger, PollStatus, TxHandle};

pub struct StubBackend {
    /// Polls before a transaction reports `Finalized`.
    finalize_after: u32,
    /// Wallet credited on payment lookups.
    payment_wallet: String,
    poll_counts: Mutex<HashMap<String, u32>>,
}

impl StubBackend {
    pub fn new(finalize_after: u32, payment_wallet: impl Into<String>) -> Self {
        Self {
            finalize_after,
            payment_wallet: payment_wallet.into(),
            poll_counts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(0, "stub-wallet")
    }
}

#[async_trait]
impl AnchorBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    async fn submit(&self, digest_hex: &str) -> Result<TxHandle, BackendError> {
        let signature = hex::encode(Sha256::digest(digest_hex.as_bytes()));
        Ok(TxHandle(format!("stub:{signature}")))
    }

    async fn poll(&self, tx: &TxHandle) -> Result<PollStatus, BackendError> {
        let mut counts = self
            .poll_counts
            .lock()
            .map_err(|_| BackendError::Transient("poll counter poisoned".to_string()))?;
        let count = counts.entry(tx.0.clone()).or_insert(0);
        *count += 1;

        if *count > self.finalize_after {
            Ok(PollStatus::Finalized)
        } else {
            Ok(PollStatus::Pending)
        }
    }
}

#[async_trait]
impl PaymentLedger for StubBackend {
    async fn lookup_payment(&self, signature: &str) -> Result<Option<PaymentFact>, BackendError> {
        if signature.is_empty() {
            return Ok(None);
        }
        Ok(Some(PaymentFact {
            finalized: true,
            amount: "0.01".to_string(),
            token: "USDC".to_string(),
            payer_wallet: Some("stub-payer".to_string()),
            recipient: self.payment_wallet.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finalizes_after_configured_polls() {
        let backend = StubBackend::new(2, "w");
        let tx = backend.submit("00".repeat(32).as_str()).await.unwrap();

        assert_eq!(backend.poll(&tx).await.unwrap(), PollStatus::Pending);
        assert_eq!(backend.poll(&tx).await.unwrap(), PollStatus::Pending);
        assert_eq!(backend.poll(&tx).await.unwrap(), PollStatus::Finalized);
    }

    #[tokio::test]
    async fn submission_is_stable_per_digest() {
        let backend = StubBackend::default();
        let a = backend.submit("ab".repeat(32).as_str()).await.unwrap();
        let b = backend.submit("ab".repeat(32).as_str()).await.unwrap();
        assert_eq!(a, b);
    }
}
