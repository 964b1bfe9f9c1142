/// Ledger adapter for evidence anchoring.
///
/// The anchor module isolates every ledger-specific concern (RPC shape,
/// fee handling, confirmation depth) behind a three-state contract:
/// submit a digest, poll the resulting transaction, and report failures
/// as either transient or permanent. The keeper's retry logic consumes
/// only this contract and is ledger-agnostic.
///
/// The same module exposes the ledger-query capability the premium
/// verification gateway needs to validate payment proofs, so both paths
/// share one RPC client.
pub mod solana;
pub mod stub;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque ledger transaction reference returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle(pub String);

impl std::fmt::Display for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend failure classification.
///
/// `Transient` failures (network, timeout, congestion) are retried with
/// backoff; `Permanent` ones (malformed submission, policy violation) are
/// terminal for the job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Finality state of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Not yet final; keep polling.
    Pending,
    /// Irreversible on the ledger.
    Finalized,
    /// Dropped or reverted, with the ledger's reason.
    Rejected(String),
}

/// Facts about a payment transaction, as read from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFact {
    /// Whether the transaction reached finality.
    pub finalized: bool,
    /// Amount received by `recipient` (decimal string).
    pub amount: String,
    /// Token symbol or mint address.
    pub token: String,
    pub payer_wallet: Option<String>,
    pub recipient: String,
}

/// Trait for pluggable anchoring backends.
#[async_trait]
pub trait AnchorBackend: Send + Sync {
    /// Name of the backing ledger (e.g., "solana", "stub").
    fn name(&self) -> &str;

    /// Write a digest to the ledger. Returns a handle for finality polling.
    async fn submit(&self, digest_hex: &str) -> Result<TxHandle, BackendError>;

    /// Check the finality state of a previously submitted transaction.
    async fn poll(&self, tx: &TxHandle) -> Result<PollStatus, BackendError>;
}

/// Ledger-query capability shared with the verification gateway.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Look up a payment transaction by its signature.
    ///
    /// `Ok(None)` means the ledger has no such transaction; transport
    /// failures surface as `Transient` so callers can distinguish
    /// "retry later" from "this proof is bad".
    async fn lookup_payment(&self, signature: &str) -> Result<Option<PaymentFact>, BackendError>;
}

/// Whether a rejection reason indicates a resubmittable condition.
///
/// Fee, congestion and expiry shaped rejections are worth retrying with a
/// fresh submission; anything else is treated as permanent.
pub fn rejection_is_resubmittable(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    ["fee", "congest", "blockhash", "expired", "rate limit", "busy"]
        .iter()
        .any(|marker| reason.contains(marker))
}
