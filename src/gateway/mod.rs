/// Payment-gated premium verification.
///
/// A machine client presents a ledger payment signature; the gateway
/// resolves it against the ledger, enforces the payment policy, consumes
/// the proof exactly once, and returns a receipt. Replay of a spent proof
/// is rejected by the receipt table's uniqueness constraint, which also
/// settles two concurrent requests racing the same proof.
use std::sync::Arc;

use crate::anchor::{BackendError, PaymentLedger};
use crate::config::PaymentConfig;
use crate::error::{Result, SkyproofError};
use crate::store::models::PaymentReceipt;
use crate::store::{repository, Database};

/// Longest signature string accepted before the ledger is even consulted.
const MAX_SIGNATURE_LEN: usize = 128;

pub struct VerificationGateway {
    db: Database,
    ledger: Arc<dyn PaymentLedger>,
    policy: PaymentConfig,
}

impl VerificationGateway {
    pub fn new(db: Database, ledger: Arc<dyn PaymentLedger>, policy: PaymentConfig) -> Self {
        Self { db, ledger, policy }
    }

    pub fn policy(&self) -> &PaymentConfig {
        &self.policy
    }

    /// Verify a payment proof and issue a single-use receipt.
    ///
    /// Error mapping is part of the contract: a transient ledger failure
    /// is `Unavailable` (the caller retries with the same proof, never
    /// re-pays), a bad proof is `Validation`, a spent proof is `Conflict`.
    pub async fn verify(
        &self,
        proof_signature: &str,
        evidence_id: Option<&str>,
    ) -> Result<PaymentReceipt> {
        let proof_signature = proof_signature.trim();
        if proof_signature.is_empty() || proof_signature.len() > MAX_SIGNATURE_LEN {
            return Err(SkyproofError::Validation(
                "malformed payment proof signature".to_string(),
            ));
        }
        if !proof_signature.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SkyproofError::Validation(
                "payment proof signature must be alphanumeric".to_string(),
            ));
        }

        // Resolve the evidence reference before consuming the proof, so a
        // typo'd id cannot burn a payment.
        let consumed_for = match evidence_id {
            Some(id) => {
                let job = repository::get_job(self.db.pool(), id).await?;
                if job.is_none() {
                    return Err(SkyproofError::NotFound(format!("evidence '{id}' not found")));
                }
                Some(format!("evidence:{id}"))
            }
            None => None,
        };

        let fact = match self.ledger.lookup_payment(proof_signature).await {
            Ok(Some(fact)) => fact,
            Ok(None) => {
                return Err(SkyproofError::Validation(
                    "payment transaction not found on ledger".to_string(),
                ));
            }
            Err(BackendError::Transient(reason)) => {
                tracing::warn!(reason = %reason, "payment ledger lookup failed transiently");
                return Err(SkyproofError::Unavailable(
                    "payment ledger temporarily unreachable, retry with the same proof"
                        .to_string(),
                ));
            }
            Err(BackendError::Permanent(reason)) => {
                return Err(SkyproofError::Validation(format!(
                    "payment proof rejected by ledger: {reason}"
                )));
            }
        };

        if !fact.finalized {
            return Err(SkyproofError::Unavailable(
                "payment not yet finalized, retry with the same proof".to_string(),
            ));
        }
        if fact.recipient != self.policy.wallet_address {
            return Err(SkyproofError::Validation(
                "payment recipient does not match service wallet".to_string(),
            ));
        }
        if !self.policy.supported_tokens.contains(&fact.token) {
            return Err(SkyproofError::Validation(format!(
                "unsupported payment token '{}'",
                fact.token
            )));
        }
        let paid: f64 = fact.amount.parse().unwrap_or(0.0);
        let minimum: f64 = self.policy.min_payment.parse().unwrap_or(0.0);
        if paid < minimum {
            return Err(SkyproofError::Validation(format!(
                "insufficient payment: {} < {}",
                fact.amount, self.policy.min_payment
            )));
        }

        let receipt = repository::insert_receipt(
            self.db.pool(),
            repository::NewReceipt {
                proof_signature,
                amount: &fact.amount,
                token: &fact.token,
                payer_wallet: fact.payer_wallet.as_deref(),
                consumed_for: consumed_for.as_deref(),
            },
        )
        .await?;

        tracing::info!(
            proof_signature = %receipt.proof_signature,
            amount = %receipt.amount,
            token = %receipt.token,
            "payment proof consumed"
        );

        Ok(receipt)
    }
}
