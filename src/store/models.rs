/// Database models for skyproof.
///
/// These structs map directly to SQLite tables and are used for both
/// reading and writing via sqlx. Timestamps are unix milliseconds.
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of an evidence job.
///
/// Transitions are monotonic: `Pending -> Leased -> {Anchored,
/// FailedRetryable, FailedTerminal}`, with `FailedRetryable` feeding back
/// into `Leased` on the next claim. `Anchored` is entered at most once and
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Anchored,
    FailedRetryable,
    FailedTerminal,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::Anchored => "anchored",
            JobStatus::FailedRetryable => "failed_retryable",
            JobStatus::FailedTerminal => "failed_terminal",
        }
    }
}

/// An evidence anchoring job.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EvidenceJob {
    pub id: String,
    /// sha-256 digest of the evidence payload, 64 lowercase hex chars.
    pub digest_hex: String,
    pub payload_mime: Option<String>,
    /// Opaque JSON blob, stored verbatim.
    pub metadata: Option<String>,
    pub status: JobStatus,
    /// Submission attempts actually made against the ledger.
    pub attempts: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_ms: Option<i64>,
    /// Earliest re-lease time while `failed_retryable`.
    pub next_retry_ms: Option<i64>,
    pub last_error: Option<String>,
    /// Ledger transaction reference once a submission succeeded.
    pub tx_handle: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
}

/// Terminal or retry transition written by a lease holder.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Ledger finality reached. `tx_handle` overrides the stored handle when
    /// present (duplicate-digest adoption); `None` keeps what
    /// `record_submission` wrote.
    Anchored { tx_handle: Option<String> },
    /// Transient failure; eligible for re-lease at `next_retry_ms`.
    /// `retain_tx` keeps the recorded handle so the next lease re-polls
    /// instead of re-submitting.
    FailedRetryable {
        error: String,
        next_retry_ms: i64,
        retain_tx: bool,
    },
    /// Permanent failure; never retried.
    FailedTerminal { error: String },
}

/// A consumed payment proof.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub id: String,
    /// Ledger transaction signature presented as payment evidence.
    /// Globally unique; reuse is rejected by constraint.
    pub proof_signature: String,
    pub amount: String,
    pub token: String,
    pub payer_wallet: Option<String>,
    /// What this payment unlocked, e.g. `evidence:<id>`.
    pub consumed_for: Option<String>,
    pub issued_ms: i64,
}
