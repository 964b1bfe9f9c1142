/// Repository layer: typed queries for the evidence outbox and payment
/// receipts.
///
/// All cross-worker coordination goes through `claim_batch` and the
/// owner-guarded mutation functions below; each guard is a single
/// conditional UPDATE, so concurrent keepers never need an external lock.
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{EvidenceJob, JobOutcome, PaymentReceipt};
use crate::error::{Result, SkyproofError};

/// Eligibility predicate shared by the claim scan and the claim takeover.
///
/// A job can be claimed when it is pending, when its retry backoff has
/// elapsed, or when a previous holder's lease has expired (crash recovery).
/// `?1` binds the current time in unix millis.
const CLAIMABLE: &str = "(status = 'pending' \
     OR (status = 'failed_retryable' AND next_retry_ms IS NOT NULL AND next_retry_ms <= ?1) \
     OR (status = 'leased' AND lease_expires_ms IS NOT NULL AND lease_expires_ms < ?1))";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ── Evidence jobs ──

pub struct NewJob<'a> {
    /// Client-supplied id; generated when absent.
    pub id: Option<String>,
    pub digest_hex: &'a str,
    pub payload_mime: Option<&'a str>,
    pub metadata: Option<&'a serde_json::Value>,
}

/// Insert a new pending job. Fails with `Conflict` when the id exists.
pub async fn insert_job(pool: &SqlitePool, new: NewJob<'_>) -> Result<EvidenceJob> {
    let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let metadata = new.metadata.map(|m| m.to_string());
    let now = super::now_ms();

    sqlx::query(
        r#"
        INSERT INTO evidence_jobs
            (id, digest_hex, payload_mime, metadata, status, attempts, created_ms, updated_ms)
        VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)
        "#,
    )
    .bind(&id)
    .bind(new.digest_hex)
    .bind(new.payload_mime)
    .bind(&metadata)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            SkyproofError::Conflict(format!("evidence job '{id}' already exists"))
        } else {
            SkyproofError::Database(e)
        }
    })?;

    get_job(pool, &id)
        .await?
        .ok_or_else(|| SkyproofError::NotFound(format!("evidence job '{id}' vanished after insert")))
}

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<EvidenceJob>> {
    let job = sqlx::query_as::<_, EvidenceJob>("SELECT * FROM evidence_jobs WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

/// Newest-first page of jobs plus the total count.
pub async fn list_jobs(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<(Vec<EvidenceJob>, i64)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM evidence_jobs")
        .fetch_one(pool)
        .await?;

    let jobs = sqlx::query_as::<_, EvidenceJob>(
        "SELECT * FROM evidence_jobs ORDER BY created_ms DESC LIMIT ?1 OFFSET ?2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok((jobs, total))
}

/// The job that already anchored this digest, if any.
///
/// Used by workers to adopt a prior anchor instead of writing the same
/// digest to the ledger twice.
pub async fn find_anchored_by_digest(
    pool: &SqlitePool,
    digest_hex: &str,
) -> Result<Option<EvidenceJob>> {
    let job = sqlx::query_as::<_, EvidenceJob>(
        "SELECT * FROM evidence_jobs WHERE digest_hex = ?1 AND status = 'anchored' LIMIT 1",
    )
    .bind(digest_hex)
    .fetch_optional(pool)
    .await?;
    Ok(job)
}

/// Atomically lease up to `limit` eligible jobs to `owner`.
///
/// Candidates are scanned oldest-first (earliest retry time, falling back
/// to creation time), then taken one by one with a conditional UPDATE that
/// re-checks eligibility. A job raced away by another dispatcher simply
/// fails its UPDATE and is skipped; the two claimers can never both win.
pub async fn claim_batch(
    pool: &SqlitePool,
    owner: &str,
    limit: i64,
    lease_ms: i64,
    now_ms: i64,
) -> Result<Vec<EvidenceJob>> {
    let candidates: Vec<String> = sqlx::query_scalar(&format!(
        "SELECT id FROM evidence_jobs WHERE {CLAIMABLE} \
         ORDER BY COALESCE(next_retry_ms, created_ms) ASC LIMIT ?2"
    ))
    .bind(now_ms)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for id in candidates {
        let taken = sqlx::query(&format!(
            "UPDATE evidence_jobs \
             SET status = 'leased', lease_owner = ?3, lease_expires_ms = ?4, updated_ms = ?1 \
             WHERE id = ?2 AND {CLAIMABLE}"
        ))
        .bind(now_ms)
        .bind(&id)
        .bind(owner)
        .bind(now_ms + lease_ms)
        .execute(pool)
        .await?;

        if taken.rows_affected() == 1 {
            if let Some(job) = get_job(pool, &id).await? {
                claimed.push(job);
            }
        }
    }

    Ok(claimed)
}

/// Count a real submission attempt. Returns the new attempt count, or
/// `None` when the caller no longer holds the lease.
pub async fn record_attempt(pool: &SqlitePool, id: &str, owner: &str) -> Result<Option<i64>> {
    let updated = sqlx::query(
        "UPDATE evidence_jobs SET attempts = attempts + 1, updated_ms = ?3 \
         WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'",
    )
    .bind(id)
    .bind(owner)
    .bind(super::now_ms())
    .execute(pool)
    .await?;

    if updated.rows_affected() == 0 {
        return Ok(None);
    }

    let attempts: i64 = sqlx::query_scalar("SELECT attempts FROM evidence_jobs WHERE id = ?1")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(Some(attempts))
}

/// Persist the ledger transaction reference for an in-flight submission.
pub async fn record_submission(
    pool: &SqlitePool,
    id: &str,
    owner: &str,
    tx_handle: &str,
) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE evidence_jobs SET tx_handle = ?3, updated_ms = ?4 \
         WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'",
    )
    .bind(id)
    .bind(owner)
    .bind(tx_handle)
    .bind(super::now_ms())
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Push the lease expiry forward. Fails (returns false) once the lease has
/// been reclaimed, signalling the worker to abandon the job.
pub async fn extend_lease(
    pool: &SqlitePool,
    id: &str,
    owner: &str,
    new_expires_ms: i64,
) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE evidence_jobs SET lease_expires_ms = ?3, updated_ms = ?4 \
         WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'",
    )
    .bind(id)
    .bind(owner)
    .bind(new_expires_ms)
    .bind(super::now_ms())
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Write a terminal or retry transition.
///
/// The owner guard rejects a reclaimed-then-finished-late worker: a stale
/// holder's write is a no-op (returns false) so it can never overwrite
/// newer state.
pub async fn complete(
    pool: &SqlitePool,
    id: &str,
    owner: &str,
    outcome: &JobOutcome,
) -> Result<bool> {
    let now = super::now_ms();
    let updated = match outcome {
        JobOutcome::Anchored { tx_handle } => {
            sqlx::query(
                "UPDATE evidence_jobs \
                 SET status = 'anchored', lease_owner = NULL, lease_expires_ms = NULL, \
                     next_retry_ms = NULL, last_error = NULL, \
                     tx_handle = COALESCE(?3, tx_handle), updated_ms = ?4 \
                 WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'",
            )
            .bind(id)
            .bind(owner)
            .bind(tx_handle)
            .bind(now)
            .execute(pool)
            .await?
        }
        JobOutcome::FailedRetryable {
            error,
            next_retry_ms,
            retain_tx,
        } => {
            sqlx::query(
                "UPDATE evidence_jobs \
                 SET status = 'failed_retryable', lease_owner = NULL, lease_expires_ms = NULL, \
                     next_retry_ms = ?3, last_error = ?4, \
                     tx_handle = CASE WHEN ?5 THEN tx_handle ELSE NULL END, updated_ms = ?6 \
                 WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'",
            )
            .bind(id)
            .bind(owner)
            .bind(next_retry_ms)
            .bind(error)
            .bind(retain_tx)
            .bind(now)
            .execute(pool)
            .await?
        }
        JobOutcome::FailedTerminal { error } => {
            sqlx::query(
                "UPDATE evidence_jobs \
                 SET status = 'failed_terminal', lease_owner = NULL, lease_expires_ms = NULL, \
                     next_retry_ms = NULL, last_error = ?3, updated_ms = ?4 \
                 WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'",
            )
            .bind(id)
            .bind(owner)
            .bind(error)
            .bind(now)
            .execute(pool)
            .await?
        }
    };
    Ok(updated.rows_affected() == 1)
}

// ── Payment receipts ──

pub struct NewReceipt<'a> {
    pub proof_signature: &'a str,
    pub amount: &'a str,
    pub token: &'a str,
    pub payer_wallet: Option<&'a str>,
    pub consumed_for: Option<&'a str>,
}

/// Consume a payment proof.
///
/// The UNIQUE constraint on `proof_signature` is the replay guard: two
/// concurrent requests racing the same proof resolve to exactly one row
/// and one `Conflict`.
pub async fn insert_receipt(pool: &SqlitePool, new: NewReceipt<'_>) -> Result<PaymentReceipt> {
    let id = Uuid::new_v4().to_string();
    let now = super::now_ms();

    sqlx::query(
        r#"
        INSERT INTO payment_receipts
            (id, proof_signature, amount, token, payer_wallet, consumed_for, issued_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&id)
    .bind(new.proof_signature)
    .bind(new.amount)
    .bind(new.token)
    .bind(new.payer_wallet)
    .bind(new.consumed_for)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            SkyproofError::Conflict("payment proof already consumed".to_string())
        } else {
            SkyproofError::Database(e)
        }
    })?;

    Ok(PaymentReceipt {
        id,
        proof_signature: new.proof_signature.to_string(),
        amount: new.amount.to_string(),
        token: new.token.to_string(),
        payer_wallet: new.payer_wallet.map(str::to_string),
        consumed_for: new.consumed_for.map(str::to_string),
        issued_ms: now,
    })
}

pub async fn find_receipt_by_signature(
    pool: &SqlitePool,
    proof_signature: &str,
) -> Result<Option<PaymentReceipt>> {
    let receipt = sqlx::query_as::<_, PaymentReceipt>(
        "SELECT * FROM payment_receipts WHERE proof_signature = ?1",
    )
    .bind(proof_signature)
    .fetch_optional(pool)
    .await?;
    Ok(receipt)
}
