/// Per-job worker state machine.
///
/// A worker owns a leased job from claim to outcome. Every store write
/// is owner-guarded; when any guard fails the lease was reclaimed and the
/// worker abandons the job without writing further state, leaving the new
/// holder as the single writer.
use std::time::Duration;

use crate::anchor::{
    rejection_is_resubmittable, AnchorBackend, BackendError, PollStatus, TxHandle,
};
use crate::config::KeeperConfig;
use crate::store::models::{EvidenceJob, JobOutcome};
use crate::store::{now_ms, repository, Database};

use super::{backoff_delay_ms, ClaimedJob};

/// Upper bound for the doubling delay between finality polls.
const FINALITY_POLL_CAP_MS: u64 = 15_000;

/// Drive one leased job to an outcome (or abandon it).
pub async fn process_job(
    db: &Database,
    backend: &dyn AnchorBackend,
    config: &KeeperConfig,
    claimed: &ClaimedJob,
) {
    let pool = db.pool();
    let job = &claimed.job;
    let owner = &claimed.owner;

    // A digest already anchored by another job must not hit the ledger
    // again; adopt the prior transaction reference instead.
    match repository::find_anchored_by_digest(pool, &job.digest_hex).await {
        Ok(Some(prior)) if prior.id != job.id => {
            tracing::info!(
                job_id = %job.id,
                prior_job = %prior.id,
                "digest already anchored, adopting prior transaction"
            );
            finish(
                db,
                &job.id,
                owner,
                &JobOutcome::Anchored {
                    tx_handle: prior.tx_handle.clone(),
                },
            )
            .await;
            return;
        }
        Ok(_) => {}
        Err(e) => {
            // Leave the job leased; the lease expiry will recycle it.
            tracing::warn!(job_id = %job.id, error = %e, "digest lookup failed, abandoning");
            return;
        }
    }

    // A recorded tx_handle means a previous holder submitted but never
    // learned the outcome. Re-poll that transaction; submitting again
    // would risk a duplicate anchor.
    if let Some(handle) = &job.tx_handle {
        tracing::info!(
            job_id = %job.id,
            tx_handle = %handle,
            "resuming finality polling for recorded submission"
        );
        await_finality(
            db,
            backend,
            config,
            job,
            owner,
            &TxHandle(handle.clone()),
            job.attempts,
        )
        .await;
        return;
    }

    let attempts = match repository::record_attempt(pool, &job.id, owner).await {
        Ok(Some(attempts)) => attempts,
        Ok(None) => {
            tracing::debug!(job_id = %job.id, "lease lost before submission, abandoning");
            return;
        }
        Err(e) => {
            tracing::warn!(job_id = %job.id, error = %e, "attempt bookkeeping failed, abandoning");
            return;
        }
    };

    match backend.submit(&job.digest_hex).await {
        Ok(handle) => {
            match repository::record_submission(pool, &job.id, owner, &handle.0).await {
                Ok(true) => {
                    await_finality(db, backend, config, job, owner, &handle, attempts).await;
                }
                Ok(false) => {
                    // The submission reached the ledger but the lease was
                    // reclaimed before the handle could be recorded. The next
                    // holder cannot see the in-flight transaction, so this is
                    // the one window where a duplicate submission is possible.
                    tracing::error!(
                        job_id = %job.id,
                        tx_handle = %handle,
                        "lease reclaimed after ledger submission; handle lost"
                    );
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "recording submission failed");
                }
            }
        }
        Err(BackendError::Permanent(reason)) => {
            finish(
                db,
                &job.id,
                owner,
                &JobOutcome::FailedTerminal {
                    error: format!("submit rejected: {reason}"),
                },
            )
            .await;
        }
        Err(BackendError::Transient(reason)) => {
            retry_or_exhaust(
                db,
                config,
                &job.id,
                owner,
                attempts,
                format!("submit failed: {reason}"),
                false,
            )
            .await;
        }
    }
}

/// Poll the ledger until the transaction is final, rejected, or the poll
/// budget for this lease runs out.
async fn await_finality(
    db: &Database,
    backend: &dyn AnchorBackend,
    config: &KeeperConfig,
    job: &EvidenceJob,
    owner: &str,
    handle: &TxHandle,
    attempts: i64,
) {
    let pool = db.pool();
    let started = now_ms();
    let mut poll_delay = config.finality_poll_ms.max(10);
    let mut lease_expires = job
        .lease_expires_ms
        .unwrap_or_else(|| started + config.lease_ms);

    loop {
        let now = now_ms();

        if now - started > config.finality_budget_ms {
            // Hand the job back with the handle retained; the next lease
            // resumes polling instead of resubmitting.
            finish(
                db,
                &job.id,
                owner,
                &JobOutcome::FailedRetryable {
                    error: "finality not reached within poll budget".to_string(),
                    next_retry_ms: now + config.backoff_base_ms,
                    retain_tx: true,
                },
            )
            .await;
            return;
        }

        // Re-lease before expiry; losing the lease means another worker
        // owns the job now, and writing anything would race it.
        if lease_expires - now < config.lease_ms / 3 {
            match repository::extend_lease(pool, &job.id, owner, now + config.lease_ms).await {
                Ok(true) => lease_expires = now + config.lease_ms,
                Ok(false) => {
                    tracing::debug!(
                        job_id = %job.id,
                        "lease reclaimed during finality polling, abandoning"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "lease extension failed");
                    return;
                }
            }
        }

        match backend.poll(handle).await {
            Ok(PollStatus::Finalized) => {
                finish(db, &job.id, owner, &JobOutcome::Anchored { tx_handle: None }).await;
                return;
            }
            Ok(PollStatus::Rejected(reason)) => {
                if rejection_is_resubmittable(&reason) {
                    // Clear the handle: the transaction is dead and the next
                    // attempt must submit afresh.
                    retry_or_exhaust(
                        db,
                        config,
                        &job.id,
                        owner,
                        attempts,
                        format!("rejected: {reason}"),
                        false,
                    )
                    .await;
                } else {
                    finish(
                        db,
                        &job.id,
                        owner,
                        &JobOutcome::FailedTerminal {
                            error: format!("rejected: {reason}"),
                        },
                    )
                    .await;
                }
                return;
            }
            Ok(PollStatus::Pending) => {}
            Err(BackendError::Transient(reason)) => {
                tracing::debug!(job_id = %job.id, reason = %reason, "finality poll failed, retrying");
            }
            Err(BackendError::Permanent(reason)) => {
                finish(
                    db,
                    &job.id,
                    owner,
                    &JobOutcome::FailedTerminal {
                        error: format!("finality poll rejected: {reason}"),
                    },
                )
                .await;
                return;
            }
        }

        tokio::time::sleep(Duration::from_millis(poll_delay)).await;
        poll_delay = (poll_delay * 2).min(FINALITY_POLL_CAP_MS);
    }
}

/// Schedule a retry, or convert to terminal once attempts are exhausted.
async fn retry_or_exhaust(
    db: &Database,
    config: &KeeperConfig,
    job_id: &str,
    owner: &str,
    attempts: i64,
    error: String,
    retain_tx: bool,
) {
    if attempts >= config.max_attempts {
        // Exhaustion is surfaced via last_error and an error event,
        // never silently rescheduled.
        tracing::error!(
            job_id = %job_id,
            attempts,
            error = %error,
            "retries exhausted, failing terminally"
        );
        finish(
            db,
            job_id,
            owner,
            &JobOutcome::FailedTerminal {
                error: format!("retries exhausted after {attempts} attempts: {error}"),
            },
        )
        .await;
        return;
    }

    let delay = backoff_delay_ms(attempts, config);
    finish(
        db,
        job_id,
        owner,
        &JobOutcome::FailedRetryable {
            error,
            next_retry_ms: now_ms() + delay,
            retain_tx,
        },
    )
    .await;
}

/// Write the outcome; a stale owner's write is logged and dropped.
async fn finish(db: &Database, job_id: &str, owner: &str, outcome: &JobOutcome) {
    match repository::complete(db.pool(), job_id, owner, outcome).await {
        Ok(true) => match outcome {
            JobOutcome::Anchored { .. } => {
                tracing::info!(job_id = %job_id, "evidence anchored");
            }
            JobOutcome::FailedRetryable {
                error,
                next_retry_ms,
                ..
            } => {
                tracing::warn!(
                    job_id = %job_id,
                    error = %error,
                    next_retry_ms,
                    "job scheduled for retry"
                );
            }
            JobOutcome::FailedTerminal { error } => {
                tracing::warn!(job_id = %job_id, error = %error, "job failed terminally");
            }
        },
        Ok(false) => {
            tracing::warn!(job_id = %job_id, "stale lease owner, completion ignored");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "failed to write job outcome");
        }
    }
}
