//! Worker state-machine tests against a scripted backend: happy path,
//! bounded retries, duplicate-digest adoption, and crash recovery.

mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use skyproof::anchor::{AnchorBackend, BackendError, PollStatus, TxHandle};
use skyproof::keeper::{worker, ClaimedJob};
use skyproof::store::models::JobStatus;
use skyproof::store::{now_ms, repository, Database};

/// Backend that replays scripted submit/poll results.
///
/// When a script runs dry the last behavior repeats, so "always transient"
/// is a one-entry script.
struct ScriptedBackend {
    submits: Mutex<VecDeque<Result<TxHandle, BackendError>>>,
    polls: Mutex<VecDeque<Result<PollStatus, BackendError>>>,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(
        submits: Vec<Result<TxHandle, BackendError>>,
        polls: Vec<Result<PollStatus, BackendError>>,
    ) -> Self {
        Self {
            submits: Mutex::new(submits.into()),
            polls: Mutex::new(polls.into()),
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

fn next_scripted<T: Clone>(queue: &Mutex<VecDeque<T>>) -> T {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue.front().expect("script must not be empty").clone()
    }
}

#[async_trait]
impl AnchorBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, _digest_hex: &str) -> Result<TxHandle, BackendError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.submits)
    }

    async fn poll(&self, _tx: &TxHandle) -> Result<PollStatus, BackendError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.polls)
    }
}

async fn insert(db: &Database, id: &str, digest: &str) {
    repository::insert_job(
        db.pool(),
        repository::NewJob {
            id: Some(id.to_string()),
            digest_hex: digest,
            payload_mime: None,
            metadata: None,
        },
    )
    .await
    .unwrap();
}

/// Claim one eligible job at time `now`, panicking if none is available.
async fn claim_one(db: &Database, owner: &str, now: i64) -> ClaimedJob {
    let mut jobs = repository::claim_batch(db.pool(), owner, 1, 60_000, now)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1, "expected one claimable job");
    ClaimedJob {
        job: jobs.remove(0),
        owner: owner.to_string(),
    }
}

fn digest(seed: u8) -> String {
    format!("{:02x}", seed).repeat(32)
}

#[tokio::test]
async fn job_anchors_after_finality_polls() {
    let db = common::make_db("happy").await;
    let config = common::fast_keeper_config();
    insert(&db, "job-1", &digest(1)).await;

    let backend = ScriptedBackend::new(
        vec![Ok(TxHandle("tx-abc".to_string()))],
        vec![
            Ok(PollStatus::Pending),
            Ok(PollStatus::Pending),
            Ok(PollStatus::Finalized),
        ],
    );

    let claimed = claim_one(&db, "worker", now_ms()).await;
    worker::process_job(&db, &backend, &config, &claimed).await;

    let job = repository::get_job(db.pool(), "job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Anchored);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.tx_handle.as_deref(), Some("tx-abc"));
    assert!(job.lease_owner.is_none());
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn transient_failures_exhaust_into_terminal() {
    let db = common::make_db("exhaust").await;
    let config = common::fast_keeper_config(); // max_attempts = 3
    insert(&db, "job-1", &digest(1)).await;

    let backend = ScriptedBackend::new(
        vec![Err(BackendError::Transient("rpc timeout".to_string()))],
        vec![Ok(PollStatus::Pending)],
    );

    // Claim far in the future each round so backoff never blocks the test.
    for round in 1..=3 {
        let now = now_ms() + round * 86_400_000;
        let claimed = claim_one(&db, "worker", now).await;
        worker::process_job(&db, &backend, &config, &claimed).await;
    }

    let job = repository::get_job(db.pool(), "job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::FailedTerminal);
    assert_eq!(job.attempts, 3, "exactly max_attempts attempts, no more");
    assert_eq!(backend.submit_calls(), 3);
    let last_error = job.last_error.unwrap();
    assert!(last_error.contains("retries exhausted"), "{last_error}");
}

#[tokio::test]
async fn intermediate_transient_failure_schedules_backoff() {
    let db = common::make_db("backoff").await;
    let config = common::fast_keeper_config();
    insert(&db, "job-1", &digest(1)).await;

    let backend = ScriptedBackend::new(
        vec![Err(BackendError::Transient("congestion".to_string()))],
        vec![Ok(PollStatus::Pending)],
    );

    let before = now_ms();
    let claimed = claim_one(&db, "worker", before).await;
    worker::process_job(&db, &backend, &config, &claimed).await;

    let job = repository::get_job(db.pool(), "job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::FailedRetryable);
    assert_eq!(job.attempts, 1);
    assert!(job.next_retry_ms.unwrap() > before);
    assert!(job.last_error.unwrap().contains("congestion"));
}

#[tokio::test]
async fn permanent_failure_is_terminal_on_first_attempt() {
    let db = common::make_db("permanent").await;
    let config = common::fast_keeper_config();
    insert(&db, "job-1", &digest(1)).await;

    let backend = ScriptedBackend::new(
        vec![Err(BackendError::Permanent("malformed digest".to_string()))],
        vec![Ok(PollStatus::Pending)],
    );

    let claimed = claim_one(&db, "worker", now_ms()).await;
    worker::process_job(&db, &backend, &config, &claimed).await;

    let job = repository::get_job(db.pool(), "job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::FailedTerminal);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("malformed digest"));
}

#[tokio::test]
async fn duplicate_digest_adopts_prior_anchor() {
    let db = common::make_db("adoption").await;
    let config = common::fast_keeper_config();
    let shared = digest(7);

    insert(&db, "first", &shared).await;
    let backend = ScriptedBackend::new(
        vec![Ok(TxHandle("tx-first".to_string()))],
        vec![Ok(PollStatus::Finalized)],
    );
    let claimed = claim_one(&db, "worker", now_ms()).await;
    worker::process_job(&db, &backend, &config, &claimed).await;
    assert_eq!(backend.submit_calls(), 1);

    // Same digest, new job: the worker must not touch the ledger again.
    insert(&db, "second", &shared).await;
    let claimed = claim_one(&db, "worker", now_ms()).await;
    worker::process_job(&db, &backend, &config, &claimed).await;

    let job = repository::get_job(db.pool(), "second").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Anchored);
    assert_eq!(job.tx_handle.as_deref(), Some("tx-first"));
    assert_eq!(job.attempts, 0, "adoption is not a submission attempt");
    assert_eq!(backend.submit_calls(), 1, "no second ledger submission");
}

#[tokio::test]
async fn recorded_submission_is_repolled_not_resubmitted() {
    let db = common::make_db("crash_recovery").await;
    let config = common::fast_keeper_config();
    insert(&db, "job-1", &digest(1)).await;

    // A worker submits, records the handle, then dies before finality.
    let t0 = now_ms();
    let crashed = claim_one(&db, "crashed", t0).await;
    repository::record_attempt(db.pool(), "job-1", "crashed")
        .await
        .unwrap();
    repository::record_submission(db.pool(), "job-1", "crashed", "tx-inflight")
        .await
        .unwrap();
    let expires = crashed.job.lease_expires_ms.unwrap_or(t0 + 60_000);

    // After the lease lapses another worker picks the job up and resumes
    // polling the recorded transaction.
    let backend = ScriptedBackend::new(
        vec![Ok(TxHandle("tx-should-not-happen".to_string()))],
        vec![Ok(PollStatus::Finalized)],
    );
    let recovered = claim_one(&db, "recovery", expires + 1).await;
    worker::process_job(&db, &backend, &config, &recovered).await;

    let job = repository::get_job(db.pool(), "job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Anchored);
    assert_eq!(job.tx_handle.as_deref(), Some("tx-inflight"));
    assert_eq!(job.attempts, 1, "re-polling is not a new attempt");
    assert_eq!(backend.submit_calls(), 0, "no duplicate submission");
}

#[tokio::test]
async fn resubmittable_rejection_clears_handle_for_retry() {
    let db = common::make_db("fee_reject").await;
    let config = common::fast_keeper_config();
    insert(&db, "job-1", &digest(1)).await;

    let backend = ScriptedBackend::new(
        vec![Ok(TxHandle("tx-1".to_string()))],
        vec![Ok(PollStatus::Rejected("fee too low".to_string()))],
    );

    let claimed = claim_one(&db, "worker", now_ms()).await;
    worker::process_job(&db, &backend, &config, &claimed).await;

    let job = repository::get_job(db.pool(), "job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::FailedRetryable);
    assert!(job.tx_handle.is_none(), "dead transaction must not be re-polled");
    assert!(job.last_error.unwrap().contains("fee too low"));
}

#[tokio::test]
async fn semantic_rejection_is_terminal() {
    let db = common::make_db("hard_reject").await;
    let config = common::fast_keeper_config();
    insert(&db, "job-1", &digest(1)).await;

    let backend = ScriptedBackend::new(
        vec![Ok(TxHandle("tx-1".to_string()))],
        vec![Ok(PollStatus::Rejected("instruction error".to_string()))],
    );

    let claimed = claim_one(&db, "worker", now_ms()).await;
    worker::process_job(&db, &backend, &config, &claimed).await;

    let job = repository::get_job(db.pool(), "job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::FailedTerminal);
}

#[tokio::test]
async fn finality_budget_hands_back_with_handle_retained() {
    let db = common::make_db("poll_budget").await;
    let config = skyproof::config::KeeperConfig {
        finality_budget_ms: 50,
        finality_poll_ms: 10,
        ..common::fast_keeper_config()
    };
    insert(&db, "job-1", &digest(1)).await;

    let backend = ScriptedBackend::new(
        vec![Ok(TxHandle("tx-slow".to_string()))],
        vec![Ok(PollStatus::Pending)],
    );

    let claimed = claim_one(&db, "worker", now_ms()).await;
    worker::process_job(&db, &backend, &config, &claimed).await;

    let job = repository::get_job(db.pool(), "job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::FailedRetryable);
    assert_eq!(
        job.tx_handle.as_deref(),
        Some("tx-slow"),
        "handle survives so the next lease re-polls"
    );
    assert_eq!(job.attempts, 1);
}
