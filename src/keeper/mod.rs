/// Keeper runtime: claim/lease dispatcher and worker pool.
///
/// One keeper process runs a dispatcher task and N worker tasks. The
/// dispatcher periodically claims eligible jobs from the store under a
/// process-unique owner id and hands them to workers over a bounded
/// channel; workers drive each job against the anchoring backend and
/// write the outcome back. The store's atomic claim is the only
/// cross-process synchronization primitive, so any number of keeper
/// processes can share one database.
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::anchor::AnchorBackend;
use crate::config::KeeperConfig;
use crate::store::models::EvidenceJob;
use crate::store::{repository, Database};

/// A job leased to this keeper, with the owner id the lease was taken
/// under. All writes for the job must carry the same owner.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: EvidenceJob,
    pub owner: String,
}

/// Retry delay for the given attempt count: exponential with a capped
/// exponent, clamped, plus jitter to spread herd re-submissions after a
/// ledger outage.
pub fn backoff_delay_ms(attempts: i64, config: &KeeperConfig) -> i64 {
    let exp = attempts.clamp(0, config.backoff_cap_exp as i64) as u32;
    let backoff = config
        .backoff_base_ms
        .saturating_mul(2i64.saturating_pow(exp))
        .min(config.backoff_max_ms);
    let jitter = if config.backoff_jitter_ms > 0 {
        rand::rng().random_range(0..config.backoff_jitter_ms)
    } else {
        0
    };
    backoff + jitter
}

/// Run the keeper until the task is aborted.
pub async fn run(db: Database, backend: Arc<dyn AnchorBackend>, config: KeeperConfig) {
    let owner = format!("keeper-{}", Uuid::new_v4());
    let capacity = (config.batch_size.max(1) as usize) * 2;
    let (job_tx, job_rx) = mpsc::channel::<ClaimedJob>(capacity);
    let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

    tracing::info!(
        owner = %owner,
        backend = backend.name(),
        workers = config.worker_count,
        "keeper starting"
    );

    for worker_id in 0..config.worker_count.max(1) {
        let db = db.clone();
        let backend = backend.clone();
        let config = config.clone();
        let job_rx = job_rx.clone();
        tokio::spawn(async move {
            loop {
                let claimed = { job_rx.lock().await.recv().await };
                match claimed {
                    Some(claimed) => {
                        worker::process_job(&db, backend.as_ref(), &config, &claimed).await;
                    }
                    None => {
                        tracing::debug!(worker_id, "job channel closed, worker stopping");
                        break;
                    }
                }
            }
        });
    }

    let mut tick = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(100)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;

        let now = crate::store::now_ms();
        match repository::claim_batch(db.pool(), &owner, config.batch_size, config.lease_ms, now)
            .await
        {
            Ok(jobs) => {
                for job in jobs {
                    let claimed = ClaimedJob {
                        job,
                        owner: owner.clone(),
                    };
                    if job_tx.send(claimed).await.is_err() {
                        tracing::warn!("all workers gone, dispatcher stopping");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "claim cycle failed");
            }
        }
    }
}
