//! Supervisory sweep for work orphaned by a dead worker.
//!
//! A record stuck in `pending`, `building`, `PENDING` or `RUNNING` whose
//! lease has lapsed belongs to nobody. The sweep claims the same lease a worker would before touching
//! it, so it can never race a live holder.

use crate::error::StoreResult;
use crate::leases::{build_lease_key, execution_lease_key, LeaseRegistry};
use crate::queue::JobQueue;
use crate::staging::StagingArea;
use crate::store::StateStore;
use crate::text;
use crate::types::{BuildStatus, Job, Submission, SubmissionStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// How long the sweep holds a lease while it rewrites one record
const RECLAIM_LEASE_TTL: Duration = Duration::from_secs(30);

pub const LOST_WORKER_MESSAGE: &str = "Worker lost during execution";

#[derive(Debug, Clone)]
pub struct ReaperPolicy {
    /// A build may legitimately run this long
    pub build_timeout_secs: u64,
    /// Extra slack before a silent record counts as orphaned
    pub grace_secs: u64,
    /// Upper bound for the build log after the reclaim note is appended
    pub build_log_limit: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub requeued_builds: Vec<String>,
    pub requeued_submissions: Vec<Uuid>,
    pub failed_submissions: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued_builds.is_empty()
            && self.requeued_submissions.is_empty()
            && self.failed_submissions.is_empty()
    }
}

/// What to do with a submission nobody is working on
enum Reclaim {
    Fail(String),
    Requeue,
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// One pass over compilers and active submissions.
///
/// `building` compilers silent past the build ceiling and `pending` ones
/// silent past the grace period get a fresh build job. `RUNNING`
/// submissions past their time limit fail. `PENDING` ones fail if their
/// compiler is gone and are requeued once silent past the grace period.
/// Requeued jobs may duplicate one still sitting in the queue; consumers
/// already treat those as no-ops.
pub async fn sweep(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    leases: &dyn LeaseRegistry,
    staging: &StagingArea,
    policy: &ReaperPolicy,
    now: DateTime<Utc>,
) -> StoreResult<SweepReport> {
    let mut report = SweepReport::default();

    let build_deadline = seconds(policy.build_timeout_secs) + seconds(policy.grace_secs);
    let grace = seconds(policy.grace_secs);
    for compiler in store.list_compilers().await? {
        let stale = match compiler.build_status {
            BuildStatus::Building => now - compiler.updated_at > build_deadline,
            BuildStatus::Pending => now - compiler.updated_at > grace,
            BuildStatus::Ready | BuildStatus::Failed => false,
        };
        if !stale {
            continue;
        }

        let Some(lease) = leases
            .try_acquire(&build_lease_key(&compiler.id), RECLAIM_LEASE_TTL)
            .await?
        else {
            continue;
        };

        let reclaimed = async {
            // Re-read under the lease; the record may have moved meanwhile
            let Some(mut current) = store.get_compiler(&compiler.id).await? else {
                return Ok(false);
            };
            if current.build_status != compiler.build_status
                || current.updated_at != compiler.updated_at
            {
                return Ok(false);
            }
            if current.build_status == BuildStatus::Building {
                current.build_status = BuildStatus::Pending;
                text::append_bounded(
                    &mut current.build_logs,
                    "\n[build abandoned by a lost worker; requeued]\n",
                    policy.build_log_limit,
                );
            }
            current.updated_at = now;
            store.put_compiler(&current).await?;
            queue.push(&Job::build(&current.id)).await?;
            StoreResult::Ok(true)
        }
        .await;

        leases.release(&lease).await?;
        if reclaimed? {
            warn!(compiler_id = %compiler.id, was = %compiler.build_status, "Requeued stalled build");
            report.requeued_builds.push(compiler.id);
        }
    }

    for submission in store.list_active_submissions().await? {
        let action = match submission.status {
            SubmissionStatus::Running => {
                let timeout = store
                    .get_compiler(&submission.language)
                    .await?
                    .map(|c| c.timeout_seconds)
                    .unwrap_or(0);
                let started = submission.started_at.unwrap_or(submission.created_at);
                if now - started <= seconds(timeout) + grace {
                    continue;
                }
                Reclaim::Fail(LOST_WORKER_MESSAGE.to_string())
            }
            SubmissionStatus::Pending => {
                if store.get_compiler(&submission.language).await?.is_none() {
                    Reclaim::Fail(format!("Compiler '{}' does not exist", submission.language))
                } else if now - submission.updated_at > grace {
                    Reclaim::Requeue
                } else {
                    continue;
                }
            }
            _ => continue,
        };

        let Some(lease) = leases
            .try_acquire(&execution_lease_key(&submission.job_id), RECLAIM_LEASE_TTL)
            .await?
        else {
            continue;
        };

        let handled = async {
            let Some(mut current) = store.get_submission(&submission.job_id).await? else {
                return Ok(false);
            };
            if current.status != submission.status || current.updated_at != submission.updated_at {
                return Ok(false);
            }
            match &action {
                Reclaim::Fail(reason) => fail_submission(store, staging, current, reason, now).await?,
                Reclaim::Requeue => {
                    current.updated_at = now;
                    store.put_submission(&current).await?;
                    queue.push(&Job::execute(current.job_id)).await?;
                }
            }
            StoreResult::Ok(true)
        }
        .await;

        leases.release(&lease).await?;
        if handled? {
            match action {
                Reclaim::Fail(reason) => {
                    warn!(job_id = %submission.job_id, reason = %reason, "Failed orphaned submission");
                    report.failed_submissions.push(submission.job_id);
                }
                Reclaim::Requeue => {
                    warn!(job_id = %submission.job_id, "Requeued stalled submission");
                    report.requeued_submissions.push(submission.job_id);
                }
            }
        }
    }

    if !report.is_empty() {
        info!(
            requeued_builds = report.requeued_builds.len(),
            requeued_submissions = report.requeued_submissions.len(),
            failed_submissions = report.failed_submissions.len(),
            "Reaper sweep reclaimed work"
        );
    }
    Ok(report)
}

/// Staged files go first so they are gone by the time ERROR is visible
async fn fail_submission(
    store: &dyn StateStore,
    staging: &StagingArea,
    mut submission: Submission,
    reason: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    if let Some(dir) = submission.files_directory.as_deref() {
        match staging.resolve(dir) {
            Ok(path) => {
                if let Err(e) = staging.remove(&path) {
                    warn!(job_id = %submission.job_id, error = %e, "Failed to remove staged files");
                }
            }
            Err(e) => warn!(job_id = %submission.job_id, error = %e, "Refusing staged directory"),
        }
    }
    submission.status = SubmissionStatus::Error;
    submission.output_stderr = Some(reason.to_string());
    submission.completed_at = Some(now);
    submission.updated_at = now;
    store.put_submission(&submission).await
}
