/// Orchestrator Facade - the single entry point for queue consumers
///
/// **Responsibilities:**
/// - Dispatch typed jobs to the build or execution manager
/// - Per-compiler build mutual exclusion via `build:{id}` leases
/// - Per-submission exclusion via `exec:{id}` leases
/// - Bound concurrent work to `pool_size` with a semaphore
///
/// Results flow back only through persisted state. Every job is
/// acknowledged once popped: manager errors are logged here and never
/// requeued. The one exception is a job blocked by someone else's lease,
/// which goes back on the queue after `defer_delay`.
use crate::builder::{BuildManager, BuildReport};
use crate::config::WorkerConfig;
use crate::executor::{ExecutionManager, ExecutionReport};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use yantra_common::leases::{build_lease_key, execution_lease_key, Lease, LeaseRegistry};
use yantra_common::queue::JobQueue;
use yantra_common::types::{BuildJob, CleanupJob, ExecutionJob, Job};

/// How a dispatched job ended, from the facade's point of view
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done,
    /// Duplicate, stale, or already owned elsewhere; acknowledged without effect
    Skipped(String),
    /// Blocked by a conflicting lease; the caller requeues the job later
    Deferred(Job),
    Errored(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub in_flight: usize,
    pub active_builds: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub build_ttl: Duration,
    /// Added to the compiler's timeout for each execution lease
    pub execution_margin: Duration,
    pub defer_delay: Duration,
}

impl From<&WorkerConfig> for LeaseSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            build_ttl: config.build_lease_ttl(),
            execution_margin: config.execution_lease_margin(),
            defer_delay: config.defer_delay(),
        }
    }
}

pub struct Orchestrator {
    queue: Arc<dyn JobQueue>,
    leases: Arc<dyn LeaseRegistry>,
    builds: BuildManager,
    executions: ExecutionManager,
    lease_settings: LeaseSettings,
    pool_size: usize,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    active_builds: Mutex<BTreeSet<String>>,
}

/// Decrements the in-flight counter even if the job task panics
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        leases: Arc<dyn LeaseRegistry>,
        builds: BuildManager,
        executions: ExecutionManager,
        lease_settings: LeaseSettings,
        pool_size: usize,
    ) -> Self {
        Self {
            queue,
            leases,
            builds,
            executions,
            lease_settings,
            pool_size,
            permits: Arc::new(Semaphore::new(pool_size)),
            in_flight: AtomicUsize::new(0),
            active_builds: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            pool_size: self.pool_size,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            active_builds: self
                .active_builds
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect(),
        }
    }

    /// Handle one job to completion. Never fails: errors become `Errored`.
    pub async fn dispatch(&self, job: Job) -> JobOutcome {
        let _in_flight = InFlight::enter(&self.in_flight);
        match job {
            Job::Build(build) => self.dispatch_build(build).await,
            Job::Execute(exec) => self.dispatch_execution(exec).await,
            Job::Cleanup(cleanup) => self.dispatch_cleanup(cleanup).await,
        }
    }

    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, String> {
        self.leases
            .try_acquire(key, ttl)
            .await
            .map_err(|e| format!("lease registry unavailable: {}", e))
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.leases.release(lease).await {
            // The TTL reclaims it eventually
            warn!(lease = %lease.key, error = %e, "Failed to release lease");
        }
    }

    async fn dispatch_build(&self, job: BuildJob) -> JobOutcome {
        let key = build_lease_key(&job.compiler_id);
        let lease = match self.acquire(&key, self.lease_settings.build_ttl).await {
            Ok(Some(lease)) => lease,
            // Held by a running build, an image cleanup or a producer edit.
            // Only the first is a duplicate.
            Ok(None) => {
                return match self.builds.wants_build(&job.compiler_id).await {
                    Ok(true) => {
                        debug!(compiler_id = %job.compiler_id, "Compiler busy, deferring build");
                        JobOutcome::Deferred(Job::Build(job))
                    }
                    Ok(false) => {
                        info!(compiler_id = %job.compiler_id, "Build already in flight, dropping duplicate job");
                        JobOutcome::Skipped("build already in flight".into())
                    }
                    Err(e) => {
                        error!(compiler_id = %job.compiler_id, error = ?e, "Build job failed");
                        JobOutcome::Errored(format!("{:#}", e))
                    }
                };
            }
            Err(e) => {
                error!(compiler_id = %job.compiler_id, error = %e, "Build job failed");
                return JobOutcome::Errored(e);
            }
        };

        self.active_builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.compiler_id.clone());

        let result = self.builds.build(&job.compiler_id).await;

        self.active_builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job.compiler_id);
        self.release(&lease).await;

        match result {
            Ok(BuildReport::Skipped(reason)) => JobOutcome::Skipped(reason),
            Ok(_) => JobOutcome::Done,
            Err(e) => {
                error!(compiler_id = %job.compiler_id, error = ?e, "Build job failed");
                JobOutcome::Errored(format!("{:#}", e))
            }
        }
    }

    /// Long enough to cover the whole run, so the lease is still held when
    /// the reaper first considers the submission stale
    pub(crate) async fn execution_lease_ttl(&self, submission_id: Uuid) -> Duration {
        self.executions.time_limit(submission_id).await + self.lease_settings.execution_margin
    }

    async fn dispatch_execution(&self, job: ExecutionJob) -> JobOutcome {
        let key = execution_lease_key(&job.submission_id);
        let ttl = self.execution_lease_ttl(job.submission_id).await;
        let lease = match self.acquire(&key, ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!(job_id = %job.submission_id, "Submission already being executed, dropping duplicate job");
                return JobOutcome::Skipped("execution already in flight".into());
            }
            Err(e) => {
                error!(job_id = %job.submission_id, error = %e, "Execution job failed");
                return JobOutcome::Errored(e);
            }
        };

        let result = self.executions.execute(job.submission_id).await;
        self.release(&lease).await;

        match result {
            Ok(ExecutionReport::Skipped(reason)) => JobOutcome::Skipped(reason),
            Ok(ExecutionReport::Finished(_)) => JobOutcome::Done,
            Err(e) => {
                error!(job_id = %job.submission_id, error = ?e, "Execution job failed");
                JobOutcome::Errored(format!("{:#}", e))
            }
        }
    }

    /// Serialized with builds of the same compiler id so a recreated
    /// compiler's fresh image is never removed mid-build
    async fn dispatch_cleanup(&self, job: CleanupJob) -> JobOutcome {
        let key = build_lease_key(&job.compiler_id);
        let lease = match self.acquire(&key, self.lease_settings.build_ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(compiler_id = %job.compiler_id, "Compiler busy, deferring image cleanup");
                return JobOutcome::Deferred(Job::Cleanup(job));
            }
            Err(e) => return JobOutcome::Errored(e),
        };

        let result = self.builds.cleanup(&job.compiler_id, &job.image_tag).await;
        self.release(&lease).await;

        match result {
            Ok(()) => JobOutcome::Done,
            Err(e) => {
                error!(compiler_id = %job.compiler_id, image_tag = %job.image_tag, error = ?e, "Cleanup job failed");
                JobOutcome::Errored(format!("{:#}", e))
            }
        }
    }

    /// Put a blocked job back after `defer_delay`, or at once on shutdown.
    /// Holds no pool permit while waiting.
    async fn requeue_later(&self, job: Job, mut shutdown: watch::Receiver<bool>) {
        if !*shutdown.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(self.lease_settings.defer_delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        match self.queue.push(&job).await {
            Ok(()) => debug!(kind = %job.kind(), "Deferred job requeued"),
            Err(e) => error!(kind = %job.kind(), error = %e, "Failed to requeue deferred job"),
        }
    }

    /// Pull jobs until `shutdown` flips, running at most `pool_size` at once,
    /// then wait for in-flight jobs to finish
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, poll_timeout: Duration) {
        info!(pool_size = self.pool_size, "Orchestrator started");
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reap finished tasks so the set does not grow unbounded
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            // Never cancelled mid-pop: a popped job must not be lost
            match self.queue.pop(poll_timeout).await {
                Ok(Some(job)) => {
                    debug!(kind = %job.kind(), "Received job");
                    let this = self.clone();
                    let stop = shutdown.clone();
                    tasks.spawn(async move {
                        let outcome = this.dispatch(job).await;
                        drop(permit);
                        match outcome {
                            JobOutcome::Deferred(job) => this.requeue_later(job, stop).await,
                            outcome => debug!(outcome = ?outcome, "Job acknowledged"),
                        }
                    });
                }
                Ok(None) => {
                    // Timeout - check for shutdown
                }
                Err(e) => {
                    error!(error = %e, "Queue error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(in_flight = tasks.len(), "Draining in-flight jobs");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }
        info!("Orchestrator stopped");
    }
}
