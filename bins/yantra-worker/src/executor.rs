/// Execution Manager - drives the submission state machine
///
/// **State machine:** `PENDING → RUNNING → COMPLETED | FAILED | TIMEOUT | ERROR`
/// (precondition failures go `PENDING → ERROR` without ever running)
///
/// **Architecture:**
/// 1. Idempotency guard: terminal or already-running records are skipped
/// 2. Preconditions against the compiler record
/// 3. Launch through `ContainerRunner` (engine.rs), retrying only transient
///    infrastructure faults
/// 4. Wall-clock deadline; expiry kills the container
/// 5. Classification by the evaluator (evaluator.rs)
/// 6. Staged files deleted before the terminal status is written
///
/// This module is the glue layer - it knows nothing about:
/// - How containers run (engine's job)
/// - How exit codes map to statuses (evaluator's job)
use crate::config::WorkerConfig;
use crate::engine::{ContainerRunner, Mount, RunSpec, RunningContainer};
use crate::error::EngineError;
use crate::evaluator::{self, Verdict};
use crate::limits;
use crate::retry::{retry_transient, RetryConfig};
use crate::staging::StagingGuard;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use yantra_common::staging::StagingArea;
use yantra_common::store::StateStore;
use yantra_common::types::{Compiler, Submission, SubmissionStatus};

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub staging: StagingArea,
    pub sandbox_mount_path: String,
    pub working_dir: String,
    pub scratch_size: Option<String>,
    pub pids_limit: i64,
    pub runtime: Option<String>,
    pub output_limit: usize,
    pub retry: RetryConfig,
}

impl From<&WorkerConfig> for ExecutionSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            staging: StagingArea::new(&config.staging_root),
            sandbox_mount_path: config.sandbox_mount_path.clone(),
            working_dir: config.working_dir.clone(),
            scratch_size: (!config.scratch_size.is_empty()).then(|| config.scratch_size.clone()),
            pids_limit: config.pids_limit,
            runtime: config.container_runtime.clone(),
            output_limit: config.output_limit_bytes,
            retry: RetryConfig::with_max_attempts(config.infra_retry_attempts),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    /// Re-delivery or unknown record; nothing was run or written
    Skipped(String),
    Finished(SubmissionStatus),
}

pub struct ExecutionManager {
    store: Arc<dyn StateStore>,
    runner: Arc<dyn ContainerRunner>,
    settings: ExecutionSettings,
}

/// Human-readable reason for an infrastructure failure at launch
fn launch_failure(err: &EngineError, compiler: &Compiler) -> String {
    match err {
        EngineError::ImageMissing(tag) => format!(
            "Image '{}' for compiler '{}' is missing; rebuild the compiler",
            tag, compiler.id
        ),
        EngineError::Mount(detail) => format!("Failed to mount uploaded files: {}", detail),
        other => format!("Execution infrastructure error: {}", other),
    }
}

impl ExecutionManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        runner: Arc<dyn ContainerRunner>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            store,
            runner,
            settings,
        }
    }

    #[instrument(skip(self), fields(job_id = %submission_id))]
    pub async fn execute(&self, submission_id: Uuid) -> Result<ExecutionReport> {
        let Some(mut submission) = self
            .store
            .get_submission(&submission_id)
            .await
            .context("Failed to load submission")?
        else {
            warn!("Execution requested for unknown submission, dropping job");
            return Ok(ExecutionReport::Skipped("submission not found".into()));
        };

        if submission.status.is_terminal() {
            info!(status = %submission.status, "Submission already settled, acknowledging re-delivery");
            return Ok(ExecutionReport::Skipped("already terminal".into()));
        }
        if submission.status == SubmissionStatus::Running {
            warn!("Submission already running elsewhere, dropping duplicate job");
            return Ok(ExecutionReport::Skipped("already running".into()));
        }

        // Registered before anything can fail so every exit path deletes the files
        let mut staging = match self.staging_guard(&submission) {
            Ok(guard) => guard,
            Err(reason) => {
                let mut guard = StagingGuard::empty(self.settings.staging.clone());
                return self
                    .finish(&mut submission, Verdict::error(reason), &mut guard)
                    .await;
            }
        };

        // A store failure before RUNNING leaves the record PENDING for the
        // reaper to requeue, so the upload has to survive it
        let checked = match self.check_preconditions(&submission).await {
            Ok(checked) => checked,
            Err(e) => {
                staging.keep();
                return Err(e);
            }
        };
        let (compiler, memory_bytes, nano_cpus) = match checked {
            Ok(ready) => ready,
            Err(reason) => {
                warn!(language = %submission.language, reason = %reason, "Submission rejected before running");
                return self
                    .finish(&mut submission, Verdict::error(reason), &mut staging)
                    .await;
            }
        };

        let now = Utc::now();
        submission.status = SubmissionStatus::Running;
        submission.started_at = Some(now);
        submission.updated_at = now;
        if let Err(e) = self.store.put_submission(&submission).await {
            staging.keep();
            return Err(e).context("Failed to mark submission running");
        }
        info!(language = %compiler.id, image = ?compiler.image_tag, "Submission running");

        let staged_dir = staging.path().map(Path::to_path_buf);
        let mounts = match staged_dir {
            Some(dir) if !self.settings.staging.exists(&dir) => {
                let verdict = Verdict::error("Uploaded files for this submission are missing");
                return self.finish(&mut submission, verdict, &mut staging).await;
            }
            Some(dir) => vec![Mount {
                host_path: dir,
                container_path: self.settings.sandbox_mount_path.clone(),
                read_only: true,
            }],
            None => Vec::new(),
        };

        let spec = RunSpec {
            // checked by check_preconditions
            image_tag: compiler.image_tag.clone().unwrap_or_default(),
            run_command: compiler.run_command.clone(),
            memory_bytes,
            nano_cpus,
            mounts,
            code: submission.code.clone(),
            working_dir: self.settings.working_dir.clone(),
            scratch_size: self.settings.scratch_size.clone(),
            pids_limit: self.settings.pids_limit,
            runtime: self.settings.runtime.clone(),
            output_limit: self.settings.output_limit,
        };

        let started = std::time::Instant::now();
        let verdict = self.run(&spec, &compiler).await;
        info!(
            status = %verdict.status,
            execution_ms = started.elapsed().as_millis(),
            "Execution finished"
        );

        self.finish(&mut submission, verdict, &mut staging).await
    }

    /// Wall-clock limit a run of this submission would get. Zero when the
    /// submission or its compiler cannot be read.
    pub async fn time_limit(&self, submission_id: Uuid) -> Duration {
        let submission = match self.store.get_submission(&submission_id).await {
            Ok(Some(submission)) => submission,
            Ok(None) => return Duration::ZERO,
            Err(e) => {
                warn!(job_id = %submission_id, error = %e, "Failed to load submission for its time limit");
                return Duration::ZERO;
            }
        };
        match self.store.get_compiler(&submission.language).await {
            Ok(Some(compiler)) => Duration::from_secs(compiler.timeout_seconds),
            Ok(None) => Duration::ZERO,
            Err(e) => {
                warn!(job_id = %submission_id, error = %e, "Failed to load compiler for its time limit");
                Duration::ZERO
            }
        }
    }

    /// Resolve the staged directory, if any, and take ownership of it
    fn staging_guard(&self, submission: &Submission) -> std::result::Result<StagingGuard, String> {
        let area = self.settings.staging.clone();
        match submission.files_directory.as_deref() {
            None => Ok(StagingGuard::empty(area)),
            Some(dir) => match area.resolve(dir) {
                Ok(path) => Ok(StagingGuard::new(area, path)),
                Err(e) => {
                    error!(files_directory = %dir, error = %e, "Refusing staged directory");
                    Err("Uploaded files are stored outside the staging area".to_string())
                }
            },
        }
    }

    /// Inner `Err` is a reason to settle on ERROR without running; outer `Err`
    /// means the store itself failed
    async fn check_preconditions(
        &self,
        submission: &Submission,
    ) -> Result<std::result::Result<(Compiler, i64, i64), String>> {
        let Some(compiler) = self
            .store
            .get_compiler(&submission.language)
            .await
            .context("Failed to load compiler")?
        else {
            return Ok(Err(format!(
                "Compiler '{}' does not exist",
                submission.language
            )));
        };

        if !compiler.enabled {
            return Ok(Err(format!("Compiler '{}' is disabled", compiler.id)));
        }
        if !compiler.is_runnable() {
            return Ok(Err(format!(
                "Compiler '{}' is not ready (build status: {})",
                compiler.id, compiler.build_status
            )));
        }

        let limits = limits::parse_memory(&compiler.memory_limit)
            .and_then(|memory| Ok((memory, limits::parse_nano_cpus(&compiler.cpu_limit)?)));
        match limits {
            Ok((memory, cpus)) => Ok(Ok((compiler, memory, cpus))),
            Err(e) => Ok(Err(format!("Compiler '{}' has an {}", compiler.id, e))),
        }
    }

    async fn run(&self, spec: &RunSpec, compiler: &Compiler) -> Verdict {
        let launched = retry_transient(
            &self.settings.retry,
            "container launch",
            EngineError::is_transient,
            || self.runner.start(spec),
        )
        .await;

        let mut container: Box<dyn RunningContainer> = match launched {
            Ok(container) => container,
            Err(e) => {
                error!(error = %e, "Container launch failed");
                return Verdict::error(launch_failure(&e, compiler));
            }
        };

        let deadline = Duration::from_secs(compiler.timeout_seconds);
        match tokio::time::timeout(deadline, container.wait()).await {
            Ok(Ok(exit)) => evaluator::evaluate(exit),
            Ok(Err(e)) => {
                error!(error = %e, "Lost track of running container");
                let _ = container.kill().await;
                Verdict::error(format!("Execution infrastructure error: {}", e))
            }
            Err(_) => {
                warn!(timeout_seconds = compiler.timeout_seconds, "Execution deadline reached, killing container");
                let captured = container.kill().await;
                Verdict::timed_out(captured, compiler.timeout_seconds)
            }
        }
    }

    /// Delete staged files, then write the terminal record
    async fn finish(
        &self,
        submission: &mut Submission,
        verdict: Verdict,
        staging: &mut StagingGuard,
    ) -> Result<ExecutionReport> {
        staging.release();

        submission.status = verdict.status;
        submission.output_stdout = verdict.stdout;
        submission.output_stderr = verdict.stderr;
        let now = Utc::now();
        submission.completed_at = Some(now);
        submission.updated_at = now;
        self.store
            .put_submission(submission)
            .await
            .context("Failed to record submission result")?;

        info!(job_id = %submission.job_id, status = %submission.status, "Submission settled");
        Ok(ExecutionReport::Finished(submission.status))
    }
}

