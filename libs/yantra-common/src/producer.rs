//! Producer-side operations: persist a record, then enqueue the matching job.
//!
//! These are the only writes the orchestrator expects from outside. Compiler
//! edits hold the compiler's build lease and refuse to touch a record that is
//! `building`.

use crate::error::{StoreError, StoreResult};
use crate::leases::{build_lease_key, Lease, LeaseRegistry};
use crate::queue::JobQueue;
use crate::store::StateStore;
use crate::types::{BuildStatus, Compiler, Job, Submission, SubmissionStatus};
use chrono::Utc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Optional edits to a compiler's build definition
#[derive(Debug, Clone, Default)]
pub struct DefinitionChange {
    pub dockerfile_content: Option<String>,
    pub run_command: Option<Vec<String>>,
}

/// Persist a new compiler in `pending` and queue its first build
pub async fn register_compiler(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    mut compiler: Compiler,
) -> StoreResult<()> {
    if store.get_compiler(&compiler.id).await?.is_some() {
        return Err(StoreError::conflict(format!(
            "compiler '{}' already exists",
            compiler.id
        )));
    }
    compiler.build_status = BuildStatus::Pending;
    compiler.build_error = None;
    store.put_compiler(&compiler).await?;
    queue.push(&Job::build(&compiler.id)).await?;
    info!(compiler_id = %compiler.id, "Compiler registered, build queued");
    Ok(())
}

/// How long an edit may hold a compiler's build lease
const EDIT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Claim the compiler's build lease so no worker can move the record to
/// `building` between our read and our write
async fn claim(leases: &dyn LeaseRegistry, compiler_id: &str) -> StoreResult<Lease> {
    leases
        .try_acquire(&build_lease_key(compiler_id), EDIT_LEASE_TTL)
        .await?
        .ok_or_else(|| {
            StoreError::conflict(format!(
                "compiler '{}' is being built or cleaned up; retry shortly",
                compiler_id
            ))
        })
}

async fn load_idle(store: &dyn StateStore, compiler_id: &str) -> StoreResult<Compiler> {
    let compiler = store
        .get_compiler(compiler_id)
        .await?
        .ok_or_else(|| StoreError::compiler_not_found(compiler_id))?;
    if compiler.build_status == BuildStatus::Building {
        return Err(StoreError::conflict(format!(
            "compiler '{}' is currently building",
            compiler_id
        )));
    }
    Ok(compiler)
}

/// Reset a compiler to `pending` (optionally with a new definition) and queue a build
pub async fn rebuild_compiler(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    leases: &dyn LeaseRegistry,
    compiler_id: &str,
    change: DefinitionChange,
) -> StoreResult<()> {
    let lease = claim(leases, compiler_id).await?;
    let reset = async {
        let mut compiler = load_idle(store, compiler_id).await?;
        if let Some(dockerfile) = change.dockerfile_content {
            compiler.dockerfile_content = dockerfile;
        }
        if let Some(run_command) = change.run_command {
            compiler.run_command = run_command;
        }
        compiler.build_status = BuildStatus::Pending;
        compiler.build_error = None;
        compiler.updated_at = Utc::now();
        store.put_compiler(&compiler).await
    }
    .await;
    leases.release(&lease).await?;
    reset?;

    queue.push(&Job::build(compiler_id)).await?;
    info!(compiler_id = %compiler_id, "Rebuild queued");
    Ok(())
}

/// Delete a compiler record and queue removal of its image.
/// Rejected while a build is in flight so no build job is orphaned.
pub async fn delete_compiler(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    leases: &dyn LeaseRegistry,
    compiler_id: &str,
) -> StoreResult<()> {
    let lease = claim(leases, compiler_id).await?;
    let deleted = async {
        let compiler = load_idle(store, compiler_id).await?;
        store.delete_compiler(compiler_id).await?;
        StoreResult::Ok(compiler.image_tag)
    }
    .await;
    leases.release(&lease).await?;

    if let Some(image_tag) = deleted? {
        queue.push(&Job::cleanup(compiler_id, image_tag)).await?;
    }
    info!(compiler_id = %compiler_id, "Compiler deleted, cleanup queued");
    Ok(())
}

/// Flip the `enabled` flag. Disabled compilers reject new executions but
/// keep their image.
pub async fn set_enabled(
    store: &dyn StateStore,
    leases: &dyn LeaseRegistry,
    compiler_id: &str,
    enabled: bool,
) -> StoreResult<()> {
    let lease = claim(leases, compiler_id).await?;
    let updated = async {
        let mut compiler = load_idle(store, compiler_id).await?;
        compiler.enabled = enabled;
        compiler.updated_at = Utc::now();
        store.put_compiler(&compiler).await
    }
    .await;
    leases.release(&lease).await?;
    updated?;

    info!(compiler_id = %compiler_id, enabled, "Compiler availability changed");
    Ok(())
}

/// Persist a `PENDING` submission and queue its execution
pub async fn submit(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    submission: &Submission,
) -> StoreResult<Uuid> {
    if submission.status != SubmissionStatus::Pending {
        return Err(StoreError::conflict(format!(
            "submission {} must be created PENDING, not {}",
            submission.job_id, submission.status
        )));
    }
    store.put_submission(submission).await?;
    queue.push(&Job::execute(submission.job_id)).await?;
    info!(job_id = %submission.job_id, language = %submission.language, "Submission queued");
    Ok(submission.job_id)
}
