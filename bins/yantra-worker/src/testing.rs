//! In-process doubles for the container runtime and the state layer, with
//! counters the orchestrator tests assert on.

use crate::engine::{BuildOutcome, ContainerRunner, ImageBuilder, RunSpec, RunningContainer};
use crate::error::EngineError;
use crate::evaluator::{Captured, RunExit};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use yantra_common::error::{StoreError, StoreResult};
use yantra_common::queue::JobQueue;
use yantra_common::store::{MemoryStore, StateStore};
use yantra_common::types::{Compiler, Job, Submission};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tracks how many calls overlap
#[derive(Default)]
pub struct Concurrency {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedBuild {
    Succeed { lines: Vec<String>, delay: Duration },
    /// The Dockerfile is broken
    Fail { lines: Vec<String>, message: String },
    /// The builder itself blew up
    Crash(String),
    /// Never finishes on its own
    Hang,
}

impl ScriptedBuild {
    pub fn ok() -> Self {
        ScriptedBuild::Succeed {
            lines: vec!["Step 1/1 : FROM scratch\n".into()],
            delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
pub struct FakeBuilder {
    script: Mutex<VecDeque<ScriptedBuild>>,
    pub builds: AtomicUsize,
    pub concurrency: Concurrency,
    pub images: Mutex<HashSet<String>>,
    pub promoted: Mutex<Vec<(String, String)>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behaviour of the next build; unscripted builds succeed
    pub fn then(&self, build: ScriptedBuild) -> &Self {
        lock(&self.script).push_back(build);
        self
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn has_image(&self, tag: &str) -> bool {
        lock(&self.images).contains(tag)
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(
        &self,
        _dockerfile: &str,
        tag: &str,
        logs: UnboundedSender<String>,
    ) -> Result<BuildOutcome, EngineError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.concurrency.enter();
        let step = lock(&self.script).pop_front().unwrap_or_else(ScriptedBuild::ok);

        let result = match step {
            ScriptedBuild::Succeed { lines, delay } => {
                for line in lines {
                    let _ = logs.send(line);
                    tokio::task::yield_now().await;
                }
                tokio::time::sleep(delay).await;
                lock(&self.images).insert(tag.to_string());
                Ok(BuildOutcome::Succeeded)
            }
            ScriptedBuild::Fail { lines, message } => {
                for line in lines {
                    let _ = logs.send(line);
                }
                Ok(BuildOutcome::Failed(message))
            }
            ScriptedBuild::Crash(message) => Err(EngineError::Unavailable(message)),
            ScriptedBuild::Hang => {
                let _ = logs.send("Step 1/2 : RUN sleep infinity\n".into());
                std::future::pending::<()>().await;
                unreachable!()
            }
        };

        self.concurrency.exit();
        result
    }

    async fn promote(&self, source: &str, target: &str) -> Result<(), EngineError> {
        if !lock(&self.images).contains(source) {
            return Err(EngineError::ImageMissing(source.to_string()));
        }
        lock(&self.images).insert(target.to_string());
        lock(&self.promoted).push((source.to_string(), target.to_string()));
        Ok(())
    }

    async fn remove(&self, tag: &str) -> Result<(), EngineError> {
        lock(&self.images).remove(tag);
        lock(&self.removed).push(tag.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LaunchFailure {
    ImageMissing,
    Mount,
    /// Daemon hiccup that a retry can get past
    Transient,
}

#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
        delay: Duration,
    },
    /// Prints `stdout` then never exits
    Hang { stdout: String },
    LaunchError(LaunchFailure),
}

impl ScriptedRun {
    pub fn exit(code: i64, stdout: &str, stderr: &str) -> Self {
        ScriptedRun::Exit {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            delay: Duration::ZERO,
        }
    }
}

/// What the runner saw for one launched container
#[derive(Debug, Clone)]
pub struct ObservedRun {
    pub spec: RunSpec,
    /// Each mounted host path existed when the container started
    pub mounts_present_at_start: bool,
    /// ...and still existed when the run ended or was killed
    pub mounts_present_at_end: Option<bool>,
}

#[derive(Default)]
pub struct RunnerTrace {
    pub launch_attempts: AtomicUsize,
    pub concurrency: Concurrency,
    pub observed: Mutex<Vec<ObservedRun>>,
    pub kills: AtomicUsize,
}

#[derive(Default)]
pub struct FakeRunner {
    script: Mutex<VecDeque<ScriptedRun>>,
    pub trace: Arc<RunnerTrace>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behaviour of the next launch; unscripted runs exit 0 silently
    pub fn then(&self, run: ScriptedRun) -> &Self {
        lock(&self.script).push_back(run);
        self
    }

    /// Containers actually started (launch failures excluded)
    pub fn run_count(&self) -> usize {
        lock(&self.trace.observed).len()
    }

    pub fn launch_attempts(&self) -> usize {
        self.trace.launch_attempts.load(Ordering::SeqCst)
    }

    pub fn observed(&self) -> Vec<ObservedRun> {
        lock(&self.trace.observed).clone()
    }
}

fn mounts_present(paths: &[PathBuf]) -> bool {
    paths.iter().all(|p| p.is_dir())
}

#[async_trait]
impl ContainerRunner for FakeRunner {
    async fn start(&self, spec: &RunSpec) -> Result<Box<dyn RunningContainer>, EngineError> {
        self.trace.launch_attempts.fetch_add(1, Ordering::SeqCst);
        let step = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::exit(0, "", ""));

        if let ScriptedRun::LaunchError(kind) = step {
            return Err(match kind {
                LaunchFailure::ImageMissing => EngineError::ImageMissing(spec.image_tag.clone()),
                LaunchFailure::Mount => EngineError::Mount("bind source path does not exist".into()),
                LaunchFailure::Transient => EngineError::Runtime("containerd hiccup".into()),
            });
        }

        let mounts: Vec<PathBuf> = spec.mounts.iter().map(|m| m.host_path.clone()).collect();
        let index = {
            let mut observed = lock(&self.trace.observed);
            observed.push(ObservedRun {
                spec: spec.clone(),
                mounts_present_at_start: mounts_present(&mounts),
                mounts_present_at_end: None,
            });
            observed.len() - 1
        };
        self.trace.concurrency.enter();

        Ok(Box::new(FakeContainer {
            trace: self.trace.clone(),
            index,
            mounts,
            step,
            finished: false,
        }))
    }
}

struct FakeContainer {
    trace: Arc<RunnerTrace>,
    index: usize,
    mounts: Vec<PathBuf>,
    step: ScriptedRun,
    finished: bool,
}

impl FakeContainer {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            lock(&self.trace.observed)[self.index].mounts_present_at_end =
                Some(mounts_present(&self.mounts));
            self.trace.concurrency.exit();
        }
    }
}

#[async_trait]
impl RunningContainer for FakeContainer {
    async fn wait(&mut self) -> Result<RunExit, EngineError> {
        match self.step.clone() {
            ScriptedRun::Exit {
                code,
                stdout,
                stderr,
                delay,
            } => {
                tokio::time::sleep(delay).await;
                self.finish();
                Ok(RunExit {
                    exit_code: code,
                    stdout,
                    stderr,
                })
            }
            ScriptedRun::Hang { .. } => std::future::pending().await,
            ScriptedRun::LaunchError(_) => unreachable!("launch errors never produce a container"),
        }
    }

    async fn kill(&mut self) -> Captured {
        self.trace.kills.fetch_add(1, Ordering::SeqCst);
        self.finish();
        match &self.step {
            ScriptedRun::Hang { stdout } => Captured {
                stdout: stdout.clone(),
                stderr: String::new(),
            },
            _ => Captured::default(),
        }
    }
}

impl Drop for FakeContainer {
    fn drop(&mut self) {
        self.finish();
    }
}

/// `MemoryStore` whose submission writes can be made to fail
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    pub fail_submission_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_submission_writes: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_submission_writes.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get_compiler(&self, id: &str) -> StoreResult<Option<Compiler>> {
        self.inner.get_compiler(id).await
    }

    async fn put_compiler(&self, compiler: &Compiler) -> StoreResult<()> {
        self.inner.put_compiler(compiler).await
    }

    async fn delete_compiler(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_compiler(id).await
    }

    async fn list_compilers(&self) -> StoreResult<Vec<Compiler>> {
        self.inner.list_compilers().await
    }

    async fn append_build_logs(&self, id: &str, chunk: &str, limit: usize) -> StoreResult<()> {
        self.inner.append_build_logs(id, chunk, limit).await
    }

    async fn get_submission(&self, id: &Uuid) -> StoreResult<Option<Submission>> {
        self.inner.get_submission(id).await
    }

    async fn put_submission(&self, submission: &Submission) -> StoreResult<()> {
        if self.fail_submission_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        self.inner.put_submission(submission).await
    }

    async fn list_active_submissions(&self) -> StoreResult<Vec<Submission>> {
        self.inner.list_active_submissions().await
    }
}

/// Counts the pops that actually handed out a job
pub struct CountingQueue<Q> {
    pub inner: Q,
    pub delivered: AtomicUsize,
}

impl<Q> CountingQueue<Q> {
    pub fn new(inner: Q) -> Self {
        Self {
            inner,
            delivered: AtomicUsize::new(0),
        }
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<Q: JobQueue> JobQueue for CountingQueue<Q> {
    async fn push(&self, job: &Job) -> StoreResult<()> {
        self.inner.push(job).await
    }

    async fn pop(&self, timeout: Duration) -> StoreResult<Option<Job>> {
        let job = self.inner.pop(timeout).await?;
        if job.is_some() {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(job)
    }
}
