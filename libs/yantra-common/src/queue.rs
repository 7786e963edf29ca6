//! Job queue seam. Producers push typed jobs; workers block on `pop`.
//!
//! Delivery is at-least-once: consumers must treat a job for an already
//! settled record as a no-op.

use crate::error::StoreResult;
use crate::types::{Job, JobKind};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: &Job) -> StoreResult<()>;

    /// Wait up to `timeout` for the next job. Build work is served before
    /// execution work when both are waiting.
    async fn pop(&self, timeout: Duration) -> StoreResult<Option<Job>>;
}

#[derive(Default)]
pub struct MemoryQueue {
    builds: Mutex<VecDeque<Job>>,
    executions: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let builds = self.builds.lock().unwrap_or_else(|e| e.into_inner()).len();
        let executions = self.executions.lock().unwrap_or_else(|e| e.into_inner()).len();
        builds + executions
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queued jobs, builds first
    pub fn pending(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        jobs.extend(
            self.executions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned(),
        );
        jobs
    }

    fn try_pop(&self) -> Option<Job> {
        if let Some(job) = self.builds.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            return Some(job);
        }
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, job: &Job) -> StoreResult<()> {
        let lane = match job.kind() {
            JobKind::Build => &self.builds,
            JobKind::Execution => &self.executions,
        };
        lane.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> StoreResult<Option<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_pop() {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.try_pop());
            }
        }
    }
}
