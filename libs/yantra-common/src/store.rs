//! Persisted state for compilers and submissions.
//!
//! The orchestrator reads and updates records by primary key. Readers (the API,
//! the CLI) must tolerate intermediate states such as `building` or `RUNNING`:
//! there is no transactional handoff to pollers.

use crate::error::StoreResult;
use crate::text;
use crate::types::{Compiler, Submission, SubmissionStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_compiler(&self, id: &str) -> StoreResult<Option<Compiler>>;

    async fn put_compiler(&self, compiler: &Compiler) -> StoreResult<()>;

    async fn delete_compiler(&self, id: &str) -> StoreResult<()>;

    async fn list_compilers(&self) -> StoreResult<Vec<Compiler>>;

    /// Append to `build_logs`, keeping only the last `limit` bytes.
    /// Also bumps `updated_at`, which the reaper reads as a build heartbeat.
    async fn append_build_logs(&self, id: &str, chunk: &str, limit: usize) -> StoreResult<()>;

    async fn get_submission(&self, id: &Uuid) -> StoreResult<Option<Submission>>;

    async fn put_submission(&self, submission: &Submission) -> StoreResult<()>;

    /// Submissions not yet in a terminal state
    async fn list_active_submissions(&self) -> StoreResult<Vec<Submission>>;
}

/// In-process store used by tests and single-node setups
#[derive(Default)]
pub struct MemoryStore {
    compilers: Mutex<HashMap<String, Compiler>>,
    submissions: Mutex<HashMap<Uuid, Submission>>,
    history: Mutex<HashMap<Uuid, Vec<SubmissionStatus>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status a submission was persisted with, in order
    pub fn submission_history(&self, id: &Uuid) -> Vec<SubmissionStatus> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_compiler(&self, id: &str) -> StoreResult<Option<Compiler>> {
        let compilers = self.compilers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(compilers.get(id).cloned())
    }

    async fn put_compiler(&self, compiler: &Compiler) -> StoreResult<()> {
        let mut compilers = self.compilers.lock().unwrap_or_else(|e| e.into_inner());
        compilers.insert(compiler.id.clone(), compiler.clone());
        Ok(())
    }

    async fn delete_compiler(&self, id: &str) -> StoreResult<()> {
        let mut compilers = self.compilers.lock().unwrap_or_else(|e| e.into_inner());
        compilers.remove(id);
        Ok(())
    }

    async fn list_compilers(&self) -> StoreResult<Vec<Compiler>> {
        let compilers = self.compilers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(compilers.values().cloned().collect())
    }

    async fn append_build_logs(&self, id: &str, chunk: &str, limit: usize) -> StoreResult<()> {
        let mut compilers = self.compilers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(compiler) = compilers.get_mut(id) {
            text::append_bounded(&mut compiler.build_logs, chunk, limit);
            compiler.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_submission(&self, id: &Uuid) -> StoreResult<Option<Submission>> {
        let submissions = self.submissions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(submissions.get(id).cloned())
    }

    async fn put_submission(&self, submission: &Submission) -> StoreResult<()> {
        {
            let mut submissions = self.submissions.lock().unwrap_or_else(|e| e.into_inner());
            submissions.insert(submission.job_id, submission.clone());
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .entry(submission.job_id)
            .or_default()
            .push(submission.status);
        Ok(())
    }

    async fn list_active_submissions(&self) -> StoreResult<Vec<Submission>> {
        let submissions = self.submissions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(submissions
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BuildStatus;

    #[tokio::test]
    async fn test_append_build_logs_is_bounded() {
        let store = MemoryStore::new();
        let mut compiler = Compiler::new("c", "C", "FROM scratch", vec!["true".into()]);
        compiler.build_status = BuildStatus::Building;
        store.put_compiler(&compiler).await.unwrap();

        store.append_build_logs("c", "step 1\n", 10).await.unwrap();
        store.append_build_logs("c", "step 2\n", 10).await.unwrap();

        let stored = store.get_compiler("c").await.unwrap().unwrap();
        assert_eq!(stored.build_logs, " 1\nstep 2\n");
        assert!(stored.updated_at >= compiler.updated_at);
    }

    #[tokio::test]
    async fn test_active_submissions_exclude_terminal() {
        let store = MemoryStore::new();
        let pending = Submission::new("print(1)", "py");
        let mut done = Submission::new("print(2)", "py");
        done.status = SubmissionStatus::Completed;
        store.put_submission(&pending).await.unwrap();
        store.put_submission(&done).await.unwrap();

        let active = store.list_active_submissions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].job_id, pending.job_id);
    }

    #[tokio::test]
    async fn test_history_records_every_write() {
        let store = MemoryStore::new();
        let mut sub = Submission::new("x", "py");
        store.put_submission(&sub).await.unwrap();
        sub.status = SubmissionStatus::Running;
        store.put_submission(&sub).await.unwrap();
        assert_eq!(
            store.submission_history(&sub.job_id),
            vec![SubmissionStatus::Pending, SubmissionStatus::Running]
        );
    }
}
