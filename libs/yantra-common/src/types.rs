use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default resource policy for newly registered compilers
pub const DEFAULT_MEMORY_LIMIT: &str = "512m";
pub const DEFAULT_CPU_LIMIT: &str = "1";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Building,
    Ready,
    Failed,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Building => "building",
            BuildStatus::Ready => "ready",
            BuildStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A user-defined runtime environment: Dockerfile + run command + resource policy.
///
/// Only the build manager moves `build_status`; while it is `Building` nobody
/// else writes the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compiler {
    pub id: String,
    pub name: String,
    pub dockerfile_content: String,
    pub run_command: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub memory_limit: String,
    pub cpu_limit: String,
    pub timeout_seconds: u64,
    pub enabled: bool,
    pub build_status: BuildStatus,
    #[serde(default)]
    pub build_error: Option<String>,
    #[serde(default)]
    pub build_logs: String,
    /// Tag of the last successfully promoted image, if any
    #[serde(default)]
    pub image_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub build_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub built_at: Option<DateTime<Utc>>,
}

impl Compiler {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        dockerfile_content: impl Into<String>,
        run_command: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            dockerfile_content: dockerfile_content.into(),
            run_command,
            version: None,
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            cpu_limit: DEFAULT_CPU_LIMIT.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            enabled: true,
            build_status: BuildStatus::Pending,
            build_error: None,
            build_logs: String::new(),
            image_tag: None,
            created_at: now,
            updated_at: now,
            build_started_at: None,
            built_at: None,
        }
    }

    /// Ready to accept executions: enabled, built, and carrying an image tag
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.build_status == BuildStatus::Ready && self.image_tag.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Error,
}

impl SubmissionStatus {
    /// No transition ever leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed
                | SubmissionStatus::Failed
                | SubmissionStatus::Timeout
                | SubmissionStatus::Error
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Running => "RUNNING",
            SubmissionStatus::Completed => "COMPLETED",
            SubmissionStatus::Failed => "FAILED",
            SubmissionStatus::Timeout => "TIMEOUT",
            SubmissionStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A single request to run user code under a compiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub job_id: Uuid,
    pub code: String,
    /// Compiler id
    pub language: String,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub output_stdout: Option<String>,
    #[serde(default)]
    pub output_stderr: Option<String>,
    #[serde(default)]
    pub uploaded_files: Vec<UploadedFile>,
    /// Staging directory owned by this submission
    #[serde(default)]
    pub files_directory: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last write by any party; the reaper reads it to spot stalled work
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            code: code.into(),
            language: language.into(),
            status: SubmissionStatus::Pending,
            output_stdout: None,
            output_stderr: None,
            uploaded_files: Vec::new(),
            files_directory: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub compiler_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub submission_id: Uuid,
}

/// Image removal for a deleted compiler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupJob {
    pub compiler_id: String,
    pub image_tag: String,
}

/// Unit of work carried by the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Build(BuildJob),
    Execute(ExecutionJob),
    Cleanup(CleanupJob),
}

impl Job {
    pub fn build(compiler_id: impl Into<String>) -> Self {
        Job::Build(BuildJob {
            compiler_id: compiler_id.into(),
        })
    }

    pub fn execute(submission_id: Uuid) -> Self {
        Job::Execute(ExecutionJob { submission_id })
    }

    pub fn cleanup(compiler_id: impl Into<String>, image_tag: impl Into<String>) -> Self {
        Job::Cleanup(CleanupJob {
            compiler_id: compiler_id.into(),
            image_tag: image_tag.into(),
        })
    }

    /// Which queue the job travels on
    pub fn kind(&self) -> JobKind {
        match self {
            Job::Build(_) | Job::Cleanup(_) => JobKind::Build,
            Job::Execute(_) => JobKind::Execution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Build,
    Execution,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Build => write!(f, "build"),
            JobKind::Execution => write!(f, "exec"),
        }
    }
}
