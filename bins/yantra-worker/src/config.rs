// Worker configuration for the Yantra orchestrator
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use yantra_common::config::DEFAULT_STAGING_ROOT;

pub const DEFAULT_CONFIG_PATH: &str = "config/worker.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum jobs (builds + executions) in flight in this process
    pub pool_size: usize,
    /// Ceiling for a single image build
    pub build_timeout_secs: u64,
    /// `build_logs` keeps only the last N bytes
    pub build_log_limit_bytes: usize,
    /// `build_error` keeps only the last N bytes of the failure output
    pub build_error_limit_bytes: usize,
    /// Cap for each of stdout / stderr captured from a run
    pub output_limit_bytes: usize,
    pub staging_root: String,
    /// Where staged files appear inside the container (read-only)
    pub sandbox_mount_path: String,
    pub working_dir: String,
    /// Size of the writable tmpfs mounted at /tmp; empty disables it
    pub scratch_size: String,
    pub pids_limit: i64,
    /// Alternative OCI runtime, e.g. "runsc" for gVisor
    pub container_runtime: Option<String>,
    /// Launch attempts for infrastructure failures before settling on ERROR
    pub infra_retry_attempts: u32,
    /// Added to the compiler's timeout to size an execution lease; covers
    /// launch retries and teardown
    pub execution_lease_margin_secs: u64,
    /// Wait before a job blocked by a held lease goes back on the queue
    pub defer_delay_secs: u64,
    pub reaper_interval_secs: u64,
    pub reaper_grace_secs: u64,
    /// BLPOP timeout; bounds how long shutdown waits on an idle queue
    pub poll_timeout_secs: f64,
    pub health_addr: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            build_timeout_secs: 600,
            build_log_limit_bytes: 64 * 1024,
            build_error_limit_bytes: 4 * 1024,
            output_limit_bytes: 1024 * 1024,
            staging_root: DEFAULT_STAGING_ROOT.to_string(),
            sandbox_mount_path: "/sandbox/files".to_string(),
            working_dir: "/sandbox".to_string(),
            scratch_size: "64m".to_string(),
            pids_limit: 256,
            container_runtime: None,
            infra_retry_attempts: 3,
            execution_lease_margin_secs: 120,
            defer_delay_secs: 5,
            reaper_interval_secs: 30,
            reaper_grace_secs: 60,
            poll_timeout_secs: 5.0,
            health_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load from a JSON file. Unset fields fall back to defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: WorkerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `YANTRA_WORKER_CONFIG` (or config/worker.json) if present, then
    /// apply environment overrides
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("YANTRA_WORKER_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);

        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for the knobs operators touch most
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("YANTRA_POOL_SIZE") {
            self.pool_size = v
                .parse()
                .with_context(|| format!("YANTRA_POOL_SIZE must be an integer, got {:?}", v))?;
        }
        if let Some(v) = lookup("YANTRA_STAGING_ROOT") {
            self.staging_root = v;
        }
        if let Some(v) = lookup("YANTRA_CONTAINER_RUNTIME") {
            self.container_runtime = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("YANTRA_BUILD_TIMEOUT_SECS") {
            self.build_timeout_secs = v.parse().with_context(|| {
                format!("YANTRA_BUILD_TIMEOUT_SECS must be an integer, got {:?}", v)
            })?;
        }
        if let Some(v) = lookup("YANTRA_HEALTH_ADDR") {
            self.health_addr = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.build_log_limit_bytes == 0 || self.build_error_limit_bytes == 0 {
            bail!("build log limits must be non-zero");
        }
        if self.output_limit_bytes == 0 {
            bail!("output_limit_bytes must be non-zero");
        }
        if self.build_timeout_secs == 0 {
            bail!("build_timeout_secs must be non-zero");
        }
        if self.execution_lease_margin_secs <= self.reaper_grace_secs {
            bail!(
                "execution_lease_margin_secs ({}) must exceed reaper_grace_secs ({}) or the reaper can fail live executions",
                self.execution_lease_margin_secs,
                self.reaper_grace_secs
            );
        }
        if !self.sandbox_mount_path.starts_with('/') {
            bail!("sandbox_mount_path must be absolute, got {}", self.sandbox_mount_path);
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Build lease outlives the build ceiling so a live build is never reclaimed
    pub fn build_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs + self.reaper_grace_secs)
    }

    pub fn execution_lease_margin(&self) -> Duration {
        Duration::from_secs(self.execution_lease_margin_secs)
    }

    pub fn defer_delay(&self) -> Duration {
        Duration::from_secs(self.defer_delay_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.poll_timeout_secs)
    }
}
