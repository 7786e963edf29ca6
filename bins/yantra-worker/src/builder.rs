/// Build Manager - drives the compiler build state machine
///
/// **State machine:** `pending | failed → building → ready | failed`
///
/// **Guarantees:**
/// - Builds write to a per-attempt staging tag; only a successful image is
///   promoted to the compiler's deterministic `image_tag`
/// - A failed build never touches `image_tag`
/// - Build output reaches `build_logs` while the build is still running
/// - Every exit path after `building` records a terminal status, unless the
///   store itself is unreachable (the reaper reclaims those)
/// - A result built from a definition that was edited meanwhile is discarded
///   and the compiler left `pending`
///
/// Mutual exclusion per compiler is the caller's job (see orchestrator.rs).
use crate::config::WorkerConfig;
use crate::engine::{BuildOutcome, ImageBuilder};
use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use yantra_common::store::StateStore;
use yantra_common::text;
use yantra_common::types::{BuildStatus, Compiler};

/// Hex digits of the definition hash kept in the tag
const TAG_HASH_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub timeout: Duration,
    pub log_limit: usize,
    pub error_limit: usize,
}

impl From<&WorkerConfig> for BuildSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            timeout: config.build_timeout(),
            log_limit: config.build_log_limit_bytes,
            error_limit: config.build_error_limit_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildReport {
    /// Nothing to do: record gone, already built, or owned by another attempt
    Skipped(String),
    Ready { image_tag: String },
    Failed { error: String },
}

fn is_separator(c: char) -> bool {
    matches!(c, '.' | '_' | '-')
}

/// Docker repository components are `[a-z0-9]+` joined by a single `.`, a
/// single or double `_`, or any run of `-`. Anything else becomes `-`, and
/// mixed or doubled separator runs collapse to one `-`.
fn sanitize_repository(id: &str) -> String {
    let mapped: Vec<char> = id
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect();

    let mut cleaned = String::with_capacity(mapped.len());
    let mut i = 0;
    while i < mapped.len() {
        if !is_separator(mapped[i]) {
            cleaned.push(mapped[i]);
            i += 1;
            continue;
        }
        let start = i;
        while i < mapped.len() && is_separator(mapped[i]) {
            i += 1;
        }
        let run = &mapped[start..i];
        let valid = run.len() == 1 || run.iter().all(|&c| c == '-');
        if valid {
            cleaned.extend(run);
        } else {
            cleaned.push('-');
        }
    }

    let trimmed = cleaned.trim_matches(is_separator);
    if trimmed.is_empty() {
        "compiler".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Deterministic tag: same id and definition always map to the same tag,
/// any edit to the Dockerfile or run command changes it. The raw id is part
/// of the digest, so ids that sanitize alike still get distinct tags.
pub fn image_tag_for(compiler: &Compiler) -> String {
    let mut hasher = Sha256::new();
    hasher.update(compiler.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(compiler.dockerfile_content.as_bytes());
    hasher.update([0u8]);
    for arg in &compiler.run_command {
        hasher.update(arg.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!(
        "yantra-{}:{}",
        sanitize_repository(&compiler.id),
        &digest[..TAG_HASH_LEN]
    )
}

fn staging_tag_for(compiler: &Compiler) -> String {
    let attempt = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "yantra-{}:staging-{}",
        sanitize_repository(&compiler.id),
        &attempt[..12]
    )
}

pub struct BuildManager {
    store: Arc<dyn StateStore>,
    builder: Arc<dyn ImageBuilder>,
    settings: BuildSettings,
}

impl BuildManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        builder: Arc<dyn ImageBuilder>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            store,
            builder,
            settings,
        }
    }

    #[instrument(skip(self), fields(compiler_id = %compiler_id))]
    pub async fn build(&self, compiler_id: &str) -> Result<BuildReport> {
        let Some(mut compiler) = self
            .store
            .get_compiler(compiler_id)
            .await
            .context("Failed to load compiler")?
        else {
            warn!("Build requested for unknown compiler, dropping job");
            return Ok(BuildReport::Skipped("compiler not found".into()));
        };

        match compiler.build_status {
            BuildStatus::Pending | BuildStatus::Failed => {}
            BuildStatus::Building => {
                warn!("Compiler already building, dropping duplicate job");
                return Ok(BuildReport::Skipped("already building".into()));
            }
            BuildStatus::Ready => {
                info!(image_tag = ?compiler.image_tag, "Compiler already ready, dropping duplicate job");
                return Ok(BuildReport::Skipped("already ready".into()));
            }
        }

        let now = Utc::now();
        compiler.build_status = BuildStatus::Building;
        compiler.build_error = None;
        compiler.build_logs.clear();
        compiler.build_started_at = Some(now);
        compiler.updated_at = now;
        self.store
            .put_compiler(&compiler)
            .await
            .context("Failed to mark compiler building")?;

        let target_tag = image_tag_for(&compiler);
        let staging_tag = staging_tag_for(&compiler);
        info!(image_tag = %target_tag, staging_tag = %staging_tag, "Build started");

        let started = std::time::Instant::now();
        let result = self.run_builder(&compiler, &staging_tag).await;

        let report = match result {
            Ok(BuildOutcome::Succeeded) => {
                match self.builder.promote(&staging_tag, &target_tag).await {
                    Ok(()) => BuildReport::Ready {
                        image_tag: target_tag.clone(),
                    },
                    Err(e) => BuildReport::Failed {
                        error: format!("Failed to promote built image: {}", e),
                    },
                }
            }
            Ok(BuildOutcome::Failed(message)) => BuildReport::Failed { error: message },
            Err(message) => BuildReport::Failed { error: message },
        };

        if let Err(e) = self.builder.remove(&staging_tag).await {
            warn!(staging_tag = %staging_tag, error = %e, "Failed to remove staging tag");
        }

        let report = self.finish(compiler_id, &target_tag, report).await?;

        info!(
            status = match &report {
                BuildReport::Ready { .. } => "ready",
                BuildReport::Failed { .. } => "failed",
                BuildReport::Skipped(_) => "discarded",
            },
            build_ms = started.elapsed().as_millis(),
            "Build finished"
        );
        Ok(report)
    }

    /// Whether a build job for this compiler still has work to do
    pub async fn wants_build(&self, compiler_id: &str) -> Result<bool> {
        let compiler = self
            .store
            .get_compiler(compiler_id)
            .await
            .context("Failed to load compiler")?;
        Ok(matches!(
            compiler.map(|c| c.build_status),
            Some(BuildStatus::Pending | BuildStatus::Failed)
        ))
    }

    /// Run the builder under the ceiling while draining its output into
    /// `build_logs`. `Err` carries a human-readable failure.
    async fn run_builder(
        &self,
        compiler: &Compiler,
        staging_tag: &str,
    ) -> std::result::Result<BuildOutcome, String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let build = self
            .builder
            .build(&compiler.dockerfile_content, staging_tag, tx);

        let drain = async {
            while let Some(line) = rx.recv().await {
                let mut chunk = line;
                while let Ok(more) = rx.try_recv() {
                    chunk.push_str(&more);
                }
                if let Err(e) = self
                    .store
                    .append_build_logs(&compiler.id, &chunk, self.settings.log_limit)
                    .await
                {
                    warn!(compiler_id = %compiler.id, error = %e, "Failed to append build logs");
                }
            }
        };

        match tokio::time::timeout(self.settings.timeout, async { tokio::join!(build, drain).0 })
            .await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(format!("Image builder error: {}", e)),
            Err(_) => Err(format!(
                "Build exceeded the {} second limit",
                self.settings.timeout.as_secs()
            )),
        }
    }

    /// Persist the terminal state on top of the latest record so streamed
    /// logs are kept. A record whose definition no longer hashes to
    /// `target_tag` was edited mid-build: the result is thrown away and the
    /// compiler goes back to `pending` for the edit's own build job.
    async fn finish(
        &self,
        compiler_id: &str,
        target_tag: &str,
        report: BuildReport,
    ) -> Result<BuildReport> {
        let current = self
            .store
            .get_compiler(compiler_id)
            .await
            .context("Failed to reload compiler")?;

        let mut compiler = match current {
            Some(compiler) if image_tag_for(&compiler) == target_tag => compiler,
            stale => {
                if matches!(report, BuildReport::Ready { .. }) {
                    self.discard(target_tag).await;
                }
                let Some(mut compiler) = stale else {
                    warn!("Compiler disappeared during build");
                    return Ok(BuildReport::Skipped("compiler deleted during build".into()));
                };
                warn!(image_tag = %target_tag, "Definition changed during build, discarding result");
                compiler.build_status = BuildStatus::Pending;
                text::append_bounded(
                    &mut compiler.build_logs,
                    "\n[definition changed during build; result discarded]\n",
                    self.settings.log_limit,
                );
                compiler.updated_at = Utc::now();
                self.store
                    .put_compiler(&compiler)
                    .await
                    .context("Failed to reset edited compiler")?;
                return Ok(BuildReport::Skipped("definition changed during build".into()));
            }
        };

        if let BuildReport::Skipped(_) = report {
            return Ok(report);
        }

        let now = Utc::now();
        match &report {
            BuildReport::Ready { image_tag } => {
                compiler.build_status = BuildStatus::Ready;
                compiler.build_error = None;
                compiler.image_tag = Some(image_tag.clone());
                compiler.built_at = Some(now);
            }
            BuildReport::Failed { error } => {
                compiler.build_status = BuildStatus::Failed;
                compiler.build_error =
                    Some(text::tail(error.trim_end(), self.settings.error_limit).to_string());
                if !error.is_empty() {
                    text::append_bounded(
                        &mut compiler.build_logs,
                        &format!("\n{}\n", error.trim_end()),
                        self.settings.log_limit,
                    );
                }
            }
            BuildReport::Skipped(_) => {}
        }
        compiler.updated_at = now;

        self.store
            .put_compiler(&compiler)
            .await
            .context("Failed to record build result")?;
        Ok(report)
    }

    /// Drop a freshly promoted image nobody will point at
    async fn discard(&self, image_tag: &str) {
        if let Err(e) = self.remove_unreferenced(image_tag).await {
            warn!(image_tag = %image_tag, error = ?e, "Failed to discard unused image");
        }
    }

    /// Remove `image_tag` unless some compiler record still points at it.
    /// Returns whether it was removed.
    async fn remove_unreferenced(&self, image_tag: &str) -> Result<bool> {
        let compilers = self
            .store
            .list_compilers()
            .await
            .context("Failed to list compilers")?;
        if let Some(owner) = compilers
            .iter()
            .find(|c| c.image_tag.as_deref() == Some(image_tag))
        {
            info!(image_tag = %image_tag, owner = %owner.id, "Image still referenced by a live compiler, keeping it");
            return Ok(false);
        }
        self.builder
            .remove(image_tag)
            .await
            .with_context(|| format!("Failed to remove image {}", image_tag))?;
        Ok(true)
    }

    /// Remove an image left behind by a deleted or rebuilt compiler, unless
    /// any live compiler record still points at the same tag
    #[instrument(skip(self), fields(compiler_id = %compiler_id, image_tag = %image_tag))]
    pub async fn cleanup(&self, compiler_id: &str, image_tag: &str) -> Result<()> {
        if self.remove_unreferenced(image_tag).await? {
            info!("Image removed");
        }
        Ok(())
    }
}
