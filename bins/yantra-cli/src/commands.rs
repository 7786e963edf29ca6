// CLI commands for operating Yantra
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;
use yantra_common::leases::LeaseRegistry;
use yantra_common::producer::{self, DefinitionChange};
use yantra_common::queue::JobQueue;
use yantra_common::reaper::{self, ReaperPolicy};
use yantra_common::staging::StagingArea;
use yantra_common::store::StateStore;
use yantra_common::types::{BuildStatus, Compiler, Submission};

/// Definition of a new compiler as given on the command line
#[derive(Debug, Clone)]
pub struct CompilerArgs {
    pub id: String,
    pub name: Option<String>,
    pub dockerfile: PathBuf,
    pub run_command: Vec<String>,
    pub version: Option<String>,
    pub memory: String,
    pub cpu: String,
    pub timeout_seconds: u64,
    pub disabled: bool,
}

fn read_dockerfile(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read Dockerfile {}", path.display()))?;
    if content.trim().is_empty() {
        bail!("Dockerfile {} is empty", path.display());
    }
    Ok(content)
}

pub fn compiler_from_args(args: CompilerArgs) -> Result<Compiler> {
    if args.run_command.is_empty() {
        bail!("run command must have at least one argument");
    }
    if args.timeout_seconds == 0 {
        bail!("timeout must be at least one second");
    }
    let dockerfile = read_dockerfile(&args.dockerfile)?;
    let name = args.name.unwrap_or_else(|| args.id.clone());

    let mut compiler = Compiler::new(args.id, name, dockerfile, args.run_command);
    compiler.version = args.version;
    compiler.memory_limit = args.memory;
    compiler.cpu_limit = args.cpu;
    compiler.timeout_seconds = args.timeout_seconds;
    compiler.enabled = !args.disabled;
    Ok(compiler)
}

pub async fn add_compiler(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    args: CompilerArgs,
) -> Result<()> {
    let compiler = compiler_from_args(args)?;
    let id = compiler.id.clone();
    println!("🚀 Registering compiler: {}", id);
    producer::register_compiler(store, queue, compiler).await?;
    println!("✅ Compiler '{}' saved, build queued", id);
    println!("\n📋 Follow the build with: yantra-cli status compiler --id {} --logs", id);
    Ok(())
}

pub async fn rebuild(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    leases: &dyn LeaseRegistry,
    id: &str,
    dockerfile: Option<&Path>,
    run_command: Option<Vec<String>>,
) -> Result<()> {
    let change = DefinitionChange {
        dockerfile_content: dockerfile.map(read_dockerfile).transpose()?,
        run_command: run_command.filter(|args| !args.is_empty()),
    };
    producer::rebuild_compiler(store, queue, leases, id, change).await?;
    println!("🔨 Rebuild queued for '{}'", id);
    Ok(())
}

pub async fn delete(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    leases: &dyn LeaseRegistry,
    id: &str,
) -> Result<()> {
    println!("🗑️  Deleting compiler: {}", id);
    producer::delete_compiler(store, queue, leases, id).await?;
    println!("✅ Compiler '{}' deleted; its image will be removed by a worker", id);
    Ok(())
}

pub async fn set_enabled(
    store: &dyn StateStore,
    leases: &dyn LeaseRegistry,
    id: &str,
    enabled: bool,
) -> Result<()> {
    producer::set_enabled(store, leases, id, enabled).await?;
    println!(
        "✅ Compiler '{}' {}",
        id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn guess_mime(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" | "in" | "out" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    };
    Some(mime.to_string())
}

/// Copy local files into the submission's staging directory
pub fn stage_uploads(
    staging: &StagingArea,
    submission: &mut Submission,
    files: &[PathBuf],
) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    for path in files {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?;
        let contents =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let meta = staging
            .write_file(&submission.job_id, filename, &contents, guess_mime(filename))
            .with_context(|| format!("Failed to stage {}", filename))?;
        submission.uploaded_files.push(meta);
    }
    submission.files_directory = Some(staging.dir_for(&submission.job_id).display().to_string());
    Ok(())
}

pub async fn submit(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    staging: &StagingArea,
    language: &str,
    code: String,
    files: &[PathBuf],
) -> Result<Uuid> {
    let mut submission = Submission::new(code, language);

    if let Err(e) = stage_uploads(staging, &mut submission, files) {
        let _ = staging.remove(&staging.dir_for(&submission.job_id));
        return Err(e);
    }

    if let Err(e) = producer::submit(store, queue, &submission).await {
        let _ = staging.remove(&staging.dir_for(&submission.job_id));
        return Err(e.into());
    }

    println!("📨 Submission {} queued on '{}'", submission.job_id, language);
    if !submission.uploaded_files.is_empty() {
        println!("   {} file(s) staged", submission.uploaded_files.len());
    }
    Ok(submission.job_id)
}

/// Poll until the submission settles or `deadline` passes
pub async fn wait_for(
    store: &dyn StateStore,
    id: &Uuid,
    interval: Duration,
    deadline: Duration,
) -> Result<Submission> {
    let started = tokio::time::Instant::now();
    loop {
        let submission = store
            .get_submission(id)
            .await?
            .with_context(|| format!("submission {} not found", id))?;
        if submission.status.is_terminal() {
            return Ok(submission);
        }
        if started.elapsed() >= deadline {
            bail!(
                "submission {} still {} after {}s",
                id,
                submission.status,
                deadline.as_secs()
            );
        }
        tokio::time::sleep(interval).await;
    }
}

fn build_badge(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Pending => "⏳",
        BuildStatus::Building => "🔨",
        BuildStatus::Ready => "✅",
        BuildStatus::Failed => "❌",
    }
}

pub fn print_compiler(compiler: &Compiler, show_logs: bool) {
    println!("{} {} ({})", build_badge(compiler.build_status), compiler.name, compiler.id);
    println!("  status:      {}", compiler.build_status);
    println!("  enabled:     {}", compiler.enabled);
    println!("  image:       {}", compiler.image_tag.as_deref().unwrap_or("-"));
    println!("  run command: {}", compiler.run_command.join(" "));
    println!(
        "  limits:      memory {} / cpu {} / {}s",
        compiler.memory_limit, compiler.cpu_limit, compiler.timeout_seconds
    );
    if let Some(built_at) = compiler.built_at {
        println!("  built at:    {}", built_at.to_rfc3339());
    }
    if let Some(error) = &compiler.build_error {
        println!("  build error:\n{}", indent(error));
    }
    if show_logs && !compiler.build_logs.is_empty() {
        println!("  build logs:\n{}", indent(&compiler.build_logs));
    }
}

pub fn print_compiler_table(compilers: &[Compiler]) {
    if compilers.is_empty() {
        println!("No compilers registered.");
        println!("\n💡 Add one with: yantra-cli add-compiler --id <id> --dockerfile <path> --run <cmd>...");
        return;
    }

    println!("📋 Compilers:\n");
    println!(
        "{:<20} {:<10} {:<8} {:<36} {:<8}",
        "ID", "STATUS", "ENABLED", "IMAGE", "TIMEOUT"
    );
    println!("{}", "─".repeat(86));
    for c in compilers {
        println!(
            "{:<20} {:<10} {:<8} {:<36} {:<8}",
            c.id,
            c.build_status.to_string(),
            c.enabled,
            c.image_tag.as_deref().unwrap_or("-"),
            format!("{}s", c.timeout_seconds)
        );
    }
    println!("\n✅ Total: {} compiler(s)", compilers.len());
}

pub fn print_submission(submission: &Submission) {
    println!("📄 Submission {}", submission.job_id);
    println!("  language: {}", submission.language);
    println!("  status:   {}", submission.status);
    if let (Some(started), Some(completed)) = (submission.started_at, submission.completed_at) {
        println!(
            "  runtime:  {} ms",
            (completed - started).num_milliseconds()
        );
    }
    if !submission.uploaded_files.is_empty() {
        let names: Vec<&str> = submission
            .uploaded_files
            .iter()
            .map(|f| f.filename.as_str())
            .collect();
        println!("  files:    {}", names.join(", "));
    }
    if let Some(stdout) = &submission.output_stdout {
        println!("  stdout:\n{}", indent(stdout));
    }
    if let Some(stderr) = &submission.output_stderr {
        println!("  stderr:\n{}", indent(stderr));
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn reap(
    store: &dyn StateStore,
    queue: &dyn JobQueue,
    leases: &dyn LeaseRegistry,
    staging: &StagingArea,
    policy: &ReaperPolicy,
) -> Result<()> {
    println!("🧹 Sweeping for orphaned work...");
    let report = reaper::sweep(store, queue, leases, staging, policy, Utc::now()).await?;
    if report.is_empty() {
        println!("✅ Nothing to reclaim");
        return Ok(());
    }
    for id in &report.requeued_builds {
        println!("  🔨 requeued build for '{}'", id);
    }
    for id in &report.requeued_submissions {
        println!("  🔁 requeued stalled submission {}", id);
    }
    for id in &report.failed_submissions {
        println!("  ❌ failed orphaned submission {}", id);
    }
    Ok(())
}
