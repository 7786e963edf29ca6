/// Execution Engine - Abstraction over the container runtime
///
/// **Core Responsibility:**
/// Build images from Dockerfile text and run code in isolated containers,
/// returning raw results.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to build and run (Docker via bollard)
/// - Engine does NOT know compiler or submission state machines
/// - Engine does NOT classify outcomes (see evaluator.rs)
///
/// **Why This Exists:**
/// The build and execution managers depend only on `ImageBuilder` and
/// `ContainerRunner`, so tests drive them with in-process doubles.
use crate::error::EngineError;
use crate::evaluator::{CappedBuffer, Captured, RunExit};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for buffered output after the container has exited
const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminal result of an image build
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Succeeded,
    /// The Dockerfile itself failed (bad base image, failing RUN step...)
    Failed(String),
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `dockerfile` into `tag`, sending output lines to `logs` as they arrive
    async fn build(
        &self,
        dockerfile: &str,
        tag: &str,
        logs: UnboundedSender<String>,
    ) -> Result<BuildOutcome, EngineError>;

    /// Point `target` at the image currently tagged `source`
    async fn promote(&self, source: &str, target: &str) -> Result<(), EngineError>;

    /// Remove a tag. Removing a missing image succeeds.
    async fn remove(&self, tag: &str) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything needed to launch one isolated run
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image_tag: String,
    pub run_command: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub mounts: Vec<Mount>,
    /// Delivered on stdin, never written to the filesystem
    pub code: String,
    pub working_dir: String,
    pub scratch_size: Option<String>,
    pub pids_limit: i64,
    pub runtime: Option<String>,
    pub output_limit: usize,
}

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Create and start the container. Dropping the returned handle releases
    /// every runtime resource it holds.
    async fn start(&self, spec: &RunSpec) -> Result<Box<dyn RunningContainer>, EngineError>;
}

#[async_trait]
pub trait RunningContainer: Send {
    /// Wait for the container to exit on its own. Cancel-safe: output keeps
    /// accumulating so a later `kill` still sees it.
    async fn wait(&mut self) -> Result<RunExit, EngineError>;

    /// Forcibly terminate and return whatever output was captured
    async fn kill(&mut self) -> Captured;
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if execution panics or is cancelled
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Best-effort cleanup - cannot be async in Drop
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker
                .remove_container(&container_id, Some(remove_options))
                .await
            {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

#[derive(Debug)]
struct StreamCapture {
    stdout: CappedBuffer,
    stderr: CappedBuffer,
}

impl StreamCapture {
    fn snapshot(&self) -> Captured {
        Captured {
            stdout: self.stdout.to_text(),
            stderr: self.stderr.to_text(),
        }
    }
}

/// Docker-based engine for real sandboxed builds and runs
///
/// **Run isolation contract:**
/// 1. Network disabled
/// 2. Memory (no swap), CPU and PID limits from the compiler policy
/// 3. Read-only root filesystem; only a noexec tmpfs at /tmp is writable
/// 4. All capabilities dropped, no-new-privileges
/// 5. Staged files bind-mounted read-only
/// 6. Code piped over stdin
/// 7. Container force-removed when the handle is dropped
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::from_docker(e, "daemon"))
    }
}

/// Pack a single Dockerfile into an in-memory tar build context
pub fn build_context(dockerfile: &str) -> Result<Vec<u8>, EngineError> {
    let pack_error = |e: std::io::Error| EngineError::Runtime(format!("failed to pack build context: {}", e));

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);

    let mut archive = tar::Builder::new(Vec::new());
    archive
        .append_data(&mut header, "Dockerfile", dockerfile.as_bytes())
        .map_err(pack_error)?;
    archive.into_inner().map_err(pack_error)
}

/// Split `repo:tag` at the tag separator (a ':' after the last '/')
pub fn split_image_tag(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

#[async_trait]
impl ImageBuilder for DockerEngine {
    async fn build(
        &self,
        dockerfile: &str,
        tag: &str,
        logs: UnboundedSender<String>,
    ) -> Result<BuildOutcome, EngineError> {
        let context = build_context(dockerfile)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        let mut failure: Option<String> = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        let _ = logs.send(line);
                    } else if let Some(status) = info.status {
                        let _ = logs.send(format!("{}\n", status));
                    }
                    if let Some(error) = info.error {
                        let _ = logs.send(format!("{}\n", error));
                        failure = Some(error);
                    }
                }
                Err(bollard::errors::Error::DockerStreamError { error }) => {
                    let _ = logs.send(format!("{}\n", error));
                    failure = Some(error);
                    break;
                }
                Err(e) => return Err(EngineError::from_docker(e, tag)),
            }
        }

        Ok(match failure {
            Some(message) => BuildOutcome::Failed(message),
            None => BuildOutcome::Succeeded,
        })
    }

    async fn promote(&self, source: &str, target: &str) -> Result<(), EngineError> {
        let (repo, tag) = split_image_tag(target);
        self.docker
            .tag_image(source, Some(TagImageOptions { repo, tag }))
            .await
            .map_err(|e| EngineError::from_docker(e, source))?;
        info!(source = %source, target = %target, "Image promoted");
        Ok(())
    }

    async fn remove(&self, tag: &str) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(tag, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) => match EngineError::from_docker(e, tag) {
                EngineError::ImageMissing(_) => {
                    debug!(image_tag = %tag, "Image already absent");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl ContainerRunner for DockerEngine {
    async fn start(&self, spec: &RunSpec) -> Result<Box<dyn RunningContainer>, EngineError> {
        let container_name = format!("yantra-run-{}", uuid::Uuid::new_v4());

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.host_path.display(),
                    m.container_path,
                    if m.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        let tmpfs = spec.scratch_size.as_ref().map(|size| {
            HashMap::from([(
                "/tmp".to_string(),
                format!("rw,noexec,nosuid,size={}", size),
            )])
        });

        let config = Config {
            image: Some(spec.image_tag.clone()),
            entrypoint: Some(spec.run_command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            network_disabled: Some(true), // SECURITY: No network access
            host_config: Some(bollard::models::HostConfig {
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                pids_limit: Some(spec.pids_limit),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                binds: if binds.is_empty() { None } else { Some(binds) },
                tmpfs,
                runtime: spec.runtime.clone(),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| EngineError::from_docker(e, &spec.image_tag))?;

        let container_id = container.id.clone();

        // CRITICAL: Set up cleanup guard immediately after container creation
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await
            .map_err(|e| EngineError::from_docker(e, &container_id))?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::from_docker(e, &spec.image_tag))?;

        let capture = Arc::new(Mutex::new(StreamCapture {
            stdout: CappedBuffer::new(spec.output_limit),
            stderr: CappedBuffer::new(spec.output_limit),
        }));

        let sink = capture.clone();
        let collector_id = container_id.clone();
        let collector = tokio::spawn(async move {
            while let Some(item) = output.next().await {
                let mut streams = sink.lock().unwrap_or_else(|e| e.into_inner());
                match item {
                    Ok(LogOutput::StdOut { message }) => streams.stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => streams.stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container_id = %collector_id, error = %e, "Error reading container output");
                        break;
                    }
                }
            }
        });

        // Feed stdin from its own task: a program that never reads stdin must
        // not block us outside the execution deadline.
        let code = spec.code.clone();
        let stdin_id = container_id.clone();
        let stdin_writer = tokio::spawn(async move {
            if let Err(e) = input.write_all(code.as_bytes()).await {
                debug!(container_id = %stdin_id, error = %e, "stdin closed before code was fully written");
            }
            let _ = input.shutdown().await;
        });

        debug!(container_id = %container_id, image = %spec.image_tag, "Container started");

        Ok(Box::new(DockerContainer {
            docker: self.docker.clone(),
            container_id,
            capture,
            collector: Some(collector),
            stdin_writer,
            _guard: guard,
        }))
    }
}

struct DockerContainer {
    docker: Docker,
    container_id: String,
    capture: Arc<Mutex<StreamCapture>>,
    collector: Option<JoinHandle<()>>,
    stdin_writer: JoinHandle<()>,
    _guard: ContainerGuard,
}

impl DockerContainer {
    async fn drain_output(&mut self) {
        if let Some(mut collector) = self.collector.take() {
            if tokio::time::timeout(OUTPUT_FLUSH_TIMEOUT, &mut collector)
                .await
                .is_err()
            {
                collector.abort();
            }
        }
    }

    fn snapshot(&self) -> Captured {
        self.capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }
}

#[async_trait]
impl RunningContainer for DockerContainer {
    async fn wait(&mut self) -> Result<RunExit, EngineError> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self
            .docker
            .wait_container(&self.container_id, Some(wait_options));

        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(EngineError::from_docker(e, &self.container_id)),
            None => {
                return Err(EngineError::Runtime(format!(
                    "no wait response from container {}",
                    self.container_id
                )))
            }
        };

        self.drain_output().await;
        let captured = self.snapshot();
        debug!(container_id = %self.container_id, exit_code, "Container exited");

        Ok(RunExit {
            exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
        })
    }

    async fn kill(&mut self) -> Captured {
        if let Err(e) = self
            .docker
            .kill_container(&self.container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id = %self.container_id, error = %e, "Failed to kill container");
        }
        self.drain_output().await;
        self.snapshot()
    }
}

impl Drop for DockerContainer {
    fn drop(&mut self) {
        self.stdin_writer.abort();
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
    }
}
