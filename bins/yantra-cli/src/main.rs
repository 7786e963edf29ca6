mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::CompilerArgs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;
use yantra_common::config::Config;
use yantra_common::reaper::ReaperPolicy;
use yantra_common::redis::{self, RedisLeases, RedisQueue, RedisStore};
use yantra_common::staging::StagingArea;
use yantra_common::store::StateStore;

#[derive(Parser)]
#[command(name = "yantra-cli")]
#[command(about = "Yantra CLI - Manage compilers, submit code, inspect state", long_about = None)]
struct Cli {
    /// Print records as JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a compiler and queue its first build
    AddCompiler {
        /// Compiler id, also used as the submission language (e.g. python-3.11)
        #[arg(short, long)]
        id: String,

        /// Display name (defaults to the id)
        #[arg(short, long)]
        name: Option<String>,

        /// Path to the Dockerfile
        #[arg(short, long)]
        dockerfile: PathBuf,

        /// Entrypoint argv; the code arrives on stdin (e.g. --run python3 -)
        #[arg(short, long, num_args = 1.., required = true, allow_hyphen_values = true)]
        run: Vec<String>,

        #[arg(long)]
        version: Option<String>,

        /// Memory limit (e.g. 256m, 1g)
        #[arg(short, long, default_value = "512m")]
        memory: String,

        /// CPU limit in cores
        #[arg(long, default_value = "1")]
        cpu: String,

        /// Wall-clock limit per execution, seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Register without accepting submissions
        #[arg(long, default_value = "false")]
        disabled: bool,
    },

    /// Reset a compiler to pending and queue a build
    Rebuild {
        #[arg(short, long)]
        id: String,

        /// Replace the Dockerfile
        #[arg(short, long)]
        dockerfile: Option<PathBuf>,

        /// Replace the run command
        #[arg(short, long, num_args = 1.., allow_hyphen_values = true)]
        run: Option<Vec<String>>,
    },

    /// Delete a compiler and queue removal of its image
    Delete {
        #[arg(short, long)]
        id: String,
    },

    /// Accept submissions for a compiler again
    Enable {
        #[arg(short, long)]
        id: String,
    },

    /// Stop accepting submissions for a compiler
    Disable {
        #[arg(short, long)]
        id: String,
    },

    /// Submit code for execution
    Submit {
        /// Compiler id
        #[arg(short, long)]
        language: String,

        /// Source file, or - for stdin
        #[arg(short, long)]
        code: PathBuf,

        /// File to make available under /sandbox/files (repeatable)
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// Wait for a terminal status and print the result
        #[arg(short, long, default_value = "false")]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "120")]
        wait_timeout: u64,
    },

    /// Show a compiler or submission
    Status {
        #[command(subcommand)]
        target: StatusTarget,
    },

    /// List compilers
    List,

    /// Run one reaper sweep for orphaned builds and executions
    Reap {
        /// Build ceiling the workers run with, seconds
        #[arg(long, default_value = "600")]
        build_timeout: u64,

        /// Extra slack before a record counts as orphaned, seconds
        #[arg(long, default_value = "60")]
        grace: u64,

        #[arg(long, default_value = "65536")]
        log_limit: usize,
    },
}

#[derive(Subcommand)]
enum StatusTarget {
    Compiler {
        #[arg(short, long)]
        id: String,

        /// Include build logs
        #[arg(long, default_value = "false")]
        logs: bool,
    },
    Submission {
        #[arg(short, long)]
        id: Uuid,
    },
}

fn read_code(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        return Ok(code);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let conn = redis::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    let store = RedisStore::new(conn.clone());
    let queue = RedisQueue::new(conn.clone());
    let leases = RedisLeases::new(conn);
    let staging = StagingArea::new(&config.staging_root);

    match cli.command {
        Commands::AddCompiler {
            id,
            name,
            dockerfile,
            run,
            version,
            memory,
            cpu,
            timeout,
            disabled,
        } => {
            let args = CompilerArgs {
                id,
                name,
                dockerfile,
                run_command: run,
                version,
                memory,
                cpu,
                timeout_seconds: timeout,
                disabled,
            };
            commands::add_compiler(&store, &queue, args).await?;
        }
        Commands::Rebuild { id, dockerfile, run } => {
            commands::rebuild(&store, &queue, &leases, &id, dockerfile.as_deref(), run).await?;
        }
        Commands::Delete { id } => {
            commands::delete(&store, &queue, &leases, &id).await?;
        }
        Commands::Enable { id } => {
            commands::set_enabled(&store, &leases, &id, true).await?;
        }
        Commands::Disable { id } => {
            commands::set_enabled(&store, &leases, &id, false).await?;
        }
        Commands::Submit {
            language,
            code,
            files,
            wait,
            wait_timeout,
        } => {
            let code = read_code(&code)?;
            let id = commands::submit(&store, &queue, &staging, &language, code, &files).await?;
            if wait {
                let done = commands::wait_for(
                    &store,
                    &id,
                    Duration::from_millis(500),
                    Duration::from_secs(wait_timeout),
                )
                .await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&done)?);
                } else {
                    commands::print_submission(&done);
                }
            }
        }
        Commands::Status { target } => match target {
            StatusTarget::Compiler { id, logs } => {
                let compiler = store
                    .get_compiler(&id)
                    .await?
                    .with_context(|| format!("compiler '{}' not found", id))?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&compiler)?);
                } else {
                    commands::print_compiler(&compiler, logs);
                }
            }
            StatusTarget::Submission { id } => {
                let submission = store
                    .get_submission(&id)
                    .await?
                    .with_context(|| format!("submission {} not found", id))?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&submission)?);
                } else {
                    commands::print_submission(&submission);
                }
            }
        },
        Commands::List => {
            let mut compilers = store.list_compilers().await?;
            compilers.sort_by(|a, b| a.id.cmp(&b.id));
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&compilers)?);
            } else {
                commands::print_compiler_table(&compilers);
            }
        }
        Commands::Reap {
            build_timeout,
            grace,
            log_limit,
        } => {
            let policy = ReaperPolicy {
                build_timeout_secs: build_timeout,
                grace_secs: grace,
                build_log_limit: log_limit,
            };
            commands::reap(&store, &queue, &leases, &staging, &policy).await?;
        }
    }

    Ok(())
}
