//! benchd — benchmark task scheduler.
//!
//! Polls the waiting queue with a fixed pool of workers, builds and evaluates
//! each claimed candidate in its own sandbox, and publishes the score back to
//! the candidate folder.
//!
//! # Usage
//!
//! ```bash
//! # Run the scheduler (type `q` + Enter to force a shutdown, Ctrl-C to drain)
//! benchd --config config/benchd.toml
//!
//! # Queue a candidate
//! benchd submit outputs/s1/cand1 --phase classifier_definition
//!
//! # Check a candidate output folder
//! benchd verify outputs/s1/cand1
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::{info, warn};

use benchd_core::config::load_dotenv;
use benchd_core::{BenchConfig, BuildPhase};
use benchd_scheduler::{
    Controller, DedupRegistry, ShutdownKind, TaskQueue, VerificationCheck, WorkerPoolBuilder,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Benchmark task scheduler for generated candidates.
#[derive(Parser, Debug)]
#[command(name = "benchd", version, about)]
struct Cli {
    /// Path to benchd.toml config file.
    #[arg(long, env = "BENCHD_CONFIG", default_value = "config/benchd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool until shut down (default).
    Run,

    /// Write a task file for a candidate into the waiting queue.
    Submit {
        /// Candidate folder.
        candidate: PathBuf,

        /// Build phase: feature_extraction or classifier_definition.
        #[arg(long)]
        phase: BuildPhase,

        /// Task name (defaults to the candidate folder name).
        #[arg(long)]
        name: Option<String>,
    },

    /// Run the verification executable on a candidate output folder.
    Verify {
        folder: PathBuf,

        /// Verification executable (overrides the config).
        #[arg(long)]
        executable: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = Arc::new(load_config(&cli.config)?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Submit {
            candidate,
            phase,
            name,
        } => submit(config, &candidate, phase, name.as_deref()),
        Command::Verify { folder, executable } => verify(&config, &folder, executable).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<BenchConfig> {
    if path.exists() {
        return Ok(BenchConfig::from_file(path)?);
    }
    warn!(path = %path.display(), "config file not found, using defaults and environment");
    Ok(BenchConfig::from_env()?)
}

// ── Subcommands ─────────────────────────────────────────────────────

async fn run(config: Arc<BenchConfig>) -> anyhow::Result<()> {
    config.log_summary();
    let pool = WorkerPoolBuilder::new(config.clone()).start()?;
    info!(quit = %config.pool.quit_token, "benchd running, enter the quit token to force a shutdown");

    let console = BufReader::new(tokio::io::stdin());
    let report = Controller::new(pool, config)
        .supervise(console, shutdown_signal())
        .await;

    info!(
        completed = report.completed(),
        failed = report.failed(),
        "benchd exited"
    );
    // The console reader blocks on stdin; exiting is the only way to release it.
    let code = match report.kind {
        ShutdownKind::Forced if report.timed_out => 1,
        _ => 0,
    };
    std::process::exit(code);
}

fn submit(
    config: Arc<BenchConfig>,
    candidate: &Path,
    phase: BuildPhase,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let candidate = std::path::absolute(candidate)?;
    if !candidate.is_dir() {
        warn!(candidate = %candidate.display(), "candidate folder does not exist yet");
    }

    let queue = TaskQueue::new(config, Arc::new(DedupRegistry::new()));
    queue.ensure_dirs()?;
    let path = queue.submit(&candidate, phase, name)?;
    println!("{}", path.display());
    Ok(())
}

async fn verify(
    config: &BenchConfig,
    folder: &Path,
    executable: Option<PathBuf>,
) -> anyhow::Result<()> {
    let check = match executable {
        Some(exe) => VerificationCheck::new(exe),
        None => match VerificationCheck::from_config(config) {
            Some(check) => check,
            None => anyhow::bail!(
                "no verification executable configured (set [verification] executable or pass --executable)"
            ),
        },
    };

    let passed = check.check(folder).await;
    println!("{}", if passed { "pass" } else { "fail" });
    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

// ── Signal handling ─────────────────────────────────────────────────

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
