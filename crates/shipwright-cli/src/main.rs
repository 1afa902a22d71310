//! Shipwright CLI
//!
//! The `shipwright` command queues work for the orchestrator and runs it.
//!
//! ## Commands
//!
//! - `trigger-fetch`: update a repository mirror and its branches
//! - `trigger-build`: rebuild a branch instance
//! - `trigger-test`: test a branch head or a given commit
//! - `trigger-release`: run a release heartbeat
//! - `worker`: schedule periodic jobs and drain the queue
//! - `status`: show a branch and its latest commit
//!
//! Every command prints `ok` on success. Failures print one JSON object
//! (`{"status": "error", ...}`) and exit non-zero.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use shipwright_core::{
    ticket, DrainReport, EnqueueOutcome, MemoryTaskQueue, Orchestrator, OrchestratorConfig,
    ShipwrightError, StoreTaskQueue,
};
use shipwright_state::{
    Branch, BranchStore, CommitStore, MachineStore, RecordStore, ReleaseStore, Repository,
    SurrealHandle, SurrealRecordStore,
};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Shipwright build/test/release orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a repository: new branches, new commits, test runs for new heads
    TriggerFetch {
        /// Repository name
        repo: String,
    },

    /// Check out and rebuild the instance of a branch
    TriggerBuild {
        /// Repository the branch belongs to
        #[arg(short, long)]
        repo: String,

        /// Branch name
        branch: String,
    },

    /// Run the enabled test categories for a branch
    TriggerTest {
        /// Repository the branch belongs to
        #[arg(short, long)]
        repo: String,

        /// Branch name
        branch: String,

        /// Commit to test (default: branch head)
        #[arg(long)]
        commit: Option<String>,
    },

    /// Run a release heartbeat: schedule, collect, recreate, release when due
    TriggerRelease {
        /// Release name
        release: String,
    },

    /// Schedule periodic jobs and drain the queue
    Worker {
        /// Drain once and exit instead of looping
        #[arg(long)]
        once: bool,

        /// Pause between loops in milliseconds (default: worker.poll_interval_ms)
        #[arg(long, env = "SHIPWRIGHT_POLL_INTERVAL_MS")]
        interval_ms: Option<u64>,
    },

    /// Show the state of a branch
    Status {
        /// Repository the branch belongs to
        #[arg(short, long)]
        repo: String,

        /// Branch name
        branch: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipwright_core::init_tracing(cli.json, level);

    if let Err(e) = run(cli.command).await {
        println!("{}", error_json(&e));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: Commands) -> Result<()> {
    let orch = connect().await?;
    match command {
        Commands::TriggerFetch { repo } => cmd_trigger_fetch(&orch, &repo).await,
        Commands::TriggerBuild { repo, branch } => cmd_trigger_build(&orch, &repo, &branch).await,
        Commands::TriggerTest {
            repo,
            branch,
            commit,
        } => cmd_trigger_test(&orch, &repo, &branch, commit).await,
        Commands::TriggerRelease { release } => cmd_trigger_release(&orch, &release).await,
        Commands::Worker { once, interval_ms } => cmd_worker(&orch, once, interval_ms).await,
        Commands::Status { repo, branch } => cmd_status(&orch, &repo, &branch).await,
    }
}

/// Store from the environment, the queue it holds, ticket system from config.
async fn connect() -> Result<Orchestrator> {
    let config =
        OrchestratorConfig::from_env().context("Failed to load Shipwright configuration")?;
    let handle = SurrealHandle::setup_from_env()
        .await
        .context("Failed to connect to Shipwright database")?;
    let store: Arc<dyn RecordStore> = Arc::new(SurrealRecordStore::new(Arc::new(handle)));
    let queue = Arc::new(StoreTaskQueue::new(
        Arc::clone(&store),
        config.worker.max_attempts,
    ));
    let tickets = ticket::from_config(&config.ticket);
    Ok(Orchestrator::new(shipwright_core::Context::new(
        store, queue, tickets, config,
    )))
}

/// Structured error body printed on failure.
fn error_json(e: &anyhow::Error) -> serde_json::Value {
    let transient = e
        .downcast_ref::<ShipwrightError>()
        .map(ShipwrightError::is_transient)
        .unwrap_or(false);
    json!({
        "status": "error",
        "error": format!("{e:#}"),
        "transient": transient,
    })
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

async fn find_repo(orch: &Orchestrator, name: &str) -> Result<Repository> {
    orch.context()
        .store
        .find_repository(name)
        .await?
        .with_context(|| format!("Repository not found: {name}"))
}

async fn find_branch(orch: &Orchestrator, repo: &str, name: &str) -> Result<Branch> {
    let repo = find_repo(orch, repo).await?;
    orch.context()
        .store
        .find_branch(&repo.id, name)
        .await?
        .with_context(|| format!("Branch not found: {name} in {}", repo.name))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Drain the queue after a trigger; a failed job fails the command.
async fn finish(orch: &Orchestrator, queued: EnqueueOutcome) -> Result<DrainReport> {
    if let EnqueueOutcome::Deduplicated(id) = &queued {
        info!(job = %id, "identical job already pending");
    }
    let report = orch.drain().await?;
    info!(
        completed = report.completed,
        rescheduled = report.rescheduled,
        failed = report.failed,
        "queue drained"
    );
    if report.failed > 0 {
        bail!("{} job(s) failed", report.failed);
    }
    println!("ok");
    Ok(report)
}

async fn cmd_trigger_fetch(orch: &Orchestrator, repo: &str) -> Result<()> {
    let repo = find_repo(orch, repo).await?;
    let queued = orch.trigger_fetch(&repo.id).await?;
    finish(orch, queued).await?;
    Ok(())
}

async fn cmd_trigger_build(orch: &Orchestrator, repo: &str, branch: &str) -> Result<()> {
    let branch = find_branch(orch, repo, branch).await?;
    let queued = orch.trigger_build(&branch.id).await?;
    finish(orch, queued).await?;
    Ok(())
}

async fn cmd_trigger_test(
    orch: &Orchestrator,
    repo: &str,
    branch: &str,
    commit: Option<String>,
) -> Result<()> {
    let branch = find_branch(orch, repo, branch).await?;
    if commit.is_none() && branch.latest_commit.is_none() {
        bail!("Branch {} has no commit to test", branch.name);
    }
    let queued = orch.trigger_test(&branch.id, commit).await?;
    finish(orch, queued).await?;
    Ok(())
}

async fn cmd_trigger_release(orch: &Orchestrator, release: &str) -> Result<()> {
    let release = orch
        .context()
        .store
        .find_release(release)
        .await?
        .with_context(|| format!("Release not found: {release}"))?;
    let queued = orch.trigger_release(&release.id).await?;
    finish(orch, queued).await?;
    Ok(())
}

async fn cmd_worker(orch: &Orchestrator, once: bool, interval_ms: Option<u64>) -> Result<()> {
    let interval = Duration::from_millis(
        interval_ms.unwrap_or(orch.context().config.worker.poll_interval_ms),
    );
    loop {
        orch.schedule_periodic().await?;
        let report = orch.drain().await?;
        info!(
            completed = report.completed,
            rescheduled = report.rescheduled,
            failed = report.failed,
            "worker pass done"
        );
        if once {
            println!("ok");
            return Ok(());
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping worker");
                println!("ok");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn cmd_status(orch: &Orchestrator, repo: &str, branch: &str) -> Result<()> {
    let branch = find_branch(orch, repo, branch).await?;
    println!("branch:  {}", branch.name);
    println!("state:   {}", branch.state);
    println!("active:  {}", branch.active);
    if let Some(sha) = &branch.latest_commit {
        match orch.context().store.get_commit(sha).await? {
            Some(commit) => {
                let subject = commit.message.lines().next().unwrap_or("");
                println!("commit:  {} {subject}", commit.short());
                println!(
                    "flags:   approval={:?} review={:?} test={:?} forced={}",
                    commit.approval_state,
                    commit.code_review_state,
                    commit.test_state,
                    commit.force_approved
                );
            }
            None => println!("commit:  {sha} (not recorded)"),
        }
    }
    println!("ok");
    Ok(())
}
