//! Shipwright daemon: schedules release heartbeats and idle shutdowns, then
//! drains the task queue, until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use shipwright_core::{ticket, Orchestrator, OrchestratorConfig, StoreTaskQueue};
use shipwright_state::{RecordStore, SurrealHandle, SurrealRecordStore};
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "shipwrightd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Shipwright queue worker daemon", long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Configuration file (TOML)
    #[arg(long, env = "SHIPWRIGHT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipwright_core::init_tracing(args.json, level);

    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    config.apply_env();

    let handle = SurrealHandle::setup_from_env()
        .await
        .context("Failed to connect to Shipwright database")?;
    let store: Arc<dyn RecordStore> = Arc::new(SurrealRecordStore::new(Arc::new(handle)));
    let queue = Arc::new(StoreTaskQueue::new(
        Arc::clone(&store),
        config.worker.max_attempts,
    ));
    let tickets = ticket::from_config(&config.ticket);
    let orch = Orchestrator::new(shipwright_core::Context::new(store, queue, tickets, config));

    info!("shipwrightd started");
    serve(&orch).await;
    info!("shipwrightd stopped");
    Ok(())
}

/// One pass: queue periodic jobs, then run everything due.
async fn pass(orch: &Orchestrator) -> shipwright_core::Result<()> {
    orch.schedule_periodic().await?;
    let report = orch.drain().await?;
    if report != Default::default() {
        info!(
            completed = report.completed,
            rescheduled = report.rescheduled,
            failed = report.failed,
            "queue drained"
        );
    }
    Ok(())
}

async fn serve(orch: &Orchestrator) {
    let interval = Duration::from_millis(orch.context().config.worker.poll_interval_ms);
    loop {
        if let Err(e) = pass(orch).await {
            error!(error = %e, "worker pass failed");
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_core::{RecordingTicketSystem, TaskQueue};
    use shipwright_state::fakes::MemoryRecordStore;
    use shipwright_state::{Release, ReleaseStore, RepoId};

    #[tokio::test]
    async fn pass_queues_heartbeats_and_drains_them() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let mut release = Release::new("shop-prod", "shop", RepoId::new(), "main", "main_candidate");
        release.active = false;
        store.save_release(&release).await.unwrap();
        let queue = Arc::new(StoreTaskQueue::new(Arc::clone(&store), 2));
        let orch = Orchestrator::new(shipwright_core::Context::new(
            store,
            queue.clone(),
            Arc::new(RecordingTicketSystem::new()),
            OrchestratorConfig::default(),
        ));

        pass(&orch).await.unwrap();
        // inactive releases get no heartbeat
        assert!(queue.jobs().await.unwrap().is_empty());
    }

    #[test]
    fn shipwrightd_args_parse() {
        let args = Args::parse_from(["shipwrightd", "--json", "-v"]);
        assert!(args.json && args.verbose);
    }
}
