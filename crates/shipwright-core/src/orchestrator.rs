//! Job dispatch.
//!
//! Entry points only queue work. [`Orchestrator::run_job`] executes one job
//! and maps its error onto the queue: `Retryable` reschedules and counts an
//! attempt, `Wait` reschedules without counting, everything else fails the job
//! after recording the error on the owning entity.

use chrono::Utc;
use shipwright_state::{BranchId, ItemState, ReleaseId, ReleaseItemId, RepoId};
use tracing::{error, info, instrument, warn};

use crate::branch_state::BranchStateMachine;
use crate::build::BranchBuilder;
use crate::context::Context;
use crate::error::Result;
use crate::fetch::BranchFetcher;
use crate::queue::{EnqueueOutcome, Job, JobPayload};
use crate::release::ReleaseAssembler;
use crate::testrun::TestRunEngine;

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Rescheduled { delay_secs: u64 },
    Failed { error: String },
}

/// Counts of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    ctx: Context,
    fetcher: BranchFetcher,
    builder: BranchBuilder,
    states: BranchStateMachine,
    releases: ReleaseAssembler,
    tests: TestRunEngine,
}

impl Orchestrator {
    pub fn new(ctx: Context) -> Self {
        Self {
            fetcher: BranchFetcher::new(ctx.clone()),
            builder: BranchBuilder::new(ctx.clone()),
            states: BranchStateMachine::new(ctx.clone()),
            releases: ReleaseAssembler::new(ctx.clone()),
            tests: TestRunEngine::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn states(&self) -> &BranchStateMachine {
        &self.states
    }

    pub fn releases(&self) -> &ReleaseAssembler {
        &self.releases
    }

    pub fn tests(&self) -> &TestRunEngine {
        &self.tests
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    pub async fn trigger_fetch(&self, repo: &RepoId) -> Result<EnqueueOutcome> {
        self.enqueue(JobPayload::FetchRepository {
            repo_id: repo.clone(),
        })
        .await
    }

    pub async fn trigger_build(&self, branch: &BranchId) -> Result<EnqueueOutcome> {
        self.enqueue(JobPayload::BuildBranch {
            branch_id: branch.clone(),
        })
        .await
    }

    pub async fn trigger_test(
        &self,
        branch: &BranchId,
        commit: Option<String>,
    ) -> Result<EnqueueOutcome> {
        self.enqueue(JobPayload::RunTests {
            branch_id: branch.clone(),
            commit,
        })
        .await
    }

    pub async fn trigger_release(&self, release: &ReleaseId) -> Result<EnqueueOutcome> {
        self.enqueue(JobPayload::ReleaseHeartbeat {
            release_id: release.clone(),
        })
        .await
    }

    /// Heartbeats for every active release and idle shutdown per repository.
    pub async fn schedule_periodic(&self) -> Result<()> {
        for release in self.ctx.store.list_releases().await? {
            if release.active {
                self.trigger_release(&release.id).await?;
            }
        }
        for repo in self.ctx.store.list_repositories().await? {
            if repo.active {
                self.enqueue(JobPayload::ShutdownIdle {
                    repo_id: repo.id.clone(),
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn enqueue(&self, payload: JobPayload) -> Result<EnqueueOutcome> {
        self.ctx.queue.enqueue(payload, None).await
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    async fn dispatch(&self, payload: &JobPayload) -> Result<()> {
        match payload {
            JobPayload::FetchRepository { repo_id } => {
                self.fetcher.fetch_repository(repo_id).await?;
            }
            JobPayload::BuildBranch { branch_id } => self.builder.build_branch(branch_id).await?,
            JobPayload::RunTests { branch_id, commit } => {
                self.tests.run_tests(branch_id, commit.as_deref()).await?;
            }
            JobPayload::CollectBranches { item_id, .. } => {
                self.releases.collect_tested_branches(item_id).await?;
            }
            JobPayload::RecreateCandidate { item_id, .. } => {
                self.releases.recreate_candidate(item_id).await?;
            }
            JobPayload::DoRelease { item_id, .. } => {
                let outcome = self.releases.do_release(item_id).await?;
                info!(item = %item_id, outcome = ?outcome, "release attempt finished");
            }
            JobPayload::ReleaseHeartbeat { release_id } => {
                self.releases.heartbeat(release_id, Utc::now()).await?;
            }
            JobPayload::ShutdownIdle { repo_id } => {
                self.builder.shutdown_idle(repo_id).await?;
            }
            JobPayload::NotifyState { branch_id, state } => {
                let branch = self.ctx.store.get_branch(branch_id).await?;
                self.ctx.tickets.notify_state(&branch, *state).await;
            }
        }
        Ok(())
    }

    /// Run one claimed job and settle it with the queue.
    #[instrument(skip(self, job), fields(job = %job.id, key = %job.identity_key))]
    pub async fn run_job(&self, job: &Job) -> Result<JobOutcome> {
        let queue = &self.ctx.queue;
        match self.dispatch(&job.payload).await {
            Ok(()) => {
                queue.complete(&job.id).await?;
                Ok(JobOutcome::Completed)
            }
            Err(e) if e.is_transient() => {
                let delay = e.retry_delay().unwrap_or_default();
                let counts = !e.ignores_retry_budget();
                info!(error = %e, delay_secs = delay.as_secs(), counts, "rescheduling job");
                if queue.retry(&job.id, delay, counts).await? {
                    Ok(JobOutcome::Rescheduled {
                        delay_secs: delay.as_secs(),
                    })
                } else {
                    let error = format!("retry budget exhausted: {e}");
                    self.record_failure(&job.payload, &error).await;
                    Ok(JobOutcome::Failed { error })
                }
            }
            Err(e) => {
                let error = e.to_string();
                error!(error = %error, "job failed");
                self.record_failure(&job.payload, &error).await;
                queue.fail(&job.id, error.clone()).await?;
                Ok(JobOutcome::Failed { error })
            }
        }
    }

    /// Leave the failure on the entity that owns the job. Best effort.
    async fn record_failure(&self, payload: &JobPayload, error: &str) {
        let result = match payload {
            JobPayload::RecreateCandidate { item_id, .. }
            | JobPayload::CollectBranches { item_id, .. }
            | JobPayload::DoRelease { item_id, .. } => self.fail_item(item_id, error).await,
            JobPayload::BuildBranch { branch_id } => {
                self.comment(branch_id, &format!("Build failed: {error}")).await
            }
            JobPayload::RunTests { branch_id, .. } => {
                self.comment(branch_id, &format!("Test run failed: {error}"))
                    .await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "could not record job failure");
        }
    }

    async fn fail_item(&self, item_id: &ReleaseItemId, error: &str) -> Result<()> {
        let mut item = self.ctx.store.get_item(item_id).await?;
        if item.state != ItemState::New {
            return Ok(());
        }
        item.state = ItemState::Failed;
        let mut log = item.log_release.take().unwrap_or_default();
        if !log.is_empty() {
            log.push('\n');
        }
        log.push_str(error);
        item.log_release = Some(log);
        self.ctx.store.save_item(&item).await?;
        self.states.recompute_many(item.branch_ids.iter()).await
    }

    async fn comment(&self, branch_id: &BranchId, text: &str) -> Result<()> {
        let branch = self.ctx.store.get_branch(branch_id).await?;
        self.ctx.tickets.comment(&branch, text).await;
        Ok(())
    }

    /// Claim and run one batch of due jobs.
    pub async fn tick(&self) -> Result<DrainReport> {
        let jobs = self
            .ctx
            .queue
            .take_due(Utc::now(), self.ctx.config.worker.max_jobs_per_tick)
            .await?;
        let mut report = DrainReport::default();
        for job in &jobs {
            match self.run_job(job).await? {
                JobOutcome::Completed => report.completed += 1,
                JobOutcome::Rescheduled { .. } => report.rescheduled += 1,
                JobOutcome::Failed { .. } => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Tick until nothing is due. Rescheduled jobs wait for a later drain.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let report = self.tick().await?;
            if report == DrainReport::default() {
                return Ok(total);
            }
            total.completed += report.completed;
            total.rescheduled += report.rescheduled;
            total.failed += report.failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shipwright_state::fakes::MemoryRecordStore;
    use shipwright_state::{Branch, BranchState, BranchStore, RepoId};

    use crate::config::OrchestratorConfig;
    use crate::queue::{JobStatus, MemoryTaskQueue, TaskQueue};
    use crate::ticket::{RecordingTicketSystem, TicketRecord};

    fn orchestrator() -> (Orchestrator, Arc<MemoryTaskQueue>, Arc<RecordingTicketSystem>) {
        let store = Arc::new(MemoryRecordStore::new());
        let queue = Arc::new(MemoryTaskQueue::new(2));
        let tickets = Arc::new(RecordingTicketSystem::new());
        let ctx = Context::new(
            store,
            queue.clone(),
            tickets.clone(),
            OrchestratorConfig::default(),
        );
        (Orchestrator::new(ctx), queue, tickets)
    }

    #[tokio::test]
    async fn repeated_triggers_collapse() {
        let (orch, queue, _) = orchestrator();
        let repo = RepoId::from("r1");
        let first = orch.trigger_fetch(&repo).await.unwrap();
        let second = orch.trigger_fetch(&repo).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Queued(_)));
        assert_eq!(second, EnqueueOutcome::Deduplicated(first.job_id().clone()));
        assert_eq!(queue.jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notify_job_reaches_ticket_system() {
        let (orch, _, tickets) = orchestrator();
        let branch = Branch::new(RepoId::from("r1"), "feature-x");
        orch.context().store.save_branch(&branch).await.unwrap();
        orch.context()
            .queue
            .enqueue(
                JobPayload::NotifyState {
                    branch_id: branch.id.clone(),
                    state: BranchState::Tested,
                },
                None,
            )
            .await
            .unwrap();

        let report = orch.drain().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(
            tickets.records(),
            vec![TicketRecord::State("feature-x".into(), BranchState::Tested)]
        );
    }

    #[tokio::test]
    async fn fatal_error_fails_job_and_comments() {
        let (orch, queue, tickets) = orchestrator();
        let mut branch = Branch::new(RepoId::from("r1"), "gone");
        branch.active = false;
        orch.context().store.save_branch(&branch).await.unwrap();
        orch.trigger_build(&branch.id).await.unwrap();

        let report = orch.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        let jobs = queue.jobs().await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].last_error.as_deref().unwrap().contains("not active"));
        assert!(matches!(
            &tickets.records()[0],
            TicketRecord::Comment(branch, text) if branch == "gone" && text.starts_with("Build failed")
        ));
    }

    #[tokio::test]
    async fn lock_wait_reschedules_without_counting() {
        let (orch, queue, _) = orchestrator();
        let mut branch = Branch::new(RepoId::from("r1"), "busy");
        branch.run_unittests = true;
        branch.latest_commit = Some("abc".into());
        orch.context().store.save_branch(&branch).await.unwrap();

        let _held = orch
            .context()
            .locks
            .try_acquire(format!("testrun_{}", branch.id))
            .await
            .unwrap();
        orch.trigger_test(&branch.id, None).await.unwrap();
        let report = orch.tick().await.unwrap();

        assert_eq!(report.rescheduled, 1);
        let job = &queue.jobs().await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }
}
