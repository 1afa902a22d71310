//! Task queue contract, an in-process queue and one shared through the
//! record store.
//!
//! Every long operation is a [`Job`] with an identity key. The queue keeps at
//! most one pending or running job per key, so repeated triggers collapse.
//! Completed jobs are dropped; a bounded history of failed jobs is kept for
//! inspection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_state::{
    BranchId, BranchState, JobStore, QueuedJob, RecordStore, ReleaseId, ReleaseItemId, RepoId,
};
use tracing::{debug, info, warn};

use crate::error::{Result, ShipwrightError};

pub use shipwright_state::JobStatus;

/// Failed jobs kept by [`MemoryTaskQueue`] before the oldest are dropped.
pub const FAILED_HISTORY: usize = 64;

/// Unique identifier of a queued job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit of work dispatched by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    FetchRepository {
        repo_id: RepoId,
    },
    BuildBranch {
        branch_id: BranchId,
    },
    /// Test `commit`, or the branch head when absent
    RunTests {
        branch_id: BranchId,
        commit: Option<String>,
    },
    CollectBranches {
        release_id: ReleaseId,
        item_id: ReleaseItemId,
    },
    RecreateCandidate {
        release_id: ReleaseId,
        item_id: ReleaseItemId,
    },
    DoRelease {
        release_id: ReleaseId,
        item_id: ReleaseItemId,
    },
    ReleaseHeartbeat {
        release_id: ReleaseId,
    },
    ShutdownIdle {
        repo_id: RepoId,
    },
    NotifyState {
        branch_id: BranchId,
        state: BranchState,
    },
}

impl JobPayload {
    /// Deduplication key; two payloads with the same key are the same work.
    pub fn identity_key(&self) -> String {
        match self {
            JobPayload::FetchRepository { repo_id } => format!("fetch {repo_id}"),
            JobPayload::BuildBranch { branch_id } => format!("build {branch_id}"),
            JobPayload::RunTests { branch_id, commit } => {
                format!("test {branch_id} {}", commit.as_deref().unwrap_or("head"))
            }
            JobPayload::CollectBranches { release_id, .. } => format!("collect {release_id}"),
            JobPayload::RecreateCandidate { release_id, .. } => {
                format!("recreate_candidate {release_id}")
            }
            JobPayload::DoRelease { release_id, .. } => format!("release {release_id}"),
            JobPayload::ReleaseHeartbeat { release_id } => format!("release-heartbeat {release_id}"),
            JobPayload::ShutdownIdle { repo_id } => format!("shutdown-idle {repo_id}"),
            JobPayload::NotifyState { branch_id, state } => format!("notify {branch_id} {state}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub identity_key: String,
    pub run_at: DateTime<Utc>,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl Job {
    fn new(payload: JobPayload, run_at: Option<DateTime<Utc>>, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            identity_key: payload.identity_key(),
            run_at: run_at.unwrap_or_else(Utc::now),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
        }
    }

    fn mark_failed(&mut self, error: String) {
        warn!(job = %self.id, identity_key = %self.identity_key, error = %error, "job failed");
        self.status = JobStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error);
    }

    /// Returns `false` when the budget ran out and the job failed instead.
    fn reschedule(&mut self, delay: Duration, counts_as_attempt: bool) -> bool {
        if counts_as_attempt {
            self.attempts += 1;
            if self.attempts >= self.max_attempts {
                self.status = JobStatus::Failed;
                self.last_error = Some("retry budget exhausted".to_string());
                return false;
            }
        }
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.run_at = Utc::now() + delay;
        self.status = JobStatus::Pending;
        true
    }

    fn to_record(&self) -> Result<QueuedJob> {
        Ok(QueuedJob {
            id: self.id.0.clone(),
            identity_key: self.identity_key.clone(),
            run_at: self.run_at,
            status: self.status,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            payload: serde_json::to_value(&self.payload)?,
        })
    }

    fn from_record(record: QueuedJob) -> Result<Self> {
        Ok(Self {
            id: JobId(record.id),
            identity_key: record.identity_key,
            run_at: record.run_at,
            payload: serde_json::from_value(record.payload)?,
            status: record.status,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            last_error: record.last_error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(JobId),
    /// A live job with the same identity key already exists
    Deduplicated(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Deduplicated(id) => id,
        }
    }
}

/// Queue collaborator used by the orchestrator.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue `payload` to run at `run_at` (now when absent).
    async fn enqueue(
        &self,
        payload: JobPayload,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome>;

    /// Claim up to `limit` due jobs, marking them running.
    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Finished; the job is dropped from the queue.
    async fn complete(&self, id: &JobId) -> Result<()>;

    async fn fail(&self, id: &JobId, error: String) -> Result<()>;

    /// Reschedule after `delay`. Returns `false` when the retry budget is
    /// exhausted and the job was marked failed instead.
    async fn retry(&self, id: &JobId, delay: Duration, counts_as_attempt: bool) -> Result<bool>;

    /// Live jobs and the retained failures, for inspection.
    async fn jobs(&self) -> Result<Vec<Job>>;
}

fn unknown_job(id: &JobId) -> ShipwrightError {
    ShipwrightError::Validation(format!("unknown job {id}"))
}

// ---------------------------------------------------------------------------
// In-process queue
// ---------------------------------------------------------------------------

/// In-process queue backed by a `Vec<Job>`.
#[derive(Debug)]
pub struct MemoryTaskQueue {
    jobs: Mutex<Vec<Job>>,
    max_attempts: u32,
}

impl MemoryTaskQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            max_attempts,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Job>>> {
        self.jobs
            .lock()
            .map_err(|_| ShipwrightError::Invariant("job table poisoned".into()))
    }

    fn with_job<T>(&self, id: &JobId, f: impl FnOnce(&mut Job) -> T) -> Result<T> {
        let mut jobs = self.lock()?;
        let job = jobs
            .iter_mut()
            .find(|j| &j.id == id)
            .ok_or_else(|| unknown_job(id))?;
        let out = f(job);
        prune_failed(&mut jobs);
        Ok(out)
    }
}

/// Drop the oldest failed jobs beyond [`FAILED_HISTORY`].
fn prune_failed(jobs: &mut Vec<Job>) {
    let mut excess = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Failed)
        .count()
        .saturating_sub(FAILED_HISTORY);
    if excess == 0 {
        return;
    }
    debug!(dropped = excess, "pruning failed jobs");
    jobs.retain(|j| {
        if excess > 0 && j.status == JobStatus::Failed {
            excess -= 1;
            return false;
        }
        true
    });
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(
        &self,
        payload: JobPayload,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome> {
        let identity_key = payload.identity_key();
        let mut jobs = self.lock()?;
        if let Some(existing) = jobs
            .iter()
            .find(|j| j.status.is_live() && j.identity_key == identity_key)
        {
            debug!(identity_key = %identity_key, job = %existing.id, "job deduplicated");
            return Ok(EnqueueOutcome::Deduplicated(existing.id.clone()));
        }
        // a new attempt supersedes an old failure of the same work
        jobs.retain(|j| j.identity_key != identity_key);
        let job = Job::new(payload, run_at, self.max_attempts);
        info!(identity_key = %identity_key, job = %job.id, "job queued");
        let id = job.id.clone();
        jobs.push(job);
        Ok(EnqueueOutcome::Queued(id))
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self.lock()?;
        let mut due: Vec<&mut Job> = jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now)
            .collect();
        due.sort_by_key(|j| j.run_at);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|j| {
                j.status = JobStatus::Running;
                j.clone()
            })
            .collect())
    }

    async fn complete(&self, id: &JobId) -> Result<()> {
        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|j| &j.id != id);
        if jobs.len() == before {
            return Err(unknown_job(id));
        }
        debug!(job = %id, "job done");
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: String) -> Result<()> {
        self.with_job(id, |j| j.mark_failed(error))
    }

    async fn retry(&self, id: &JobId, delay: Duration, counts_as_attempt: bool) -> Result<bool> {
        self.with_job(id, |j| j.reschedule(delay, counts_as_attempt))
    }

    async fn jobs(&self) -> Result<Vec<Job>> {
        Ok(self.lock()?.clone())
    }
}

// ---------------------------------------------------------------------------
// Shared queue
// ---------------------------------------------------------------------------

/// Queue kept in the record store, shared by every process on that store.
///
/// Each identity key has at most one row. Claims and state changes are
/// compare-and-set on the stored status, so two workers never both take a job.
pub struct StoreTaskQueue {
    store: Arc<dyn RecordStore>,
    max_attempts: u32,
}

impl StoreTaskQueue {
    pub fn new(store: Arc<dyn RecordStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    async fn load(&self, id: &JobId) -> Result<Job> {
        let record = self
            .store
            .get_job(&id.0)
            .await?
            .ok_or_else(|| unknown_job(id))?;
        Job::from_record(record)
    }

    async fn swap(&self, job: &Job, expected: JobStatus) -> Result<()> {
        if self.store.update_job(&job.to_record()?, expected).await? {
            Ok(())
        } else {
            Err(ShipwrightError::Invariant(format!(
                "job {} changed while updating it",
                job.id
            )))
        }
    }
}

impl std::fmt::Debug for StoreTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTaskQueue")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskQueue for StoreTaskQueue {
    async fn enqueue(
        &self,
        payload: JobPayload,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome> {
        let job = Job::new(payload, run_at, self.max_attempts);
        let live = self.store.insert_job(&job.to_record()?).await?;
        if live.id == job.id.0 {
            info!(identity_key = %job.identity_key, job = %job.id, "job queued");
            Ok(EnqueueOutcome::Queued(job.id))
        } else {
            debug!(identity_key = %job.identity_key, job = %live.id, "job deduplicated");
            Ok(EnqueueOutcome::Deduplicated(JobId(live.id)))
        }
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut claimed = Vec::new();
        for record in self.store.due_jobs(now, limit).await? {
            let mut job = Job::from_record(record)?;
            job.status = JobStatus::Running;
            if self.store.update_job(&job.to_record()?, JobStatus::Pending).await? {
                claimed.push(job);
            } else {
                debug!(job = %job.id, "job claimed by another worker");
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: &JobId) -> Result<()> {
        self.store.delete_job(&id.0).await?;
        debug!(job = %id, "job done");
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: String) -> Result<()> {
        let mut job = self.load(id).await?;
        let expected = job.status;
        job.mark_failed(error);
        self.swap(&job, expected).await
    }

    async fn retry(&self, id: &JobId, delay: Duration, counts_as_attempt: bool) -> Result<bool> {
        let mut job = self.load(id).await?;
        let expected = job.status;
        let rescheduled = job.reschedule(delay, counts_as_attempt);
        self.swap(&job, expected).await?;
        Ok(rescheduled)
    }

    async fn jobs(&self) -> Result<Vec<Job>> {
        self.store
            .list_jobs()
            .await?
            .into_iter()
            .map(Job::from_record)
            .collect()
    }
}
