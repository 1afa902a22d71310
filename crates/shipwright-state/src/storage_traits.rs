//! Storage trait definitions for Shipwright
//!
//! These traits define the record store the orchestration core talks to:
//! - `MachineStore`: machines and repositories
//! - `CommitStore`: observed commits and their status fields
//! - `BranchStore`: branches per repository
//! - `ReleaseStore`: releases and release items
//! - `TestRunStore`: test runs and their lines
//! - `LeaseStore`: advisory lock leases shared between processes
//! - `JobStore`: the persistent task queue
//!
//! All traits are async and backend-agnostic. `RecordStore` bundles them.
//! In-memory fakes are provided for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// MachineStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MachineStore: Send + Sync {
    async fn save_machine(&self, machine: &Machine) -> StorageResult<()>;

    /// Returns `StorageError::NotFound` if absent.
    async fn get_machine(&self, id: &MachineId) -> StorageResult<Machine>;

    async fn save_repository(&self, repo: &Repository) -> StorageResult<()>;

    /// Returns `StorageError::NotFound` if absent.
    async fn get_repository(&self, id: &RepoId) -> StorageResult<Repository>;

    async fn find_repository(&self, name: &str) -> StorageResult<Option<Repository>>;

    async fn list_repositories(&self) -> StorageResult<Vec<Repository>>;
}

// ---------------------------------------------------------------------------
// CommitStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Insert or replace a commit keyed by sha.
    async fn save_commit(&self, commit: &Commit) -> StorageResult<()>;

    async fn get_commit(&self, sha: &str) -> StorageResult<Option<Commit>>;

    /// Commits linked to a branch, oldest first by commit date.
    async fn commits_of_branch(&self, branch: &BranchId) -> StorageResult<Vec<Commit>>;
}

// ---------------------------------------------------------------------------
// BranchStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BranchStore: Send + Sync {
    async fn save_branch(&self, branch: &Branch) -> StorageResult<()>;

    /// Returns `StorageError::NotFound` if absent.
    async fn get_branch(&self, id: &BranchId) -> StorageResult<Branch>;

    async fn find_branch(&self, repo: &RepoId, name: &str) -> StorageResult<Option<Branch>>;

    /// All branches of a repository, active or not.
    async fn list_branches(&self, repo: &RepoId) -> StorageResult<Vec<Branch>>;
}

// ---------------------------------------------------------------------------
// ReleaseStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Validates the release before writing it.
    async fn save_release(&self, release: &Release) -> StorageResult<()>;

    /// Returns `StorageError::NotFound` if absent.
    async fn get_release(&self, id: &ReleaseId) -> StorageResult<Release>;

    async fn find_release(&self, name: &str) -> StorageResult<Option<Release>>;

    async fn list_releases(&self) -> StorageResult<Vec<Release>>;

    /// Insert or replace an item.
    ///
    /// Returns `StorageError::Invariant` when the write would leave two `new`
    /// standard items on the same release.
    async fn save_item(&self, item: &ReleaseItem) -> StorageResult<()>;

    /// Returns `StorageError::NotFound` if absent.
    async fn get_item(&self, id: &ReleaseItemId) -> StorageResult<ReleaseItem>;

    /// Items of a release, newest first.
    async fn items_of_release(&self, release: &ReleaseId) -> StorageResult<Vec<ReleaseItem>>;
}

// ---------------------------------------------------------------------------
// TestRunStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TestRunStore: Send + Sync {
    async fn save_run(&self, run: &TestRun) -> StorageResult<()>;

    /// Returns `StorageError::NotFound` if absent.
    async fn get_run(&self, id: &TestRunId) -> StorageResult<TestRun>;

    /// Runs for a commit, newest first.
    async fn runs_of_commit(&self, sha: &str) -> StorageResult<Vec<TestRun>>;

    async fn save_line(&self, line: &TestRunLine) -> StorageResult<()>;

    /// Returns `StorageError::NotFound` if absent.
    async fn get_line(&self, id: &TestRunLineId) -> StorageResult<TestRunLine>;

    /// Lines of a run ordered by `seq`.
    async fn lines_of_run(&self, run: &TestRunId) -> StorageResult<Vec<TestRunLine>>;

    /// A successful line in the same repository with the same cache key.
    async fn find_succeeded_line(
        &self,
        repo: &RepoId,
        unique_name: &str,
        hash: &str,
    ) -> StorageResult<Option<TestRunLine>>;
}

// ---------------------------------------------------------------------------
// LeaseStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take `lease.key`. Succeeds when the key is free, its lease expired or
    /// it is held by the same `holder`; the stored lease is then replaced.
    ///
    /// Returns `false` when another holder has a live lease.
    async fn acquire_lease(&self, lease: &Lease) -> StorageResult<bool>;

    /// Remove the lease on `key` if it still carries `token`.
    async fn release_lease(&self, key: &str, token: &str) -> StorageResult<()>;

    async fn get_lease(&self, key: &str) -> StorageResult<Option<Lease>>;
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` unless a live job with the same identity key exists.
    ///
    /// Returns the live job for the key: `job` itself, or the one already
    /// queued. A finished job with the same key is replaced.
    async fn insert_job(&self, job: &QueuedJob) -> StorageResult<QueuedJob>;

    /// Replace `job` if the stored copy is still in status `expected`.
    ///
    /// Returns `false` when another worker changed it first.
    async fn update_job(&self, job: &QueuedJob, expected: JobStatus) -> StorageResult<bool>;

    async fn get_job(&self, id: &str) -> StorageResult<Option<QueuedJob>>;

    /// Pending jobs with `run_at <= now`, earliest first.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<QueuedJob>>;

    async fn delete_job(&self, id: &str) -> StorageResult<()>;

    async fn list_jobs(&self) -> StorageResult<Vec<QueuedJob>>;
}

/// Everything the orchestration core reads and writes.
pub trait RecordStore:
    MachineStore + CommitStore + BranchStore + ReleaseStore + TestRunStore + LeaseStore + JobStore
{
}

impl<T> RecordStore for T where
    T: MachineStore
        + CommitStore
        + BranchStore
        + ReleaseStore
        + TestRunStore
        + LeaseStore
        + JobStore
{
}
