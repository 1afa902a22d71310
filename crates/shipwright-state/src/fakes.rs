//! In-memory fake for the storage traits (testing only)
//!
//! `MemoryRecordStore` satisfies every trait contract without any external
//! dependencies. Records are kept in insertion order.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    machines: HashMap<String, Machine>,
    repositories: Vec<Repository>,
    commits: HashMap<String, Commit>,
    branches: Vec<Branch>,
    releases: Vec<Release>,
    items: Vec<ReleaseItem>,
    runs: Vec<TestRun>,
    lines: Vec<TestRunLine>,
    leases: HashMap<String, Lease>,
    jobs: Vec<QueuedJob>,
}

/// In-memory record store backed by vectors and maps behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<Tables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn upsert<T, F>(rows: &mut Vec<T>, row: &T, same: F)
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    match rows.iter_mut().find(|r| same(r)) {
        Some(existing) => *existing = row.clone(),
        None => rows.push(row.clone()),
    }
}

// ---------------------------------------------------------------------------
// MachineStore
// ---------------------------------------------------------------------------

#[async_trait]
impl MachineStore for MemoryRecordStore {
    async fn save_machine(&self, machine: &Machine) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        t.machines.insert(machine.id.0.clone(), machine.clone());
        Ok(())
    }

    async fn get_machine(&self, id: &MachineId) -> StorageResult<Machine> {
        let t = self.tables.lock().unwrap();
        t.machines
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::not_found("machine", id))
    }

    async fn save_repository(&self, repo: &Repository) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        upsert(&mut t.repositories, repo, |r| r.id == repo.id);
        Ok(())
    }

    async fn get_repository(&self, id: &RepoId) -> StorageResult<Repository> {
        let t = self.tables.lock().unwrap();
        t.repositories
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("repository", id))
    }

    async fn find_repository(&self, name: &str) -> StorageResult<Option<Repository>> {
        let t = self.tables.lock().unwrap();
        Ok(t.repositories.iter().find(|r| r.name == name).cloned())
    }

    async fn list_repositories(&self) -> StorageResult<Vec<Repository>> {
        let t = self.tables.lock().unwrap();
        Ok(t.repositories.clone())
    }
}

// ---------------------------------------------------------------------------
// CommitStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CommitStore for MemoryRecordStore {
    async fn save_commit(&self, commit: &Commit) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        t.commits.insert(commit.sha.clone(), commit.clone());
        Ok(())
    }

    async fn get_commit(&self, sha: &str) -> StorageResult<Option<Commit>> {
        let t = self.tables.lock().unwrap();
        Ok(t.commits.get(sha).cloned())
    }

    async fn commits_of_branch(&self, branch: &BranchId) -> StorageResult<Vec<Commit>> {
        let t = self.tables.lock().unwrap();
        let mut commits: Vec<Commit> = t
            .commits
            .values()
            .filter(|c| c.branch_ids.contains(branch))
            .cloned()
            .collect();
        commits.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.sha.cmp(&b.sha)));
        Ok(commits)
    }
}

// ---------------------------------------------------------------------------
// BranchStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BranchStore for MemoryRecordStore {
    async fn save_branch(&self, branch: &Branch) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        if t
            .branches
            .iter()
            .any(|b| b.id != branch.id && b.repo_id == branch.repo_id && b.name == branch.name)
        {
            return Err(StorageError::Invariant(format!(
                "branch {} already exists in repository {}",
                branch.name, branch.repo_id
            )));
        }
        upsert(&mut t.branches, branch, |b| b.id == branch.id);
        Ok(())
    }

    async fn get_branch(&self, id: &BranchId) -> StorageResult<Branch> {
        let t = self.tables.lock().unwrap();
        t.branches
            .iter()
            .find(|b| &b.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("branch", id))
    }

    async fn find_branch(&self, repo: &RepoId, name: &str) -> StorageResult<Option<Branch>> {
        let t = self.tables.lock().unwrap();
        Ok(t
            .branches
            .iter()
            .find(|b| &b.repo_id == repo && b.name == name)
            .cloned())
    }

    async fn list_branches(&self, repo: &RepoId) -> StorageResult<Vec<Branch>> {
        let t = self.tables.lock().unwrap();
        Ok(t
            .branches
            .iter()
            .filter(|b| &b.repo_id == repo)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ReleaseStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ReleaseStore for MemoryRecordStore {
    async fn save_release(&self, release: &Release) -> StorageResult<()> {
        release.validate()?;
        let mut t = self.tables.lock().unwrap();
        upsert(&mut t.releases, release, |r| r.id == release.id);
        Ok(())
    }

    async fn get_release(&self, id: &ReleaseId) -> StorageResult<Release> {
        let t = self.tables.lock().unwrap();
        t.releases
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("release", id))
    }

    async fn find_release(&self, name: &str) -> StorageResult<Option<Release>> {
        let t = self.tables.lock().unwrap();
        Ok(t.releases.iter().find(|r| r.name == name).cloned())
    }

    async fn list_releases(&self) -> StorageResult<Vec<Release>> {
        let t = self.tables.lock().unwrap();
        Ok(t.releases.clone())
    }

    async fn save_item(&self, item: &ReleaseItem) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        check_single_new_standard(item, &t.items)?;
        upsert(&mut t.items, item, |i| i.id == item.id);
        Ok(())
    }

    async fn get_item(&self, id: &ReleaseItemId) -> StorageResult<ReleaseItem> {
        let t = self.tables.lock().unwrap();
        t.items
            .iter()
            .find(|i| &i.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("release item", id))
    }

    async fn items_of_release(&self, release: &ReleaseId) -> StorageResult<Vec<ReleaseItem>> {
        let t = self.tables.lock().unwrap();
        let mut items: Vec<ReleaseItem> = t
            .items
            .iter()
            .filter(|i| &i.release_id == release)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// TestRunStore
// ---------------------------------------------------------------------------

#[async_trait]
impl TestRunStore for MemoryRecordStore {
    async fn save_run(&self, run: &TestRun) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        upsert(&mut t.runs, run, |r| r.id == run.id);
        Ok(())
    }

    async fn get_run(&self, id: &TestRunId) -> StorageResult<TestRun> {
        let t = self.tables.lock().unwrap();
        t.runs
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("test run", id))
    }

    async fn runs_of_commit(&self, sha: &str) -> StorageResult<Vec<TestRun>> {
        let t = self.tables.lock().unwrap();
        Ok(t
            .runs
            .iter()
            .rev()
            .filter(|r| r.commit_sha == sha)
            .cloned()
            .collect())
    }

    async fn save_line(&self, line: &TestRunLine) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        upsert(&mut t.lines, line, |l| l.id == line.id);
        Ok(())
    }

    async fn get_line(&self, id: &TestRunLineId) -> StorageResult<TestRunLine> {
        let t = self.tables.lock().unwrap();
        t.lines
            .iter()
            .find(|l| &l.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("test run line", id))
    }

    async fn lines_of_run(&self, run: &TestRunId) -> StorageResult<Vec<TestRunLine>> {
        let t = self.tables.lock().unwrap();
        let mut lines: Vec<TestRunLine> = t
            .lines
            .iter()
            .filter(|l| &l.run_id == run)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.seq);
        Ok(lines)
    }

    async fn find_succeeded_line(
        &self,
        repo: &RepoId,
        unique_name: &str,
        hash: &str,
    ) -> StorageResult<Option<TestRunLine>> {
        let t = self.tables.lock().unwrap();
        Ok(t
            .lines
            .iter()
            .rev()
            .find(|l| {
                &l.repo_id == repo
                    && l.unique_name.as_deref() == Some(unique_name)
                    && l.hash.as_deref() == Some(hash)
                    && l.state == LineState::Success
            })
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// LeaseStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LeaseStore for MemoryRecordStore {
    async fn acquire_lease(&self, lease: &Lease) -> StorageResult<bool> {
        let mut t = self.tables.lock().unwrap();
        if let Some(current) = t.leases.get(&lease.key) {
            if current.holder != lease.holder && !current.is_expired(Utc::now()) {
                return Ok(false);
            }
        }
        t.leases.insert(lease.key.clone(), lease.clone());
        Ok(true)
    }

    async fn release_lease(&self, key: &str, token: &str) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        if t.leases.get(key).map(|l| l.token == token).unwrap_or(false) {
            t.leases.remove(key);
        }
        Ok(())
    }

    async fn get_lease(&self, key: &str) -> StorageResult<Option<Lease>> {
        let t = self.tables.lock().unwrap();
        Ok(t.leases.get(key).cloned())
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

#[async_trait]
impl JobStore for MemoryRecordStore {
    async fn insert_job(&self, job: &QueuedJob) -> StorageResult<QueuedJob> {
        let mut t = self.tables.lock().unwrap();
        if let Some(live) = t
            .jobs
            .iter()
            .find(|j| j.identity_key == job.identity_key && j.status.is_live())
        {
            return Ok(live.clone());
        }
        t.jobs.retain(|j| j.identity_key != job.identity_key);
        t.jobs.push(job.clone());
        Ok(job.clone())
    }

    async fn update_job(&self, job: &QueuedJob, expected: JobStatus) -> StorageResult<bool> {
        let mut t = self.tables.lock().unwrap();
        match t.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(stored) if stored.status == expected => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, id: &str) -> StorageResult<Option<QueuedJob>> {
        let t = self.tables.lock().unwrap();
        Ok(t.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<QueuedJob>> {
        let t = self.tables.lock().unwrap();
        let mut due: Vec<QueuedJob> = t
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_job(&self, id: &str) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        t.jobs.retain(|j| j.id != id);
        Ok(())
    }

    async fn list_jobs(&self) -> StorageResult<Vec<QueuedJob>> {
        let t = self.tables.lock().unwrap();
        Ok(t.jobs.clone())
    }
}
