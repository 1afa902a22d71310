//! SurrealDB-backed implementation of the storage traits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use crate::error::StorageError;
use crate::handle::{Row, SurrealHandle};
use crate::schema::*;
use crate::storage_traits::*;

/// Record store persisting into SurrealDB through a shared handle.
#[derive(Clone)]
pub struct SurrealRecordStore {
    handle: Arc<SurrealHandle>,
}

impl SurrealRecordStore {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self { handle }
    }

    /// In-memory database, mostly for local runs.
    pub async fn in_memory() -> StorageResult<Self> {
        Ok(Self::new(Arc::new(SurrealHandle::setup_db().await?)))
    }
}

fn state_name<T: serde::Serialize>(state: &T) -> StorageResult<String> {
    match serde_json::to_value(state)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

#[async_trait]
impl MachineStore for SurrealRecordStore {
    async fn save_machine(&self, machine: &Machine) -> StorageResult<()> {
        let mut row = Row::new(machine.id.as_str(), machine)?;
        row.name = machine.name.clone();
        self.handle.upsert_row("machine", row).await
    }

    async fn get_machine(&self, id: &MachineId) -> StorageResult<Machine> {
        self.handle
            .get_payload("machine", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("machine", id))
    }

    async fn save_repository(&self, repo: &Repository) -> StorageResult<()> {
        let mut row = Row::new(repo.id.as_str(), repo)?;
        row.owner = repo.machine_id.0.clone();
        row.name = repo.name.clone();
        self.handle.upsert_row("repository", row).await
    }

    async fn get_repository(&self, id: &RepoId) -> StorageResult<Repository> {
        self.handle
            .get_payload("repository", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("repository", id))
    }

    async fn find_repository(&self, name: &str) -> StorageResult<Option<Repository>> {
        let found = self
            .handle
            .select_payloads(
                "SELECT payload FROM repository WHERE name = $name",
                vec![("name", name.to_string())],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn list_repositories(&self) -> StorageResult<Vec<Repository>> {
        self.handle
            .select_payloads("SELECT payload FROM repository", Vec::new())
            .await
    }
}

#[async_trait]
impl CommitStore for SurrealRecordStore {
    async fn save_commit(&self, commit: &Commit) -> StorageResult<()> {
        let mut row = Row::new(commit.sha.as_str(), commit)?;
        row.owner = commit.repo_id.0.clone();
        row.name = commit.sha.clone();
        row.state = state_name(&commit.test_state)?;
        row.tags = commit.branch_ids.iter().map(|b| b.0.clone()).collect();
        row.rank = commit.date.timestamp();
        self.handle.upsert_row("commit", row).await
    }

    async fn get_commit(&self, sha: &str) -> StorageResult<Option<Commit>> {
        self.handle.get_payload("commit", sha).await
    }

    async fn commits_of_branch(&self, branch: &BranchId) -> StorageResult<Vec<Commit>> {
        self.handle
            .select_payloads(
                "SELECT payload, rank, name FROM commit WHERE tags CONTAINS $branch ORDER BY rank ASC, name ASC",
                vec![("branch", branch.0.clone())],
            )
            .await
    }
}

#[async_trait]
impl BranchStore for SurrealRecordStore {
    async fn save_branch(&self, branch: &Branch) -> StorageResult<()> {
        if let Some(existing) = self.find_branch(&branch.repo_id, &branch.name).await? {
            if existing.id != branch.id {
                return Err(StorageError::Invariant(format!(
                    "branch {} already exists in repository {}",
                    branch.name, branch.repo_id
                )));
            }
        }
        let mut row = Row::new(branch.id.as_str(), branch)?;
        row.owner = branch.repo_id.0.clone();
        row.name = branch.name.clone();
        row.state = branch.state.as_str().to_string();
        row.rank = branch.created_at.timestamp_millis();
        self.handle.upsert_row("branch", row).await
    }

    async fn get_branch(&self, id: &BranchId) -> StorageResult<Branch> {
        self.handle
            .get_payload("branch", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("branch", id))
    }

    async fn find_branch(&self, repo: &RepoId, name: &str) -> StorageResult<Option<Branch>> {
        let found = self
            .handle
            .select_payloads(
                "SELECT payload FROM branch WHERE owner = $repo AND name = $name",
                vec![("repo", repo.0.clone()), ("name", name.to_string())],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn list_branches(&self, repo: &RepoId) -> StorageResult<Vec<Branch>> {
        self.handle
            .select_payloads(
                "SELECT payload, rank FROM branch WHERE owner = $repo ORDER BY rank ASC",
                vec![("repo", repo.0.clone())],
            )
            .await
    }
}

#[async_trait]
impl ReleaseStore for SurrealRecordStore {
    async fn save_release(&self, release: &Release) -> StorageResult<()> {
        release.validate()?;
        let mut row = Row::new(release.id.as_str(), release)?;
        row.owner = release.repo_id.0.clone();
        row.name = release.name.clone();
        self.handle.upsert_row("release", row).await
    }

    async fn get_release(&self, id: &ReleaseId) -> StorageResult<Release> {
        self.handle
            .get_payload("release", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("release", id))
    }

    async fn find_release(&self, name: &str) -> StorageResult<Option<Release>> {
        let found = self
            .handle
            .select_payloads(
                "SELECT payload FROM release WHERE name = $name",
                vec![("name", name.to_string())],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn list_releases(&self) -> StorageResult<Vec<Release>> {
        self.handle
            .select_payloads("SELECT payload FROM release", Vec::new())
            .await
    }

    async fn save_item(&self, item: &ReleaseItem) -> StorageResult<()> {
        let siblings = self.items_of_release(&item.release_id).await?;
        check_single_new_standard(item, &siblings)?;
        let mut row = Row::new(item.id.as_str(), item)?;
        row.owner = item.release_id.0.clone();
        row.name = item.name.clone();
        row.state = item.state.to_string();
        row.rank = item.number as i64;
        debug!(item = %item.name, state = %item.state, "saving release item");
        self.handle.upsert_row("release_item", row).await
    }

    async fn get_item(&self, id: &ReleaseItemId) -> StorageResult<ReleaseItem> {
        self.handle
            .get_payload("release_item", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("release item", id))
    }

    async fn items_of_release(&self, release: &ReleaseId) -> StorageResult<Vec<ReleaseItem>> {
        self.handle
            .select_payloads(
                "SELECT payload, rank FROM release_item WHERE owner = $release ORDER BY rank DESC",
                vec![("release", release.0.clone())],
            )
            .await
    }
}

#[async_trait]
impl TestRunStore for SurrealRecordStore {
    async fn save_run(&self, run: &TestRun) -> StorageResult<()> {
        let mut row = Row::new(run.id.as_str(), run)?;
        row.owner = run.commit_sha.clone();
        row.state = run.state.to_string();
        row.tags = vec![run.repo_id.0.clone(), run.branch_id.0.clone()];
        row.rank = run.created_at.timestamp_millis();
        self.handle.upsert_row("test_run", row).await
    }

    async fn get_run(&self, id: &TestRunId) -> StorageResult<TestRun> {
        self.handle
            .get_payload("test_run", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("test run", id))
    }

    async fn runs_of_commit(&self, sha: &str) -> StorageResult<Vec<TestRun>> {
        self.handle
            .select_payloads(
                "SELECT payload, rank FROM test_run WHERE owner = $sha ORDER BY rank DESC",
                vec![("sha", sha.to_string())],
            )
            .await
    }

    async fn save_line(&self, line: &TestRunLine) -> StorageResult<()> {
        let mut row = Row::new(line.id.as_str(), line)?;
        row.owner = line.run_id.0.clone();
        row.name = line.unique_name.clone().unwrap_or_default();
        row.hash = line.hash.clone();
        row.state = state_name(&line.state)?;
        row.tags = vec![line.repo_id.0.clone()];
        row.rank = i64::from(line.seq);
        self.handle.upsert_row("test_run_line", row).await
    }

    async fn get_line(&self, id: &TestRunLineId) -> StorageResult<TestRunLine> {
        self.handle
            .get_payload("test_run_line", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("test run line", id))
    }

    async fn lines_of_run(&self, run: &TestRunId) -> StorageResult<Vec<TestRunLine>> {
        self.handle
            .select_payloads(
                "SELECT payload, rank FROM test_run_line WHERE owner = $run ORDER BY rank ASC",
                vec![("run", run.0.clone())],
            )
            .await
    }

    async fn find_succeeded_line(
        &self,
        repo: &RepoId,
        unique_name: &str,
        hash: &str,
    ) -> StorageResult<Option<TestRunLine>> {
        let found = self
            .handle
            .select_payloads(
                "SELECT payload FROM test_run_line WHERE tags CONTAINS $repo AND name = $name AND hash = $hash AND state = 'success' LIMIT 1",
                vec![
                    ("repo", repo.0.clone()),
                    ("name", unique_name.to_string()),
                    ("hash", hash.to_string()),
                ],
            )
            .await?;
        Ok(found.into_iter().next())
    }
}

#[async_trait]
impl LeaseStore for SurrealRecordStore {
    async fn acquire_lease(&self, lease: &Lease) -> StorageResult<bool> {
        let mut row = Row::new(lease.key.as_str(), lease)?;
        row.owner = lease.holder.clone();
        row.hash = Some(lease.token.clone());
        row.rank = lease.expires_at.timestamp_millis();
        self.handle
            .create_row_unless_taken(
                "lease",
                row,
                "rank <= $now OR owner = $holder",
                vec![
                    ("now", json!(Utc::now().timestamp_millis())),
                    ("holder", json!(lease.holder)),
                ],
            )
            .await?;
        let current = self.get_lease(&lease.key).await?;
        Ok(current.map(|l| l.token == lease.token).unwrap_or(false))
    }

    async fn release_lease(&self, key: &str, token: &str) -> StorageResult<()> {
        self.handle
            .execute(
                "DELETE type::thing('lease', $key) WHERE hash = $lease_token",
                vec![("key", json!(key)), ("lease_token", json!(token))],
            )
            .await
    }

    async fn get_lease(&self, key: &str) -> StorageResult<Option<Lease>> {
        self.handle.get_payload("lease", key).await
    }
}

fn job_row(job: &QueuedJob) -> StorageResult<Row> {
    // One row per identity key keeps at most one live job per key.
    let mut row = Row::new(job.identity_key.as_str(), job)?;
    row.name = job.id.clone();
    row.state = state_name(&job.status)?;
    row.rank = job.run_at.timestamp_millis();
    Ok(row)
}

#[async_trait]
impl JobStore for SurrealRecordStore {
    async fn insert_job(&self, job: &QueuedJob) -> StorageResult<QueuedJob> {
        self.handle
            .create_row_unless_taken(
                "job",
                job_row(job)?,
                "state IN ['done', 'failed']",
                Vec::new(),
            )
            .await?;
        let live: Option<QueuedJob> = self.handle.get_payload("job", &job.identity_key).await?;
        live.ok_or_else(|| StorageError::Backend(format!("job {} was not stored", job.id)))
    }

    async fn update_job(&self, job: &QueuedJob, expected: JobStatus) -> StorageResult<bool> {
        self.handle
            .replace_row_if(
                "job",
                job_row(job)?,
                "state = $expected AND name = $id",
                vec![
                    ("expected", json!(state_name(&expected)?)),
                    ("id", json!(job.id)),
                ],
            )
            .await
    }

    async fn get_job(&self, id: &str) -> StorageResult<Option<QueuedJob>> {
        let found = self
            .handle
            .select_payloads(
                "SELECT payload FROM job WHERE name = $id",
                vec![("id", id.to_string())],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<QueuedJob>> {
        self.handle
            .select_payloads_with(
                "SELECT payload, rank FROM job WHERE state = 'pending' AND rank <= $now ORDER BY rank ASC LIMIT $limit",
                vec![
                    ("now", json!(now.timestamp_millis())),
                    ("limit", json!(limit)),
                ],
            )
            .await
    }

    async fn delete_job(&self, id: &str) -> StorageResult<()> {
        debug!(job = %id, "deleting job");
        self.handle
            .execute("DELETE job WHERE name = $id", vec![("id", json!(id))])
            .await
    }

    async fn list_jobs(&self) -> StorageResult<Vec<QueuedJob>> {
        self.handle
            .select_payloads("SELECT payload, rank FROM job ORDER BY rank ASC", Vec::new())
            .await
    }
}
