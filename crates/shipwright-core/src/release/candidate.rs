//! Candidate branch selection and recreation.

use std::collections::BTreeSet;

use chrono::Utc;
use shipwright_state::{
    ApprovalState, Branch, BranchId, BranchState, Commit, ItemBranchState, ItemState,
    MergeConflict, Release, ReleaseItem, ReleaseItemBranch, ReleaseItemId, ReleaseType,
    Repository,
};
use tracing::{info, instrument, warn};

use super::{CandidateOutcome, ReleaseAssembler};
use crate::error::{Result, ShipwrightError};
use crate::gitops::{remote_ref, MergeOutcome};
use crate::queue::JobPayload;

/// States that keep a branch in a standard item.
const KEEP_STATES: &[BranchState] = &[
    BranchState::Tested,
    BranchState::Candidate,
    BranchState::Done,
    BranchState::MergeConflict,
];

/// Marker commit message listing the included branches.
pub fn marker_message(item: &ReleaseItem, branch_names: &[String]) -> String {
    format!(
        "Release Item {}\nIncludes latest commits from:\n{}",
        item.id,
        branch_names.join(", ")
    )
}

impl ReleaseAssembler {
    /// Add tested branches to a standard item and drop those that fell back.
    ///
    /// Returns whether the branch set changed; a change queues a candidate
    /// recreation.
    #[instrument(skip(self))]
    pub async fn collect_tested_branches(&self, item_id: &ReleaseItemId) -> Result<bool> {
        let store = &self.ctx.store;
        let mut item = store.get_item(item_id).await?;
        if !item.is_open() || item.release_type != ReleaseType::Standard {
            return Ok(false);
        }
        let release = store.get_release(&item.release_id).await?;
        let branches = store.list_branches(&release.repo_id).await?;
        let before = item.branch_ids.clone();

        for b in &branches {
            if b.active
                && b.state == BranchState::Tested
                && !b.block_release
                && !release.is_own_branch(&b.name)
            {
                item.add_branch(&b.id);
            }
        }
        item.branch_ids.retain(|id| {
            branches
                .iter()
                .find(|b| &b.id == id)
                .map(|b| b.active && KEEP_STATES.contains(&b.state))
                .unwrap_or(false)
        });

        if item.branch_ids == before {
            return Ok(false);
        }
        info!(item = %item.name, branches = item.branch_ids.len(), "branch set changed");
        store.save_item(&item).await?;
        let touched: BTreeSet<&BranchId> = before.iter().chain(item.branch_ids.iter()).collect();
        self.states.recompute_many(touched).await?;
        self.ctx
            .queue
            .enqueue(
                JobPayload::RecreateCandidate {
                    release_id: item.release_id.clone(),
                    item_id: item.id.clone(),
                },
                None,
            )
            .await?;
        Ok(true)
    }

    /// Latest commit of `branch` that is releasable and not newer than the
    /// item's cutoff.
    async fn select_commit(&self, item: &ReleaseItem, branch: &Branch) -> Result<Option<Commit>> {
        let cutoff = item.final_curtain.unwrap_or_else(Utc::now);
        let commits = self.ctx.store.commits_of_branch(&branch.id).await?;
        Ok(commits
            .into_iter()
            .filter(|c| c.date <= cutoff && c.is_releasable())
            .last())
    }

    /// Rebuild the candidate branch from stable plus the item's branches.
    ///
    /// Conflicting branches are recorded and skipped; the remaining merges go
    /// on. Nothing is merged when the selected commits equal those of the
    /// last recreation or of the immediately preceding item.
    #[instrument(skip(self))]
    pub async fn recreate_candidate(&self, item_id: &ReleaseItemId) -> Result<CandidateOutcome> {
        let store = &self.ctx.store;
        let mut item = store.get_item(item_id).await?;
        if !matches!(
            item.state,
            ItemState::New | ItemState::Failed | ItemState::Ignore
        ) {
            return Err(ShipwrightError::Validation(format!(
                "branches of item {} can only change in state new, failed or ignore",
                item.name
            )));
        }
        let release = store.get_release(&item.release_id).await?;
        let repo = store.get_repository(&release.repo_id).await?;

        let mut touched: Vec<BranchId> = item.branch_ids.clone();
        let mut branches = Vec::new();
        for id in &item.branch_ids {
            let branch = store.get_branch(id).await?;
            if !branch.block_release {
                branches.push(branch);
            }
        }
        item.branch_ids = branches.iter().map(|b| b.id.clone()).collect();

        let mut selected = Vec::new();
        for branch in branches {
            match self.select_commit(&item, &branch).await? {
                Some(commit) => selected.push((branch, commit)),
                None => warn!(branch = %branch.name, "no releasable commit before cutoff"),
            }
        }
        let wanted: BTreeSet<String> = selected.iter().map(|(_, c)| c.sha.clone()).collect();

        if item.commit_id.is_some() && attempted(&item) == wanted {
            info!(item = %item.name, "commit set unchanged, keeping candidate");
            store.save_item(&item).await?;
            return Ok(CandidateOutcome::Unchanged);
        }

        if let Some(prev) = self.preceding_item(&item).await? {
            if let Some(commit) = prev.commit_id.clone().filter(|_| attempted(&prev) == wanted) {
                info!(item = %item.name, previous = %prev.name, "reusing merge of preceding item");
                item.commit_id = Some(commit.clone());
                item.commit_ids = prev.commit_ids.clone();
                item.branches = prev.branches.clone();
                store.save_item(&item).await?;
                self.states.recompute_many(touched.iter()).await?;
                return Ok(CandidateOutcome::Reused { commit });
            }
        }

        let (marker, message, rows) = self
            .merge_candidate(&release, &repo, &item, &selected)
            .await?;
        let conflicts: Vec<BranchId> = rows
            .iter()
            .filter(|r| r.state == ItemBranchState::Conflict)
            .map(|r| r.branch_id.clone())
            .collect();
        item.commit_ids = rows
            .iter()
            .filter(|r| r.state == ItemBranchState::Merged)
            .map(|r| r.commit_sha.clone())
            .collect();
        item.branches = rows;
        item.commit_id = Some(marker.clone());
        store.save_item(&item).await?;

        let candidate = self
            .register_marker(&release, &repo, &marker, &message)
            .await?;
        touched.push(candidate);
        if let Some(stable) = store.find_branch(&repo.id, &release.stable_branch).await? {
            touched.push(stable.id);
        }
        self.states.recompute_many(touched.iter()).await?;

        info!(
            item = %item.name,
            merged = item.commit_ids.len(),
            conflicts = conflicts.len(),
            "candidate recreated"
        );
        Ok(CandidateOutcome::Recreated {
            commit: marker,
            conflicts,
        })
    }

    async fn preceding_item(&self, item: &ReleaseItem) -> Result<Option<ReleaseItem>> {
        let items = self.ctx.store.items_of_release(&item.release_id).await?;
        Ok(items
            .into_iter()
            .filter(|i| i.number < item.number)
            .max_by_key(|i| i.number))
    }

    /// Merge the selected commits onto a fresh candidate and push it.
    async fn merge_candidate(
        &self,
        release: &Release,
        repo: &Repository,
        item: &ReleaseItem,
        selected: &[(Branch, Commit)],
    ) -> Result<(String, String, Vec<ReleaseItemBranch>)> {
        let git = self.ctx.mirror(repo).await?;
        git.ensure_mirror(&repo.url).await?;
        let _guard = git.lock().await?;
        git.checkout_new(&release.candidate_branch, &remote_ref(&release.stable_branch))
            .await?;

        let mut rows = Vec::new();
        let mut merged_names: Vec<String> = Vec::new();
        for (branch, commit) in selected {
            let message = format!(
                "Merge {} ({}) into {}",
                branch.name,
                commit.short(),
                release.candidate_branch
            );
            let (state, conflict) = match git.merge(&commit.sha, &message).await? {
                MergeOutcome::Merged => {
                    merged_names.push(branch.name.clone());
                    (ItemBranchState::Merged, None)
                }
                MergeOutcome::Conflict { output } => {
                    warn!(branch = %branch.name, sha = %commit.short(), "merge conflict");
                    let conflict = MergeConflict {
                        output,
                        merged_before: merged_names.clone(),
                    };
                    (ItemBranchState::Conflict, Some(conflict))
                }
            };
            rows.push(ReleaseItemBranch {
                branch_id: branch.id.clone(),
                commit_sha: commit.sha.clone(),
                state,
                conflict,
            });
        }

        let message = marker_message(item, &merged_names);
        let marker = git.commit_empty(&message).await?;
        git.push(&release.candidate_branch, true).await?;
        Ok((marker, message, rows))
    }

    /// Record the approved marker commit on the candidate branch and queue
    /// its test run. Returns the candidate branch id.
    async fn register_marker(
        &self,
        release: &Release,
        repo: &Repository,
        marker: &str,
        message: &str,
    ) -> Result<BranchId> {
        let store = &self.ctx.store;
        let mut candidate = match store.find_branch(&repo.id, &release.candidate_branch).await? {
            Some(b) => b,
            None => Branch::new(repo.id.clone(), release.candidate_branch.clone()),
        };
        candidate.active = true;
        candidate.add_commit(marker);
        candidate.latest_commit = Some(marker.to_string());

        let mut commit = match store.get_commit(marker).await? {
            Some(c) => c,
            None => Commit::new(marker, repo.id.clone(), "shipwright", Utc::now(), message),
        };
        commit.approval_state = ApprovalState::Approved;
        commit.branch_ids.insert(candidate.id.clone());
        store.save_commit(&commit).await?;
        store.save_branch(&candidate).await?;

        self.ctx
            .queue
            .enqueue(
                JobPayload::RunTests {
                    branch_id: candidate.id.clone(),
                    commit: Some(marker.to_string()),
                },
                None,
            )
            .await?;
        Ok(candidate.id)
    }
}

/// Commits the last recreation tried to merge, conflicts included.
fn attempted(item: &ReleaseItem) -> BTreeSet<String> {
    item.branches.iter().map(|r| r.commit_sha.clone()).collect()
}
