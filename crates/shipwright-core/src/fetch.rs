//! Repository fetch: discovers branches and commits.

use std::collections::HashSet;

use shipwright_state::{Branch, Commit, RepoId};
use tracing::{debug, info, instrument};

use crate::branch_state::BranchStateMachine;
use crate::context::Context;
use crate::error::Result;
use crate::queue::JobPayload;

/// Window of history considered when recording commits.
pub const FETCH_WINDOW: &str = "4 months ago";

/// What one fetch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub new_branches: Vec<String>,
    pub new_commits: usize,
    /// Branches whose head moved
    pub updated: Vec<String>,
    pub deactivated: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BranchFetcher {
    ctx: Context,
    states: BranchStateMachine,
}

impl BranchFetcher {
    pub fn new(ctx: Context) -> Self {
        let states = BranchStateMachine::new(ctx.clone());
        Self { ctx, states }
    }

    #[instrument(skip(self))]
    pub async fn fetch_repository(&self, repo_id: &RepoId) -> Result<FetchSummary> {
        let store = &self.ctx.store;
        let repo = store.get_repository(repo_id).await?;
        let git = self.ctx.mirror(&repo).await?;
        git.ensure_mirror(&repo.url).await?;

        let remote = git.list_remote_branches().await?;
        let mut summary = FetchSummary::default();

        for name in &remote {
            let mut branch = match store.find_branch(&repo.id, name).await? {
                Some(b) => b,
                None => {
                    info!(repo = %repo.name, branch = %name, "new branch");
                    summary.new_branches.push(name.clone());
                    Branch::new(repo.id.clone(), name.clone())
                }
            };
            branch.active = true;

            let commits = git.recent_commits(name, FETCH_WINDOW).await?;
            // git lists newest first; record oldest first
            for (sha, _) in commits.iter().rev() {
                let (mut commit, is_new) = match store.get_commit(sha).await? {
                    Some(c) => (c, false),
                    None => {
                        let info = git.commit_info(sha).await?;
                        summary.new_commits += 1;
                        let c = Commit::new(
                            sha.clone(),
                            repo.id.clone(),
                            info.author,
                            info.date,
                            info.message,
                        );
                        (c, true)
                    }
                };
                if commit.branch_ids.insert(branch.id.clone()) || is_new {
                    store.save_commit(&commit).await?;
                }
                branch.add_commit(sha);
            }

            let head = commits.first().map(|(sha, _)| sha.clone());
            let moved = head.is_some() && head != branch.latest_commit;
            if moved {
                branch.latest_commit = head.clone();
                summary.updated.push(name.clone());
            }
            store.save_branch(&branch).await?;
            self.states.recompute(&branch.id).await?;

            if let (true, Some(sha)) = (moved && branch.any_testing(), head) {
                debug!(branch = %name, sha = %sha, "queueing test run for new head");
                self.ctx
                    .queue
                    .enqueue(
                        JobPayload::RunTests {
                            branch_id: branch.id.clone(),
                            commit: Some(sha),
                        },
                        None,
                    )
                    .await?;
            }
        }

        let remote: HashSet<&String> = remote.iter().collect();
        for mut branch in store.list_branches(&repo.id).await? {
            if branch.active && !remote.contains(&branch.name) {
                info!(repo = %repo.name, branch = %branch.name, "branch vanished, deactivating");
                branch.active = false;
                store.save_branch(&branch).await?;
                summary.deactivated.push(branch.name);
            }
        }

        info!(
            repo = %repo.name,
            new_branches = summary.new_branches.len(),
            new_commits = summary.new_commits,
            "fetch done"
        );
        Ok(summary)
    }
}
