//! Branch instances: checkout, build, idle shutdown.

use chrono::{Duration, Utc};
use shipwright_state::{Branch, BranchId, Machine, RepoId, Repository};
use tracing::{info, instrument};

use crate::branch_state::BranchStateMachine;
use crate::context::Context;
use crate::error::{Result, ShipwrightError};
use crate::gitops::{remote_ref, GitOps};
use crate::remote::RemoteSession;

#[derive(Debug, Clone)]
pub struct BranchBuilder {
    ctx: Context,
    states: BranchStateMachine,
}

impl BranchBuilder {
    pub fn new(ctx: Context) -> Self {
        let states = BranchStateMachine::new(ctx.clone());
        Self { ctx, states }
    }

    /// Session in the branch checkout with the instance name exported.
    pub fn instance_session(
        &self,
        machine: &Machine,
        repo: &Repository,
        branch: &Branch,
    ) -> RemoteSession {
        self.ctx
            .session(machine, Context::branch_dir(machine, repo, branch))
            .with_env("PROJECT_NAME", branch.instance_name())
    }

    /// Bring the branch checkout to `sha` (the branch head when `None`).
    #[instrument(skip(self, machine, repo, branch), fields(branch = %branch.name))]
    pub async fn checkout(
        &self,
        machine: &Machine,
        repo: &Repository,
        branch: &Branch,
        sha: Option<&str>,
    ) -> Result<GitOps> {
        let git = self.ctx.git(self.instance_session(machine, repo, branch));
        git.ensure_mirror(&repo.url).await?;

        let target = match sha {
            Some(sha) => sha.to_string(),
            None => remote_ref(&branch.name),
        };
        let _guard = git.lock().await?;
        git.checkout_new(&branch.name, &target).await?;
        Ok(git)
    }

    /// Checkout plus instance build and start.
    #[instrument(skip(self))]
    pub async fn build_branch(&self, branch_id: &BranchId) -> Result<()> {
        let store = &self.ctx.store;
        let mut branch = store.get_branch(branch_id).await?;
        if !branch.active {
            return Err(ShipwrightError::Validation(format!(
                "branch {} is not active",
                branch.name
            )));
        }
        let repo = store.get_repository(&branch.repo_id).await?;
        let machine = self.ctx.machine(&repo.machine_id).await?;

        branch.build_attempted = true;
        branch.last_access = Utc::now();
        store.save_branch(&branch).await?;

        let git = self.checkout(&machine, &repo, &branch, None).await?;
        let cli = &self.ctx.config.tests.instance_cli;
        for step in ["reload", "build", "up -d"] {
            git.session().run(&format!("{cli} {step}")).await?;
        }
        info!(branch = %branch.name, "instance built");
        self.states.recompute(&branch.id).await?;
        Ok(())
    }

    /// Stop the instances of branches idle for longer than the configured hours.
    #[instrument(skip(self))]
    pub async fn shutdown_idle(&self, repo_id: &RepoId) -> Result<Vec<String>> {
        let store = &self.ctx.store;
        let repo = store.get_repository(repo_id).await?;
        let machine = self.ctx.machine(&repo.machine_id).await?;
        let limit = Duration::hours(self.ctx.config.worker.branch_idle_hours);
        let now = Utc::now();

        let mut stopped = Vec::new();
        for branch in store.list_branches(repo_id).await? {
            if !branch.build_attempted || branch.idle_for(now) < limit {
                continue;
            }
            let session = self.instance_session(&machine, &repo, &branch);
            if !session.exists(session.cwd()).await? {
                continue;
            }
            let cli = &self.ctx.config.tests.instance_cli;
            session.run(&format!("{cli} down")).await?;
            info!(branch = %branch.name, "stopped idle instance");
            stopped.push(branch.name);
        }
        Ok(stopped)
    }
}
