//! Shipping a release item: merge into stable, tag, deploy.

use chrono::Utc;
use shipwright_state::{ItemState, ReleaseItem, ReleaseItemId, ReleaseType, TestState};
use tracing::{error, info, instrument};

use super::deploy::DeployRequest;
use super::{ReleaseAssembler, ReleaseOutcome};
use crate::error::{Result, ShipwrightError};
use crate::gitops::{remote_ref, MergeOutcome};
use crate::remote::LogSink;

impl ReleaseAssembler {
    /// Merge the item's marker commit into the stable branch and deploy it.
    ///
    /// Items without a tested marker commit are skipped. Failures other than
    /// transient ones mark the item `failed` with the captured log.
    #[instrument(skip(self))]
    pub async fn do_release(&self, item_id: &ReleaseItemId) -> Result<ReleaseOutcome> {
        let store = &self.ctx.store;
        let mut item = store.get_item(item_id).await?;
        let release = store.get_release(&item.release_id).await?;
        if !release.active {
            return Ok(ReleaseOutcome::Skipped("release is inactive".into()));
        }
        if !item.is_open() {
            return Err(ShipwrightError::Validation(format!(
                "item {} needs state new or failed, not {}",
                item.name, item.state
            )));
        }
        if item.release_type == ReleaseType::Hotfix && item.branch_ids.is_empty() {
            return Err(ShipwrightError::Validation(
                "hotfix requires explicit branches".into(),
            ));
        }
        let Some(marker) = item.commit_id.clone() else {
            return Ok(ReleaseOutcome::Skipped("no candidate commit yet".into()));
        };
        let tested = store
            .get_commit(&marker)
            .await?
            .map(|c| c.test_state == TestState::Success)
            .unwrap_or(false);
        if !tested {
            return Ok(ReleaseOutcome::Skipped(format!(
                "candidate commit {marker} is not tested yet"
            )));
        }

        let _release_lock = self
            .ctx
            .locks
            .try_acquire(format!("release_{}", release.id))
            .await?;
        item.try_counter += 1;
        store.save_item(&item).await?;

        let log = LogSink::new();
        let shipped = self.ship(&mut item, &marker, &log).await;
        let outcome = match shipped {
            Ok(()) => {
                self.on_done(&mut item, &log).await?;
                ReleaseOutcome::Done {
                    changed_lines: item.changed_lines,
                }
            }
            Err(e) if e.is_transient() => {
                item.log_release = Some(log.text());
                store.save_item(&item).await?;
                return Err(e);
            }
            Err(e) => {
                let reason = e.to_string();
                error!(item = %item.name, error = %reason, "release failed");
                log.push(format!("ERROR: {reason}"));
                item.state = ItemState::Failed;
                item.log_release = Some(log.text());
                store.save_item(&item).await?;
                self.comment_branches(
                    &item,
                    &format!("Deployment of version {} failed: {reason}", item.name),
                )
                .await;
                ReleaseOutcome::Failed { reason }
            }
        };
        self.states.recompute_many(item.branch_ids.iter()).await?;
        Ok(outcome)
    }

    async fn ship(&self, item: &mut ReleaseItem, marker: &str, log: &LogSink) -> Result<()> {
        let store = &self.ctx.store;
        let release = store.get_release(&item.release_id).await?;
        let repo = store.get_repository(&release.repo_id).await?;

        let candidate = store
            .find_branch(&repo.id, &release.candidate_branch)
            .await?
            .ok_or_else(|| {
                ShipwrightError::Validation(format!(
                    "candidate branch {} does not exist",
                    release.candidate_branch
                ))
            })?;
        if !candidate.active {
            return Err(ShipwrightError::Validation(format!(
                "candidate branch {} is not active",
                candidate.name
            )));
        }

        let machine = self.ctx.machine(&repo.machine_id).await?;
        let git = self.ctx.git(
            self.ctx
                .session(&machine, repo.mirror_path.clone())
                .with_log(log.clone()),
        );
        git.ensure_mirror(&repo.url).await?;
        let stable_sha = {
            let _guard = git.lock().await?;
            git.checkout_new(&release.stable_branch, &remote_ref(&release.stable_branch))
                .await?;
            let before = git.head_sha().await?;
            let message = format!("Release {} into {}", item.name, release.stable_branch);
            if let MergeOutcome::Conflict { output } = git.merge(marker, &message).await? {
                return Err(ShipwrightError::MergeConflict {
                    branch: release.stable_branch.clone(),
                    commit: marker.to_string(),
                    output,
                });
            }
            let after = git.head_sha().await?;
            item.changed_lines += git.count_changed_lines(&before, &after).await?;
            git.tag(&format!("release-{}", item.name), &after).await?;
            git.push(&release.stable_branch, false).await?;
            git.push_tags().await?;
            after
        };
        store.save_item(item).await?;

        if item.changed_lines == 0 {
            info!(item = %item.name, "nothing new to deploy");
            log.push("Nothing new to deploy");
            return Ok(());
        }

        self.deployer
            .deploy(&DeployRequest {
                release: &release,
                repo: &repo,
                sha: &stable_sha,
                log,
            })
            .await
    }

    async fn on_done(&self, item: &mut ReleaseItem, log: &LogSink) -> Result<()> {
        item.state = ItemState::Done;
        item.done_date = Some(Utc::now());
        item.log_release = Some(log.text());
        self.ctx.store.save_item(item).await?;
        info!(item = %item.name, changed_lines = item.changed_lines, "release done");
        self.comment_branches(
            item,
            &format!("Deployment of version {} succeeded", item.name),
        )
        .await;
        Ok(())
    }

    async fn comment_branches(&self, item: &ReleaseItem, text: &str) {
        for id in &item.branch_ids {
            if let Ok(branch) = self.ctx.store.get_branch(id).await {
                self.ctx.tickets.comment(&branch, text).await;
            }
        }
    }
}
