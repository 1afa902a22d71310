//! Release assembly.
//!
//! - [`ReleaseAssembler::schedule`]: keep one `new` standard item per release
//! - [`ReleaseAssembler::collect_tested_branches`]: pick qualifying branches
//! - [`ReleaseAssembler::recreate_candidate`]: rebuild the candidate branch
//! - [`ReleaseAssembler::do_release`]: merge into stable and deploy
//!
//! [`ReleaseAssembler::heartbeat`] drives all of them for one release.

mod candidate;
mod deploy;
mod ship;

use chrono::{DateTime, Duration, Utc};
use shipwright_state::{
    BranchId, ItemState, ReleaseId, ReleaseItem, ReleaseItemId, ReleaseType,
};
use tracing::{debug, info, instrument};

use crate::branch_state::BranchStateMachine;
use crate::context::Context;
use crate::error::{Result, ShipwrightError};
use crate::queue::JobPayload;

pub use deploy::{DeployRequest, Deployer};

/// Result of a candidate recreation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Same commits as the last recreation; nothing merged
    Unchanged,
    /// Same commits as the preceding item; its marker commit was taken over
    Reused { commit: String },
    Recreated {
        commit: String,
        conflicts: Vec<BranchId>,
    },
}

/// Result of one release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Preconditions not met yet; nothing changed
    Skipped(String),
    Done { changed_lines: u64 },
    Failed { reason: String },
}

/// What a heartbeat did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub item: Option<ReleaseItemId>,
    pub recreated: Vec<ReleaseItemId>,
    pub release_queued: Vec<ReleaseItemId>,
}

#[derive(Debug, Clone)]
pub struct ReleaseAssembler {
    ctx: Context,
    states: BranchStateMachine,
    deployer: Deployer,
}

impl ReleaseAssembler {
    pub fn new(ctx: Context) -> Self {
        Self {
            states: BranchStateMachine::new(ctx.clone()),
            deployer: Deployer::new(ctx.clone()),
            ctx,
        }
    }

    /// Create the `new` standard item if missing, else refresh its cutoff.
    ///
    /// Returns `None` for inactive releases and releases without
    /// automatic scheduling.
    #[instrument(skip(self))]
    pub async fn schedule(
        &self,
        release_id: &ReleaseId,
        now: DateTime<Utc>,
    ) -> Result<Option<ReleaseItem>> {
        let store = &self.ctx.store;
        let mut release = store.get_release(release_id).await?;
        if !release.active || !release.auto_release {
            return Ok(None);
        }
        let curtain = now + Duration::minutes(release.countdown_minutes);

        let items = store.items_of_release(release_id).await?;
        if let Some(mut item) = items
            .into_iter()
            .find(|i| i.release_type == ReleaseType::Standard && i.state == ItemState::New)
        {
            debug!(item = %item.name, "refreshing final curtain");
            item.final_curtain = Some(curtain);
            store.save_item(&item).await?;
            return Ok(Some(item));
        }

        let mut item = ReleaseItem::new(&mut release, ReleaseType::Standard);
        item.final_curtain = Some(curtain);
        item.planned_date = now + Duration::minutes(release.minutes_to_release);
        store.save_item(&item).await?;
        store.save_release(&release).await?;
        info!(release = %release.name, item = %item.name, "scheduled new release item");
        Ok(Some(item))
    }

    /// Periodic driver for one release.
    #[instrument(skip(self))]
    pub async fn heartbeat(
        &self,
        release_id: &ReleaseId,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatReport> {
        let mut report = HeartbeatReport::default();
        let release = self.ctx.store.get_release(release_id).await?;
        if !release.active {
            return Ok(report);
        }
        report.item = self.schedule(release_id, now).await?.map(|i| i.id);

        let items = self.ctx.store.items_of_release(release_id).await?;
        for item in items.iter().filter(|i| i.state == ItemState::New) {
            if item.release_type == ReleaseType::Standard {
                self.collect_tested_branches(&item.id).await?;
            }
            if self.recreate_candidate(&item.id).await? != CandidateOutcome::Unchanged {
                report.recreated.push(item.id.clone());
            }

            let due = match item.release_type {
                ReleaseType::Standard => release.auto_release && item.planned_date <= now,
                ReleaseType::Hotfix => true,
            };
            if due {
                self.ctx
                    .queue
                    .enqueue(
                        JobPayload::DoRelease {
                            release_id: release_id.clone(),
                            item_id: item.id.clone(),
                        },
                        None,
                    )
                    .await?;
                report.release_queued.push(item.id.clone());
            }
        }
        Ok(report)
    }

    /// Hotfix item for explicit branches.
    pub async fn make_hotfix(
        &self,
        release_id: &ReleaseId,
        branches: &[BranchId],
    ) -> Result<ReleaseItem> {
        if branches.is_empty() {
            return Err(ShipwrightError::Validation(
                "hotfix requires explicit branches".into(),
            ));
        }
        let store = &self.ctx.store;
        let mut release = store.get_release(release_id).await?;
        let unfinished = store
            .items_of_release(release_id)
            .await?
            .into_iter()
            .any(|i| i.release_type == ReleaseType::Hotfix && i.state == ItemState::New);
        if unfinished {
            return Err(ShipwrightError::Validation(
                "hotfix already exists; finish it first".into(),
            ));
        }

        let mut item = ReleaseItem::new(&mut release, ReleaseType::Hotfix);
        let now = Utc::now();
        item.final_curtain = Some(now);
        item.planned_date = now;
        for id in branches {
            item.add_branch(id);
        }
        store.save_item(&item).await?;
        store.save_release(&release).await?;
        self.ctx
            .queue
            .enqueue(
                JobPayload::RecreateCandidate {
                    release_id: release_id.clone(),
                    item_id: item.id.clone(),
                },
                None,
            )
            .await?;
        info!(release = %release.name, item = %item.name, "hotfix created");
        Ok(item)
    }

    pub async fn set_to_ignore(&self, item_id: &ReleaseItemId) -> Result<ReleaseItem> {
        let mut item = self.ctx.store.get_item(item_id).await?;
        if !item.is_open() {
            return Err(ShipwrightError::Validation(format!(
                "cannot ignore item {} in state {}",
                item.name, item.state
            )));
        }
        item.state = ItemState::Ignore;
        self.ctx.store.save_item(&item).await?;
        self.states.recompute_many(item.branch_ids.iter()).await?;
        Ok(item)
    }

    /// Put an ignored item back to `new`.
    pub async fn reschedule(&self, item_id: &ReleaseItemId) -> Result<ReleaseItem> {
        let mut item = self.ctx.store.get_item(item_id).await?;
        if item.state != ItemState::Ignore {
            return Err(ShipwrightError::Validation(format!(
                "cannot reschedule item {} in state {}",
                item.name, item.state
            )));
        }
        item.state = ItemState::New;
        self.ctx.store.save_item(&item).await?;
        self.states.recompute_many(item.branch_ids.iter()).await?;
        Ok(item)
    }
}
