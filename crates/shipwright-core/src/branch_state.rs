//! Branch lifecycle state.
//!
//! The state is a pure function of [`BranchStateInputs`], evaluated as an
//! ordered rule table where the first matching rule wins. The
//! [`BranchStateMachine`] gathers the inputs from the record store, saves the
//! result and queues a ticket notification when the state changed.

use std::collections::BTreeSet;

use shipwright_state::{
    ApprovalState, Branch, BranchId, BranchState, Commit, ItemBranchState, ItemState,
    ReviewState, TestState,
};
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::error::Result;
use crate::queue::JobPayload;

/// How the latest commit relates to one release item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Membership {
    /// The commit failed to merge in an open item
    Conflict,
    /// The commit shipped with a done item
    Done,
    /// The commit is merged into an open item
    Open,
}

/// Status flags of the latest commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitFlags {
    pub approval: ApprovalState,
    pub review: ReviewState,
    pub test: TestState,
    pub force_approved: bool,
}

impl From<&Commit> for CommitFlags {
    fn from(c: &Commit) -> Self {
        Self {
            approval: c.approval_state,
            review: c.code_review_state,
            test: c.test_state,
            force_approved: c.force_approved,
        }
    }
}

/// Everything the branch state depends on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BranchStateInputs {
    pub build_attempted: bool,
    pub latest: Option<CommitFlags>,
    pub any_testing: bool,
    pub block_release: bool,
    pub memberships: BTreeSet<Membership>,
}

type Rule = fn(&BranchStateInputs, &CommitFlags) -> Option<BranchState>;

fn rule_approve(_: &BranchStateInputs, c: &CommitFlags) -> Option<BranchState> {
    (c.approval == ApprovalState::Check).then_some(BranchState::Approve)
}

fn rule_review_code(_: &BranchStateInputs, c: &CommitFlags) -> Option<BranchState> {
    (c.approval == ApprovalState::Approved
        && matches!(c.review, ReviewState::Check | ReviewState::None)
        && !c.force_approved)
        .then_some(BranchState::ReviewCode)
}

fn rule_testable(i: &BranchStateInputs, c: &CommitFlags) -> Option<BranchState> {
    (c.approval == ApprovalState::Approved
        && c.review == ReviewState::Approved
        && i.any_testing
        && c.test == TestState::None
        && !c.force_approved)
        .then_some(BranchState::Testable)
}

fn rule_dev(_: &BranchStateInputs, c: &CommitFlags) -> Option<BranchState> {
    let declined = c.approval == ApprovalState::Declined
        || (c.review == ReviewState::Declined && !c.force_approved);
    let failed = c.test == TestState::Failed && !c.force_approved;
    (declined || failed).then_some(BranchState::Dev)
}

fn rule_blocked(i: &BranchStateInputs, _: &CommitFlags) -> Option<BranchState> {
    i.block_release.then_some(BranchState::Blocked)
}

fn rule_release(i: &BranchStateInputs, c: &CommitFlags) -> Option<BranchState> {
    let tested = c.test == TestState::Success || !i.any_testing || c.force_approved;
    if !(tested && c.approval == ApprovalState::Approved) {
        return None;
    }
    let state = if i.memberships.contains(&Membership::Conflict) {
        BranchState::MergeConflict
    } else if i.memberships.contains(&Membership::Done) {
        BranchState::Done
    } else if i.memberships.contains(&Membership::Open) {
        BranchState::Candidate
    } else {
        BranchState::Tested
    };
    Some(state)
}

const RULES: &[Rule] = &[
    rule_approve,
    rule_review_code,
    rule_testable,
    rule_dev,
    rule_blocked,
    rule_release,
];

/// Derive the state of a branch.
pub fn derive_state(inputs: &BranchStateInputs) -> BranchState {
    let Some(commit) = inputs.latest.as_ref() else {
        return if inputs.build_attempted {
            BranchState::Dev
        } else {
            BranchState::New
        };
    };
    RULES
        .iter()
        .find_map(|rule| rule(inputs, commit))
        .unwrap_or(BranchState::Dev)
}

/// Recomputes and stores branch states.
#[derive(Debug, Clone)]
pub struct BranchStateMachine {
    ctx: Context,
}

impl BranchStateMachine {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Collect the inputs for `branch` from the record store.
    pub async fn inputs(&self, branch: &Branch) -> Result<BranchStateInputs> {
        let store = &self.ctx.store;
        let latest = match &branch.latest_commit {
            Some(sha) => store.get_commit(sha).await?,
            None => None,
        };

        let mut memberships = BTreeSet::new();
        if let Some(commit) = &latest {
            for release in store.list_releases().await? {
                if release.repo_id != branch.repo_id {
                    continue;
                }
                for item in store.items_of_release(&release.id).await? {
                    if let Some(m) = membership(&item, &branch.id, &commit.sha) {
                        memberships.insert(m);
                    }
                }
            }
        }

        Ok(BranchStateInputs {
            build_attempted: branch.build_attempted,
            latest: latest.as_ref().map(CommitFlags::from),
            any_testing: branch.any_testing(),
            block_release: branch.block_release,
            memberships,
        })
    }

    /// Recompute and persist the state of one branch.
    ///
    /// A change queues a `NotifyState` job; queue failures are logged only.
    #[instrument(skip(self))]
    pub async fn recompute(&self, branch_id: &BranchId) -> Result<BranchState> {
        let mut branch = self.ctx.store.get_branch(branch_id).await?;
        let state = derive_state(&self.inputs(&branch).await?);
        if state == branch.state {
            debug!(branch = %branch.name, state = %state, "branch state unchanged");
            return Ok(state);
        }

        info!(branch = %branch.name, from = %branch.state, to = %state, "branch state changed");
        branch.state = state;
        self.ctx.store.save_branch(&branch).await?;
        let notify = JobPayload::NotifyState {
            branch_id: branch.id.clone(),
            state,
        };
        if let Err(e) = self.ctx.queue.enqueue(notify, None).await {
            warn!(branch = %branch.name, error = %e, "could not queue state notification");
        }
        Ok(state)
    }

    pub async fn recompute_many<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a BranchId>,
    ) -> Result<()> {
        for id in ids {
            self.recompute(id).await?;
        }
        Ok(())
    }

    /// Recompute every branch containing `sha`.
    pub async fn recompute_for_commit(&self, sha: &str) -> Result<()> {
        if let Some(commit) = self.ctx.store.get_commit(sha).await? {
            self.recompute_many(commit.branch_ids.iter()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    async fn update_commit(&self, sha: &str, f: impl FnOnce(&mut Commit)) -> Result<Commit> {
        let mut commit = self
            .ctx
            .store
            .get_commit(sha)
            .await?
            .ok_or_else(|| shipwright_state::StorageError::not_found("commit", sha))?;
        f(&mut commit);
        self.ctx.store.save_commit(&commit).await?;
        self.recompute_many(commit.branch_ids.iter()).await?;
        Ok(commit)
    }

    pub async fn approve(&self, sha: &str) -> Result<Commit> {
        self.update_commit(sha, |c| c.approval_state = ApprovalState::Approved)
            .await
    }

    pub async fn decline(&self, sha: &str) -> Result<Commit> {
        self.update_commit(sha, |c| c.approval_state = ApprovalState::Declined)
            .await
    }

    /// Approve regardless of review and test outcome.
    pub async fn force_approve(&self, sha: &str) -> Result<Commit> {
        self.update_commit(sha, |c| {
            c.approval_state = ApprovalState::Approved;
            c.force_approved = true;
        })
        .await
    }

    pub async fn set_code_review(&self, sha: &str, review: ReviewState) -> Result<Commit> {
        self.update_commit(sha, |c| c.code_review_state = review)
            .await
    }

    pub async fn set_test_state(&self, sha: &str, test: TestState) -> Result<Commit> {
        self.update_commit(sha, |c| c.test_state = test).await
    }
}

fn membership(
    item: &shipwright_state::ReleaseItem,
    branch: &BranchId,
    sha: &str,
) -> Option<Membership> {
    let row = item.merge_row(branch).filter(|r| r.commit_sha == sha);
    match item.state {
        ItemState::Ignore => None,
        ItemState::Done => item.commit_ids.contains(sha).then_some(Membership::Done),
        ItemState::New | ItemState::Failed => match row.map(|r| r.state) {
            Some(ItemBranchState::Conflict) => Some(Membership::Conflict),
            Some(_) => Some(Membership::Open),
            None => item.commit_ids.contains(sha).then_some(Membership::Open),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(approval: ApprovalState, review: ReviewState, test: TestState) -> CommitFlags {
        CommitFlags {
            approval,
            review,
            test,
            force_approved: false,
        }
    }

    fn ready() -> BranchStateInputs {
        BranchStateInputs {
            build_attempted: true,
            latest: Some(flags(
                ApprovalState::Approved,
                ReviewState::Approved,
                TestState::Success,
            )),
            any_testing: true,
            block_release: false,
            memberships: BTreeSet::new(),
        }
    }

    #[test]
    fn no_commit_is_new_until_built() {
        let mut inputs = BranchStateInputs::default();
        assert_eq!(derive_state(&inputs), BranchState::New);
        inputs.build_attempted = true;
        assert_eq!(derive_state(&inputs), BranchState::Dev);
    }

    #[test]
    fn approval_then_review_then_tests() {
        let mut inputs = ready();
        inputs.latest = Some(flags(ApprovalState::Check, ReviewState::None, TestState::None));
        assert_eq!(derive_state(&inputs), BranchState::Approve);

        inputs.latest = Some(flags(ApprovalState::Approved, ReviewState::Check, TestState::None));
        assert_eq!(derive_state(&inputs), BranchState::ReviewCode);

        inputs.latest = Some(flags(ApprovalState::Approved, ReviewState::Approved, TestState::None));
        assert_eq!(derive_state(&inputs), BranchState::Testable);

        inputs.latest = Some(flags(ApprovalState::Approved, ReviewState::Approved, TestState::Failed));
        assert_eq!(derive_state(&inputs), BranchState::Dev);

        inputs.latest = Some(flags(ApprovalState::Declined, ReviewState::Approved, TestState::Success));
        assert_eq!(derive_state(&inputs), BranchState::Dev);

        assert_eq!(derive_state(&ready()), BranchState::Tested);
    }

    #[test]
    fn force_approval_skips_review_and_tests() {
        let mut inputs = ready();
        inputs.latest = Some(CommitFlags {
            approval: ApprovalState::Approved,
            review: ReviewState::None,
            test: TestState::Failed,
            force_approved: true,
        });
        assert_eq!(derive_state(&inputs), BranchState::Tested);
    }

    #[test]
    fn disabled_testing_counts_as_tested() {
        let mut inputs = ready();
        inputs.any_testing = false;
        inputs.latest = Some(flags(ApprovalState::Approved, ReviewState::Approved, TestState::None));
        assert_eq!(derive_state(&inputs), BranchState::Tested);
    }

    #[test]
    fn block_release_wins_over_release_states() {
        let mut inputs = ready();
        inputs.block_release = true;
        inputs.memberships.insert(Membership::Open);
        assert_eq!(derive_state(&inputs), BranchState::Blocked);
    }

    #[test]
    fn conflict_overrides_done_and_candidate() {
        let mut inputs = ready();
        inputs.memberships.insert(Membership::Open);
        assert_eq!(derive_state(&inputs), BranchState::Candidate);
        inputs.memberships.insert(Membership::Done);
        assert_eq!(derive_state(&inputs), BranchState::Done);
        inputs.memberships.insert(Membership::Conflict);
        assert_eq!(derive_state(&inputs), BranchState::MergeConflict);
    }

    #[test]
    fn derivation_is_idempotent() {
        let mut inputs = ready();
        inputs.memberships.insert(Membership::Done);
        let first = derive_state(&inputs);
        assert_eq!(derive_state(&inputs), first);
        assert_eq!(derive_state(&inputs.clone()), first);
    }
}
