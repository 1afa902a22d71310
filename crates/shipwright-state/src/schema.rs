//! Record types persisted by the store.
//!
//! Records are read and written whole. Status fields are the only parts of
//! a `Commit` that change after it is first observed.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random id
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

record_id!(
    /// Identifier of a build/deploy host
    MachineId
);
record_id!(
    /// Identifier of a watched repository
    RepoId
);
record_id!(
    /// Identifier of a branch; unique per (repository, name)
    BranchId
);
record_id!(
    /// Identifier of a release target
    ReleaseId
);
record_id!(
    /// Identifier of one release attempt
    ReleaseItemId
);
record_id!(
    /// Identifier of a test run
    TestRunId
);
record_id!(
    /// Identifier of a single test run line
    TestRunLineId
);

// ---------------------------------------------------------------------------
// Machines & repositories
// ---------------------------------------------------------------------------

/// How commands reach a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// `ssh` with key based auth, `scp` as copy channel
    #[default]
    Ssh,
    /// `bash` on the orchestrator host itself, `cp` as copy channel
    Local,
}

/// A host that builds branches, runs tests or receives deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub host: String,
    pub ssh_user: String,
    /// Path of the private key on the orchestrator host
    pub ssh_key: Option<String>,
    pub transport: TransportKind,
    /// Root directory for mirrors, branch checkouts and release sources
    pub workspace_root: String,
    /// Image registry used by deployments, if any
    pub registry: Option<String>,
    pub active: bool,
}

impl Machine {
    pub fn new(name: impl Into<String>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: MachineId::new(),
            name: name.into(),
            host: host.into(),
            ssh_user: user.into(),
            ssh_key: None,
            transport: TransportKind::Ssh,
            workspace_root: "/opt/shipwright".to_string(),
            registry: None,
            active: true,
        }
    }

    /// A machine that runs everything on the local host below `root`.
    pub fn local(name: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Local,
            workspace_root: root.into(),
            ..Self::new(name, "localhost", "")
        }
    }
}

/// A watched source repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepoId,
    pub name: String,
    pub url: String,
    pub default_branch: String,
    pub machine_id: MachineId,
    /// Mirror checkout on the machine, used for fetching and release merges
    pub mirror_path: String,
    pub active: bool,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        machine_id: MachineId,
        mirror_path: impl Into<String>,
    ) -> Self {
        Self {
            id: RepoId::new(),
            name: name.into(),
            url: url.into(),
            default_branch: "main".to_string(),
            machine_id,
            mirror_path: mirror_path.into(),
            active: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    #[default]
    None,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    Check,
    Approved,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Check,
    Approved,
    Declined,
    #[default]
    None,
}

/// A commit observed in a fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub repo_id: RepoId,
    pub author: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub branch_ids: BTreeSet<BranchId>,
    pub test_state: TestState,
    pub approval_state: ApprovalState,
    pub code_review_state: ReviewState,
    pub force_approved: bool,
}

impl Commit {
    pub fn new(
        sha: impl Into<String>,
        repo_id: RepoId,
        author: impl Into<String>,
        date: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sha: sha.into(),
            repo_id,
            author: author.into(),
            date,
            message: message.into(),
            branch_ids: BTreeSet::new(),
            test_state: TestState::None,
            approval_state: ApprovalState::Check,
            code_review_state: ReviewState::None,
            force_approved: false,
        }
    }

    /// Approved and either force-approved or test-succeeded.
    pub fn is_releasable(&self) -> bool {
        self.approval_state == ApprovalState::Approved
            && (self.force_approved || self.test_state == TestState::Success)
    }

    pub fn short(&self) -> &str {
        &self.sha[..8.min(self.sha.len())]
    }
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

/// Lifecycle state of a branch, derived from its latest commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    #[default]
    New,
    Dev,
    Approve,
    ReviewCode,
    Testable,
    Tested,
    Candidate,
    MergeConflict,
    Done,
    Blocked,
}

impl BranchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchState::New => "new",
            BranchState::Dev => "dev",
            BranchState::Approve => "approve",
            BranchState::ReviewCode => "review_code",
            BranchState::Testable => "testable",
            BranchState::Tested => "tested",
            BranchState::Candidate => "candidate",
            BranchState::MergeConflict => "merge_conflict",
            BranchState::Done => "done",
            BranchState::Blocked => "blocked",
        }
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A branch of a repository. Identity is (repository, name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub repo_id: RepoId,
    pub name: String,
    pub active: bool,
    pub latest_commit: Option<String>,
    pub state: BranchState,
    pub block_release: bool,
    pub run_unittests: bool,
    pub run_robottests: bool,
    pub simulate_migration: bool,
    /// Dump restored before a migration simulation
    pub migration_dump: Option<String>,
    /// Every commit ever seen on the branch, oldest first
    pub commit_shas: Vec<String>,
    pub build_attempted: bool,
    pub last_access: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(repo_id: RepoId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: BranchId::new(),
            repo_id,
            name: name.into(),
            active: true,
            latest_commit: None,
            state: BranchState::New,
            block_release: false,
            run_unittests: true,
            run_robottests: false,
            simulate_migration: false,
            migration_dump: None,
            commit_shas: Vec::new(),
            build_attempted: false,
            last_access: now,
            created_at: now,
        }
    }

    /// Whether any test category is enabled.
    pub fn any_testing(&self) -> bool {
        self.run_unittests || self.run_robottests || self.simulate_migration
    }

    /// Name of the ephemeral instance built for this branch.
    pub fn instance_name(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }

    /// Record a commit on this branch; keeps insertion order, ignores repeats.
    pub fn add_commit(&mut self, sha: &str) {
        if !self.commit_shas.iter().any(|s| s == sha) {
            self.commit_shas.push(sha.to_string());
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_access
    }
}

// ---------------------------------------------------------------------------
// Releases
// ---------------------------------------------------------------------------

/// One step of the per-machine deploy action set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "command")]
pub enum DeployStep {
    UploadSettings,
    BuildImages,
    PushImages,
    TransferSource,
    Stop,
    Update,
    /// Runs in the finally phase
    Start,
    /// Runs in the finally phase
    PostHook(String),
}

impl DeployStep {
    /// Steps that always run after the mandatory ones, even on failure.
    pub fn is_finally(&self) -> bool {
        matches!(self, DeployStep::Start | DeployStep::PostHook(_))
    }

    pub fn default_set() -> Vec<DeployStep> {
        vec![
            DeployStep::UploadSettings,
            DeployStep::TransferSource,
            DeployStep::Stop,
            DeployStep::Update,
            DeployStep::Start,
        ]
    }
}

const FORBIDDEN_PROJECT_CHARS: &str = " !?#/\\+:,";

/// A deployment target bound to one repository and one stable branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub name: String,
    pub project_name: String,
    pub repo_id: RepoId,
    pub stable_branch: String,
    pub candidate_branch: String,
    pub active: bool,
    pub auto_release: bool,
    pub countdown_minutes: i64,
    pub minutes_to_release: i64,
    pub version_prefix: String,
    pub next_sequence: u64,
    pub machine_ids: Vec<MachineId>,
    pub deploy_git: bool,
    pub common_settings: Option<String>,
    pub actions: Vec<DeployStep>,
}

impl Release {
    pub fn new(
        name: impl Into<String>,
        project_name: impl Into<String>,
        repo_id: RepoId,
        stable_branch: impl Into<String>,
        candidate_branch: impl Into<String>,
    ) -> Self {
        Self {
            id: ReleaseId::new(),
            name: name.into(),
            project_name: project_name.into(),
            repo_id,
            stable_branch: stable_branch.into(),
            candidate_branch: candidate_branch.into(),
            active: true,
            auto_release: true,
            countdown_minutes: 0,
            minutes_to_release: 120,
            version_prefix: "v".to_string(),
            next_sequence: 1,
            machine_ids: Vec::new(),
            deploy_git: false,
            common_settings: None,
            actions: DeployStep::default_set(),
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.project_name.is_empty()
            || self
                .project_name
                .chars()
                .any(|c| FORBIDDEN_PROJECT_CHARS.contains(c))
        {
            return Err(StorageError::Invariant(format!(
                "invalid project name: {:?}",
                self.project_name
            )));
        }
        if let Some(settings) = &self.common_settings {
            if settings.contains("PROJECT_NAME=") {
                return Err(StorageError::Invariant(
                    "common settings may not set PROJECT_NAME; it comes from the release"
                        .to_string(),
                ));
            }
        }
        if self.stable_branch == self.candidate_branch {
            return Err(StorageError::Invariant(
                "stable and candidate branch must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Take the next version name from the sequence.
    pub fn next_version(&mut self) -> (u64, String) {
        let number = self.next_sequence;
        self.next_sequence += 1;
        (number, format!("{}{}", self.version_prefix, number))
    }

    /// Whether `name` is the stable or candidate branch of this release.
    pub fn is_own_branch(&self, name: &str) -> bool {
        name == self.stable_branch || name == self.candidate_branch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    #[default]
    Standard,
    Hotfix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[default]
    New,
    Done,
    Failed,
    Ignore,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemState::New => "new",
            ItemState::Done => "done",
            ItemState::Failed => "failed",
            ItemState::Ignore => "ignore",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemBranchState {
    Candidate,
    Merged,
    Conflict,
}

/// Console output of a failed merge attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub output: String,
    /// Branch names merged successfully before this one
    pub merged_before: Vec<String>,
}

/// Join row between a release item and a branch it tried to merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseItemBranch {
    pub branch_id: BranchId,
    pub commit_sha: String,
    pub state: ItemBranchState,
    pub conflict: Option<MergeConflict>,
}

/// One attempt to ship a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseItem {
    pub id: ReleaseItemId,
    pub release_id: ReleaseId,
    /// Position in the release's version sequence
    pub number: u64,
    pub name: String,
    pub release_type: ReleaseType,
    pub state: ItemState,
    pub planned_date: DateTime<Utc>,
    pub done_date: Option<DateTime<Utc>>,
    pub final_curtain: Option<DateTime<Utc>>,
    pub changed_lines: u64,
    pub log_release: Option<String>,
    pub commit_ids: BTreeSet<String>,
    /// Branches the item intends to merge, in insertion order
    pub branch_ids: Vec<BranchId>,
    /// Outcome of the last candidate recreation
    pub branches: Vec<ReleaseItemBranch>,
    pub try_counter: u32,
    /// Marker commit holding all merged commits
    pub commit_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReleaseItem {
    /// Create an item taking its name from the release's version sequence.
    pub fn new(release: &mut Release, release_type: ReleaseType) -> Self {
        let (number, name) = release.next_version();
        let now = Utc::now();
        Self {
            id: ReleaseItemId::new(),
            release_id: release.id.clone(),
            number,
            name,
            release_type,
            state: ItemState::New,
            planned_date: now,
            done_date: None,
            final_curtain: None,
            changed_lines: 0,
            log_release: None,
            commit_ids: BTreeSet::new(),
            branch_ids: Vec::new(),
            branches: Vec::new(),
            try_counter: 0,
            commit_id: None,
            created_at: now,
        }
    }

    /// New or failed: not finished yet.
    pub fn is_open(&self) -> bool {
        matches!(self.state, ItemState::New | ItemState::Failed)
    }

    pub fn add_branch(&mut self, id: &BranchId) {
        if !self.branch_ids.contains(id) {
            self.branch_ids.push(id.clone());
        }
    }

    pub fn merge_row(&self, branch: &BranchId) -> Option<&ReleaseItemBranch> {
        self.branches.iter().find(|b| &b.branch_id == branch)
    }
}

/// Reject `item` if another `new` standard item exists for the same release.
///
/// Hotfix items are exempt.
pub fn check_single_new_standard(item: &ReleaseItem, siblings: &[ReleaseItem]) -> StorageResult<()> {
    if item.release_type != ReleaseType::Standard || item.state != ItemState::New {
        return Ok(());
    }
    let clash = siblings.iter().any(|other| {
        other.id != item.id
            && other.release_id == item.release_id
            && other.release_type == ReleaseType::Standard
            && other.state == ItemState::New
    });
    if clash {
        return Err(StorageError::Invariant(format!(
            "release {} already has a new standard item",
            item.release_id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Test runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Open,
    Success,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Open => "open",
            RunState::Success => "success",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One execution of the test suites for a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: TestRunId,
    pub repo_id: RepoId,
    pub branch_id: BranchId,
    pub commit_sha: String,
    pub state: RunState,
    pub success_rate: u8,
    pub started: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub abort_requested: bool,
    pub log: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TestRun {
    pub fn new(repo_id: RepoId, branch_id: BranchId, commit_sha: impl Into<String>) -> Self {
        Self {
            id: TestRunId::new(),
            repo_id,
            branch_id,
            commit_sha: commit_sha.into(),
            state: RunState::Open,
            success_rate: 0,
            started: None,
            duration_secs: 0.0,
            abort_requested: false,
            log: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Preparation,
    Unittest,
    Robottest,
    Migration,
    EmptyDb,
    /// Informational, never affects the run state
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineState {
    #[default]
    Open,
    Running,
    Success,
    Failed,
}

/// Timing figures reported by a robot test at one parallelism level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStats {
    pub avg_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
}

/// One test item of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunLine {
    pub id: TestRunLineId,
    pub run_id: TestRunId,
    pub repo_id: RepoId,
    /// Position within the run
    pub seq: u32,
    pub kind: LineKind,
    pub name: String,
    /// Stable key used by the unit test cache
    pub unique_name: Option<String>,
    pub hash: Option<String>,
    pub state: LineState,
    pub try_count: u32,
    pub exc_info: Option<String>,
    pub duration_secs: f64,
    pub force_success: bool,
    pub started: Option<DateTime<Utc>>,
    pub log_ref: Option<String>,
    pub parallelism: Option<u32>,
    pub robot_stats: Option<RobotStats>,
}

impl TestRunLine {
    pub fn new(run: &TestRun, seq: u32, kind: LineKind, name: impl Into<String>) -> Self {
        Self {
            id: TestRunLineId::new(),
            run_id: run.id.clone(),
            repo_id: run.repo_id.clone(),
            seq,
            kind,
            name: name.into(),
            unique_name: None,
            hash: None,
            state: LineState::Open,
            try_count: 0,
            exc_info: None,
            duration_secs: 0.0,
            force_success: false,
            started: None,
            log_ref: None,
            parallelism: None,
            robot_stats: None,
        }
    }

    /// Succeeded or overridden by an operator.
    pub fn is_success(&self) -> bool {
        self.force_success || self.state == LineState::Success
    }

    pub fn is_failure(&self) -> bool {
        !self.force_success && self.state == LineState::Failed
    }

    pub fn counts_for_state(&self) -> bool {
        self.kind != LineKind::Log
    }
}

// ---------------------------------------------------------------------------
// Coordination between processes
// ---------------------------------------------------------------------------

/// An advisory lock held by one process until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    /// Process-wide identity of the lock table that took the lease
    pub holder: String,
    /// Identity of this acquisition; only it may release the lease
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Pending and running jobs occupy their identity key.
    pub fn is_live(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// A queued unit of work. The payload is opaque to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub identity_key: String,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release() -> Release {
        Release::new("prod", "shop", RepoId::new(), "main", "main_candidate")
    }

    #[test]
    fn project_name_rejects_special_chars() {
        let mut r = release();
        assert!(r.validate().is_ok());
        for bad in ["my shop", "a/b", "x:y", "q?", "c,d"] {
            r.project_name = bad.to_string();
            assert!(r.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn common_settings_may_not_set_project_name() {
        let mut r = release();
        r.common_settings = Some("DBNAME=x\nPROJECT_NAME=y".to_string());
        assert!(matches!(r.validate(), Err(StorageError::Invariant(_))));
    }

    #[test]
    fn items_take_names_from_sequence() {
        let mut r = release();
        let a = ReleaseItem::new(&mut r, ReleaseType::Standard);
        let b = ReleaseItem::new(&mut r, ReleaseType::Hotfix);
        assert_eq!(a.name, "v1");
        assert_eq!(b.name, "v2");
        assert_eq!(r.next_sequence, 3);
    }

    #[test]
    fn second_new_standard_item_is_rejected() {
        let mut r = release();
        let first = ReleaseItem::new(&mut r, ReleaseType::Standard);
        let second = ReleaseItem::new(&mut r, ReleaseType::Standard);
        let hotfix = ReleaseItem::new(&mut r, ReleaseType::Hotfix);

        let siblings = vec![first.clone()];
        assert!(check_single_new_standard(&second, &siblings).is_err());
        assert!(check_single_new_standard(&hotfix, &siblings).is_ok());
        // Updating the same item is not a clash.
        assert!(check_single_new_standard(&first, &siblings).is_ok());

        let mut done = first;
        done.state = ItemState::Done;
        assert!(check_single_new_standard(&second, &[done]).is_ok());
    }

    #[test]
    fn branch_commits_keep_insertion_order() {
        let mut b = Branch::new(RepoId::new(), "feature/Login-Form");
        b.add_commit("aaa");
        b.add_commit("bbb");
        b.add_commit("aaa");
        assert_eq!(b.commit_shas, vec!["aaa", "bbb"]);
        assert_eq!(b.instance_name(), "feature_login_form");
    }

    #[test]
    fn branch_state_serializes_snake_case() {
        let json = serde_json::to_string(&BranchState::MergeConflict).unwrap();
        assert_eq!(json, "\"merge_conflict\"");
        assert_eq!(BranchState::ReviewCode.to_string(), "review_code");
    }

    #[test]
    fn forced_line_counts_as_success() {
        let run = TestRun::new(RepoId::new(), BranchId::new(), "abc");
        let mut line = TestRunLine::new(&run, 0, LineKind::Unittest, "t");
        line.state = LineState::Failed;
        assert!(line.is_failure());
        line.force_success = true;
        assert!(line.is_success());
        assert!(!line.is_failure());
    }
}
