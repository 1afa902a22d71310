//! Release assembly against a local bare origin: candidate recreation,
//! conflicts, reuse and shipping into the stable branch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::Utc;
use shipwright_core::ticket::TicketRecord;
use shipwright_core::{
    BranchFetcher, BranchStateMachine, CandidateOutcome, Context, MemoryTaskQueue,
    OrchestratorConfig, RecordingTicketSystem, ReleaseAssembler, ReleaseOutcome,
};
use shipwright_state::fakes::MemoryRecordStore;
use shipwright_state::{
    Branch, BranchState, BranchStore, DeployStep, ItemBranchState, ItemState, Machine,
    MachineStore, Release, ReleaseItem, ReleaseStore, Repository, ReviewState, TestState,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test-user")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test-user")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn make_origin(root: &Path) -> PathBuf {
    let origin = root.join("origin.git");
    let seed = root.join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    run_git(root, &["init", "--bare", "-b", "main", origin.to_str().unwrap()]);
    run_git(&seed, &["init", "-b", "main"]);
    std::fs::write(seed.join("app.txt"), "one\ntwo\nthree\n").unwrap();
    run_git(&seed, &["add", "."]);
    run_git(&seed, &["commit", "-m", "initial"]);
    run_git(&seed, &["remote", "add", "origin", origin.to_str().unwrap()]);
    run_git(&seed, &["push", "origin", "main"]);
    origin
}

/// New branch from `main` writing `content` to `file`.
fn push_file(root: &Path, branch: &str, file: &str, content: &str) {
    let seed = root.join("seed");
    run_git(&seed, &["checkout", "-B", branch, "main"]);
    std::fs::write(seed.join(file), content).unwrap();
    run_git(&seed, &["add", file]);
    run_git(&seed, &["commit", "-m", &format!("change on {branch}")]);
    run_git(&seed, &["push", "-f", "origin", branch]);
    run_git(&seed, &["checkout", "main"]);
}

fn push_change(root: &Path, branch: &str, first_line: &str) {
    push_file(root, branch, "app.txt", &format!("{first_line}\ntwo\nthree\n"));
}

struct Harness {
    dir: tempfile::TempDir,
    origin: PathBuf,
    store: Arc<MemoryRecordStore>,
    tickets: Arc<RecordingTicketSystem>,
    ctx: Context,
    assembler: ReleaseAssembler,
    states: BranchStateMachine,
    machine: Machine,
    repo: Repository,
    release: Release,
}

impl Harness {
    async fn new(instance_cli: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let origin = make_origin(root);

        // Pre-cloned mirror carrying a committer identity for merges.
        let mirror = root.join("ws/mirror");
        std::fs::create_dir_all(root.join("ws")).unwrap();
        run_git(root, &["clone", origin.to_str().unwrap(), mirror.to_str().unwrap()]);
        run_git(&mirror, &["config", "user.name", "shipwright"]);
        run_git(&mirror, &["config", "user.email", "shipwright@example.com"]);

        let store = Arc::new(MemoryRecordStore::new());
        let tickets = Arc::new(RecordingTicketSystem::new());
        let machine = Machine::local("local", root.join("ws").to_str().unwrap());
        store.save_machine(&machine).await.unwrap();
        let repo = Repository::new(
            "shop",
            origin.to_str().unwrap(),
            machine.id.clone(),
            mirror.to_str().unwrap(),
        );
        store.save_repository(&repo).await.unwrap();
        let release = Release::new("shop-prod", "shop", repo.id.clone(), "main", "main_candidate");
        store.save_release(&release).await.unwrap();

        let mut config = OrchestratorConfig::default();
        config.tests.instance_cli = instance_cli.to_string();
        let ctx = Context::new(
            store.clone(),
            Arc::new(MemoryTaskQueue::new(3)),
            tickets.clone(),
            config,
        );

        Self {
            assembler: ReleaseAssembler::new(ctx.clone()),
            states: BranchStateMachine::new(ctx.clone()),
            dir,
            origin,
            store,
            tickets,
            ctx,
            machine,
            repo,
            release,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    async fn fetch(&self) {
        BranchFetcher::new(self.ctx.clone())
            .fetch_repository(&self.repo.id)
            .await
            .unwrap();
    }

    async fn branch(&self, name: &str) -> Branch {
        self.store
            .find_branch(&self.repo.id, name)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("branch {name} not recorded"))
    }

    /// Approve, review and test the head of `name`; returns it and its sha.
    async fn make_tested(&self, name: &str) -> (Branch, String) {
        let sha = self.branch(name).await.latest_commit.unwrap();
        self.states.approve(&sha).await.unwrap();
        self.states
            .set_code_review(&sha, ReviewState::Approved)
            .await
            .unwrap();
        self.states
            .set_test_state(&sha, TestState::Success)
            .await
            .unwrap();
        let branch = self.branch(name).await;
        assert_eq!(branch.state, BranchState::Tested);
        (branch, sha)
    }

    async fn new_item(&self) -> ReleaseItem {
        self.assembler
            .schedule(&self.release.id, Utc::now())
            .await
            .unwrap()
            .expect("active auto release schedules an item")
    }

    async fn item(&self, item: &ReleaseItem) -> ReleaseItem {
        self.store.get_item(&item.id).await.unwrap()
    }

    async fn mark_marker_tested(&self, item: &ReleaseItem) {
        let marker = self.item(item).await.commit_id.expect("marker commit");
        self.states
            .set_test_state(&marker, TestState::Success)
            .await
            .unwrap();
    }

    fn origin_show(&self, spec: &str) -> String {
        run_git(&self.origin, &["show", spec])
    }
}

// ---------------------------------------------------------------------------
// Candidate recreation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tested_branches_merge_into_candidate_and_ship() {
    let h = Harness::new("true").await;
    push_change(h.root(), "b1", "uno");
    push_file(h.root(), "b2", "extra.txt", "extra\n");
    h.fetch().await;
    let (b1, sha1) = h.make_tested("b1").await;
    let (_, sha2) = h.make_tested("b2").await;

    let item = h.new_item().await;
    assert!(h.assembler.collect_tested_branches(&item.id).await.unwrap());
    let outcome = h.assembler.recreate_candidate(&item.id).await.unwrap();
    let CandidateOutcome::Recreated { commit, conflicts } = outcome else {
        panic!("expected a recreation, got {outcome:?}");
    };
    assert!(conflicts.is_empty());

    let stored = h.item(&item).await;
    assert_eq!(stored.commit_ids, BTreeSet::from([sha1.clone(), sha2.clone()]));
    assert_eq!(stored.commit_id.as_deref(), Some(commit.as_str()));
    assert_eq!(h.branch("b1").await.state, BranchState::Candidate);
    assert!(h
        .origin_show("main_candidate:app.txt")
        .starts_with("uno"));
    assert!(h
        .origin_show("main_candidate")
        .contains("Includes latest commits from"));

    // same commits: nothing to merge
    assert_eq!(
        h.assembler.recreate_candidate(&item.id).await.unwrap(),
        CandidateOutcome::Unchanged
    );

    // the marker commit must be tested first
    assert!(matches!(
        h.assembler.do_release(&item.id).await.unwrap(),
        ReleaseOutcome::Skipped(_)
    ));

    h.mark_marker_tested(&item).await;
    let outcome = h.assembler.do_release(&item.id).await.unwrap();
    let ReleaseOutcome::Done { changed_lines } = outcome else {
        panic!("expected done, got {outcome:?}");
    };
    assert!(changed_lines > 0);

    let done = h.item(&item).await;
    assert_eq!(done.state, ItemState::Done);
    assert!(done.done_date.is_some());
    assert_eq!(done.try_counter, 1);
    assert!(h.origin_show("main:app.txt").starts_with("uno"));
    assert_eq!(h.origin_show("main:extra.txt"), "extra");
    assert!(run_git(&h.origin, &["tag", "-l"]).contains("release-v1"));

    assert_eq!(h.branch("b1").await.state, BranchState::Done);
    assert!(h.tickets.records().contains(&TicketRecord::Comment(
        b1.name.clone(),
        "Deployment of version v1 succeeded".to_string()
    )));
}

#[tokio::test]
async fn conflicting_branch_is_recorded_and_skipped() {
    let h = Harness::new("true").await;
    push_change(h.root(), "b1", "uno");
    push_change(h.root(), "b2", "eins");
    h.fetch().await;
    let (b1, sha1) = h.make_tested("b1").await;
    let (b2, _) = h.make_tested("b2").await;

    let mut item = h.new_item().await;
    item.add_branch(&b1.id);
    item.add_branch(&b2.id);
    h.store.save_item(&item).await.unwrap();

    let outcome = h.assembler.recreate_candidate(&item.id).await.unwrap();
    let CandidateOutcome::Recreated { conflicts, .. } = outcome else {
        panic!("expected a recreation, got {outcome:?}");
    };
    assert_eq!(conflicts, vec![b2.id.clone()]);

    let stored = h.item(&item).await;
    assert_eq!(stored.commit_ids, BTreeSet::from([sha1]));
    let row = stored.merge_row(&b2.id).unwrap();
    assert_eq!(row.state, ItemBranchState::Conflict);
    let conflict = row.conflict.as_ref().unwrap();
    assert!(conflict.output.contains("CONFLICT"));
    assert_eq!(conflict.merged_before, vec!["b1".to_string()]);

    assert_eq!(h.branch("b1").await.state, BranchState::Candidate);
    assert_eq!(h.branch("b2").await.state, BranchState::MergeConflict);
    assert!(h
        .origin_show("main_candidate:app.txt")
        .starts_with("uno"));
}

#[tokio::test]
async fn ignored_item_merge_is_reused_by_the_next_item() {
    let h = Harness::new("true").await;
    push_change(h.root(), "b1", "uno");
    h.fetch().await;
    let (b1, sha1) = h.make_tested("b1").await;

    let first = h.new_item().await;
    h.assembler.collect_tested_branches(&first.id).await.unwrap();
    let CandidateOutcome::Recreated { commit, .. } =
        h.assembler.recreate_candidate(&first.id).await.unwrap()
    else {
        panic!("expected a recreation");
    };

    h.assembler.set_to_ignore(&first.id).await.unwrap();
    assert_eq!(h.branch("b1").await.state, BranchState::Tested);

    let second = h.new_item().await;
    assert_ne!(second.id, first.id);
    assert_eq!(second.name, "v2");
    assert!(h.assembler.collect_tested_branches(&second.id).await.unwrap());
    assert_eq!(
        h.assembler.recreate_candidate(&second.id).await.unwrap(),
        CandidateOutcome::Reused {
            commit: commit.clone()
        }
    );

    let stored = h.item(&second).await;
    assert_eq!(stored.commit_id, Some(commit));
    assert_eq!(stored.commit_ids, BTreeSet::from([sha1]));
    assert_eq!(stored.branch_ids, vec![b1.id]);
}

#[tokio::test]
async fn empty_item_ships_without_changes() {
    let h = Harness::new("true").await;
    h.fetch().await;

    let item = h.new_item().await;
    assert!(!h.assembler.collect_tested_branches(&item.id).await.unwrap());
    let outcome = h.assembler.recreate_candidate(&item.id).await.unwrap();
    assert!(matches!(outcome, CandidateOutcome::Recreated { ref conflicts, .. } if conflicts.is_empty()));

    h.mark_marker_tested(&item).await;
    assert_eq!(
        h.assembler.do_release(&item.id).await.unwrap(),
        ReleaseOutcome::Done { changed_lines: 0 }
    );
    let done = h.item(&item).await;
    assert_eq!(done.state, ItemState::Done);
    assert!(done
        .log_release
        .unwrap_or_default()
        .contains("Nothing new to deploy"));
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_deploys_source_and_settings_to_machine() {
    let mut h = Harness::new("true").await;
    h.release.machine_ids = vec![h.machine.id.clone()];
    h.release.common_settings = Some("WORKERS=2".to_string());
    h.release.actions = vec![
        DeployStep::UploadSettings,
        DeployStep::TransferSource,
        DeployStep::Start,
        DeployStep::PostHook("test -f app.txt && touch deployed".to_string()),
    ];
    h.store.save_release(&h.release).await.unwrap();

    push_change(h.root(), "b1", "uno");
    h.fetch().await;
    h.make_tested("b1").await;
    let item = h.new_item().await;
    h.assembler.collect_tested_branches(&item.id).await.unwrap();
    h.assembler.recreate_candidate(&item.id).await.unwrap();
    h.mark_marker_tested(&item).await;

    let outcome = h.assembler.do_release(&item.id).await.unwrap();
    assert!(matches!(outcome, ReleaseOutcome::Done { .. }), "{outcome:?}");

    let source = h.root().join("ws/releases/shop");
    assert!(std::fs::read_to_string(source.join("app.txt"))
        .unwrap()
        .starts_with("uno"));
    assert!(source.join("deployed").exists());
    let settings = std::fs::read_to_string(h.root().join("ws/settings/shop")).unwrap();
    assert!(settings.contains("PROJECT_NAME=shop"));
    assert!(settings.contains("WORKERS=2"));
}

#[tokio::test]
async fn failed_deploy_marks_item_failed() {
    let mut h = Harness::new("false").await;
    h.release.machine_ids = vec![h.machine.id.clone()];
    h.release.actions = vec![DeployStep::UploadSettings, DeployStep::Stop, DeployStep::Start];
    h.store.save_release(&h.release).await.unwrap();

    push_change(h.root(), "b1", "uno");
    h.fetch().await;
    let (b1, _) = h.make_tested("b1").await;
    let item = h.new_item().await;
    h.assembler.collect_tested_branches(&item.id).await.unwrap();
    h.assembler.recreate_candidate(&item.id).await.unwrap();
    h.mark_marker_tested(&item).await;

    let outcome = h.assembler.do_release(&item.id).await.unwrap();
    assert!(matches!(outcome, ReleaseOutcome::Failed { .. }), "{outcome:?}");

    let failed = h.item(&item).await;
    assert_eq!(failed.state, ItemState::Failed);
    let log = failed.log_release.unwrap_or_default();
    assert!(log.contains("ERROR:"));
    assert!(log.contains("finally step Start failed"));
    assert!(h.tickets.records().iter().any(|r| matches!(
        r,
        TicketRecord::Comment(name, text)
            if name == &b1.name && text.starts_with("Deployment of version v1 failed")
    )));
}
