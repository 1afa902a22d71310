//! Trait contract tests for the record store.
//!
//! Each contract runs against both the in-memory fake and the SurrealDB
//! backend (in-memory engine). Any conforming implementation must pass these.

use chrono::{Duration, Utc};
use shipwright_state::fakes::MemoryRecordStore;
use shipwright_state::*;

async fn stores() -> Vec<(&'static str, Box<dyn RecordStore>)> {
    vec![
        ("memory", Box::new(MemoryRecordStore::new())),
        ("surreal", Box::new(SurrealRecordStore::in_memory().await.unwrap())),
    ]
}

// ===========================================================================
// Branches & commits
// ===========================================================================

#[tokio::test]
async fn branch_round_trip_and_lookup_by_name() {
    for (label, store) in stores().await {
        let repo = RepoId::new();
        let mut branch = Branch::new(repo.clone(), "feature-a");
        store.save_branch(&branch).await.unwrap();

        branch.state = BranchState::Tested;
        store.save_branch(&branch).await.unwrap();

        let loaded = store.get_branch(&branch.id).await.unwrap();
        assert_eq!(loaded.state, BranchState::Tested, "{label}");

        let found = store.find_branch(&repo, "feature-a").await.unwrap();
        assert_eq!(found.map(|b| b.id), Some(branch.id.clone()), "{label}");
        assert!(store.find_branch(&repo, "nope").await.unwrap().is_none());
        assert_eq!(store.list_branches(&repo).await.unwrap().len(), 1, "{label}");
    }
}

#[tokio::test]
async fn duplicate_branch_name_is_rejected() {
    for (label, store) in stores().await {
        let repo = RepoId::new();
        store.save_branch(&Branch::new(repo.clone(), "x")).await.unwrap();
        let err = store
            .save_branch(&Branch::new(repo.clone(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Invariant(_)), "{label}: {err}");
    }
}

#[tokio::test]
async fn missing_branch_is_not_found() {
    for (label, store) in stores().await {
        let err = store.get_branch(&BranchId::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }), "{label}");
    }
}

#[tokio::test]
async fn commits_of_branch_sorted_by_date() {
    for (label, store) in stores().await {
        let repo = RepoId::new();
        let branch = Branch::new(repo.clone(), "b");
        let now = Utc::now();

        let mut newer = Commit::new("bbbb", repo.clone(), "ann", now, "second");
        newer.branch_ids.insert(branch.id.clone());
        let mut older = Commit::new("aaaa", repo.clone(), "ann", now - Duration::hours(1), "first");
        older.branch_ids.insert(branch.id.clone());
        let unrelated = Commit::new("cccc", repo.clone(), "bob", now, "other");

        store.save_commit(&newer).await.unwrap();
        store.save_commit(&older).await.unwrap();
        store.save_commit(&unrelated).await.unwrap();

        let shas: Vec<String> = store
            .commits_of_branch(&branch.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.sha)
            .collect();
        assert_eq!(shas, vec!["aaaa", "bbbb"], "{label}");

        let mut approved = older.clone();
        approved.approval_state = ApprovalState::Approved;
        store.save_commit(&approved).await.unwrap();
        let loaded = store.get_commit("aaaa").await.unwrap().unwrap();
        assert_eq!(loaded.approval_state, ApprovalState::Approved, "{label}");
    }
}

// ===========================================================================
// Releases
// ===========================================================================

#[tokio::test]
async fn invalid_release_is_rejected() {
    for (label, store) in stores().await {
        let mut release = Release::new("prod", "bad name", RepoId::new(), "main", "cand");
        assert!(store.save_release(&release).await.is_err(), "{label}");
        release.project_name = "good_name".to_string();
        store.save_release(&release).await.unwrap();
        assert!(store.find_release("prod").await.unwrap().is_some(), "{label}");
    }
}

#[tokio::test]
async fn only_one_new_standard_item_per_release() {
    for (label, store) in stores().await {
        let mut release = Release::new("prod", "shop", RepoId::new(), "main", "cand");
        let first = ReleaseItem::new(&mut release, ReleaseType::Standard);
        let second = ReleaseItem::new(&mut release, ReleaseType::Standard);
        let hotfix = ReleaseItem::new(&mut release, ReleaseType::Hotfix);

        store.save_item(&first).await.unwrap();
        let err = store.save_item(&second).await.unwrap_err();
        assert!(matches!(err, StorageError::Invariant(_)), "{label}");
        store.save_item(&hotfix).await.unwrap();

        let mut done = first.clone();
        done.state = ItemState::Done;
        store.save_item(&done).await.unwrap();
        store.save_item(&second).await.unwrap();

        let names: Vec<String> = store
            .items_of_release(&release.id)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["v3", "v2", "v1"], "{label}");
    }
}

// ===========================================================================
// Test runs
// ===========================================================================

#[tokio::test]
async fn lines_ordered_and_cache_lookup() {
    for (label, store) in stores().await {
        let repo = RepoId::new();
        let run = TestRun::new(repo.clone(), BranchId::new(), "abc");
        store.save_run(&run).await.unwrap();

        let mut second = TestRunLine::new(&run, 1, LineKind::Unittest, "tests/test_b.py");
        second.unique_name = Some("mod_b/tests/test_b.py".to_string());
        second.hash = Some("h1".to_string());
        second.state = LineState::Success;
        let first = TestRunLine::new(&run, 0, LineKind::Preparation, "build");

        store.save_line(&second).await.unwrap();
        store.save_line(&first).await.unwrap();

        let names: Vec<String> = store
            .lines_of_run(&run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["build", "tests/test_b.py"], "{label}");

        let hit = store
            .find_succeeded_line(&repo, "mod_b/tests/test_b.py", "h1")
            .await
            .unwrap();
        assert!(hit.is_some(), "{label}");
        let miss = store
            .find_succeeded_line(&repo, "mod_b/tests/test_b.py", "h2")
            .await
            .unwrap();
        assert!(miss.is_none(), "{label}");
        let other_repo = store
            .find_succeeded_line(&RepoId::new(), "mod_b/tests/test_b.py", "h1")
            .await
            .unwrap();
        assert!(other_repo.is_none(), "{label}");

        assert_eq!(store.runs_of_commit("abc").await.unwrap().len(), 1, "{label}");
    }
}

#[tokio::test]
async fn machines_and_repositories_round_trip() {
    for (label, store) in stores().await {
        let machine = Machine::local("builder", "/tmp/sw");
        store.save_machine(&machine).await.unwrap();
        let repo = Repository::new("shop", "git@example.com:shop.git", machine.id.clone(), "/tmp/sw/mirror");
        store.save_repository(&repo).await.unwrap();

        assert_eq!(store.get_machine(&machine.id).await.unwrap().transport, TransportKind::Local, "{label}");
        assert_eq!(store.find_repository("shop").await.unwrap(), Some(repo.clone()), "{label}");
        assert_eq!(store.list_repositories().await.unwrap().len(), 1, "{label}");
    }
}

// ===========================================================================
// Leases & queued jobs
// ===========================================================================

fn lease(key: &str, holder: &str, token: &str, ttl: Duration) -> Lease {
    Lease {
        key: key.to_string(),
        holder: holder.to_string(),
        token: token.to_string(),
        expires_at: Utc::now() + ttl,
    }
}

#[tokio::test]
async fn lease_excludes_other_holders_until_released_or_expired() {
    for (label, store) in stores().await {
        let hour = Duration::hours(1);
        assert!(store.acquire_lease(&lease("release_1", "cli", "t1", hour)).await.unwrap(), "{label}");
        assert!(!store.acquire_lease(&lease("release_1", "daemon", "t2", hour)).await.unwrap(), "{label}");
        assert_eq!(store.get_lease("release_1").await.unwrap().unwrap().token, "t1", "{label}");

        // a stale token leaves the lease alone
        store.release_lease("release_1", "t2").await.unwrap();
        assert!(store.get_lease("release_1").await.unwrap().is_some(), "{label}");

        store.release_lease("release_1", "t1").await.unwrap();
        assert!(store.acquire_lease(&lease("release_1", "daemon", "t3", hour)).await.unwrap(), "{label}");

        // expired leases are taken over
        assert!(store.acquire_lease(&lease("git:h:/m", "cli", "t4", Duration::seconds(-1))).await.unwrap(), "{label}");
        assert!(store.acquire_lease(&lease("git:h:/m", "daemon", "t5", hour)).await.unwrap(), "{label}");
    }
}

#[tokio::test]
async fn same_holder_replaces_its_own_lease() {
    for (label, store) in stores().await {
        let hour = Duration::hours(1);
        assert!(store.acquire_lease(&lease("testrun_b", "cli", "t1", hour)).await.unwrap(), "{label}");
        assert!(store.acquire_lease(&lease("testrun_b", "cli", "t2", hour)).await.unwrap(), "{label}");
        // the first acquisition's late release must not drop the second
        store.release_lease("testrun_b", "t1").await.unwrap();
        assert_eq!(store.get_lease("testrun_b").await.unwrap().unwrap().token, "t2", "{label}");
    }
}

fn job(id: &str, key: &str) -> QueuedJob {
    QueuedJob {
        id: id.to_string(),
        identity_key: key.to_string(),
        run_at: Utc::now() - Duration::seconds(1),
        status: JobStatus::Pending,
        attempts: 0,
        max_attempts: 3,
        last_error: None,
        payload: serde_json::json!({"type": "fetch_repository", "repo_id": "r1"}),
    }
}

#[tokio::test]
async fn one_live_job_per_identity_key() {
    for (label, store) in stores().await {
        let first = store.insert_job(&job("j1", "fetch r1")).await.unwrap();
        assert_eq!(first.id, "j1", "{label}");
        let second = store.insert_job(&job("j2", "fetch r1")).await.unwrap();
        assert_eq!(second.id, "j1", "{label}");

        let mut failed = first.clone();
        failed.status = JobStatus::Failed;
        assert!(store.update_job(&failed, JobStatus::Pending).await.unwrap(), "{label}");
        let third = store.insert_job(&job("j3", "fetch r1")).await.unwrap();
        assert_eq!(third.id, "j3", "{label}");
        assert_eq!(store.list_jobs().await.unwrap().len(), 1, "{label}");
    }
}

#[tokio::test]
async fn claiming_a_job_succeeds_once() {
    for (label, store) in stores().await {
        store.insert_job(&job("j1", "build b1")).await.unwrap();
        let mut later = job("j2", "build b2");
        later.run_at = Utc::now() + Duration::hours(1);
        store.insert_job(&later).await.unwrap();

        let due = store.due_jobs(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1, "{label}");
        let mut claimed = due[0].clone();
        claimed.status = JobStatus::Running;
        assert!(store.update_job(&claimed, JobStatus::Pending).await.unwrap(), "{label}");
        assert!(!store.update_job(&claimed, JobStatus::Pending).await.unwrap(), "{label}");
        assert!(store.due_jobs(Utc::now(), 10).await.unwrap().is_empty(), "{label}");
        assert_eq!(store.get_job("j1").await.unwrap().unwrap().status, JobStatus::Running, "{label}");

        store.delete_job("j1").await.unwrap();
        assert!(store.get_job("j1").await.unwrap().is_none(), "{label}");
        assert_eq!(store.list_jobs().await.unwrap().len(), 1, "{label}");
    }
}
