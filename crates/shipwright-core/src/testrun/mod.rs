//! Test runs against an ephemeral branch instance.
//!
//! A run checks out the commit into its own directory, then walks the enabled
//! categories in order (unit tests, robot tests, migration). Each category
//! prepares the instance from scratch, executes its items through the shared
//! batch runner and tears the instance down again, whatever happened.
//! The run state is recomputed from the lines after every line change.

mod batch;
mod instance;
mod migration;
mod robot;
mod unittest;

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shipwright_state::{
    Branch, BranchId, LineKind, RunState, TestRun, TestRunId, TestRunLine, TestRunLineId,
    TestState,
};
use tracing::{error, info, instrument, warn};

use crate::branch_state::BranchStateMachine;
use crate::context::Context;
use crate::error::{Result, ShipwrightError};
use crate::remote::LogSink;

pub use batch::{BatchItem, BatchSummary, LineReport, LineWriter};
pub use instance::Instance;
pub use robot::{parse_robot_output, safe_filename, RobotResult};
pub use unittest::{display_path, group_by_module};

/// Knobs for test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Per item timeout
    pub timeout_secs: u64,
    /// Attempts per unit test before the line is failed
    pub retry_count: u32,
    /// List every unit test, not only those of changed modules
    pub unittest_all: bool,
    /// Comma separated parallelism levels for robot tests
    pub robot_parallel: String,
    /// Regex robot test paths must match
    pub robot_filter: String,
    /// Module hashes computed concurrently
    pub hash_workers: usize,
    pub postgres_wait_secs: u64,
    /// Command driving the instance (`<cli> build`, `<cli> up -d`, ...)
    pub instance_cli: String,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            retry_count: 3,
            unittest_all: false,
            robot_parallel: "1,2,5,10,20,50".to_string(),
            robot_filter: ".*".to_string(),
            hash_workers: 4,
            postgres_wait_secs: 60,
            instance_cli: "odoo".to_string(),
        }
    }
}

impl TestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Run state and success rate for a set of lines.
///
/// Log lines are ignored. `failed` if any line failed and was not forced,
/// `success` if at least one line exists and all succeeded, `open` otherwise.
/// The rate is rounded to the nearest percent.
pub fn aggregate(lines: &[TestRunLine]) -> (RunState, u8) {
    let counted: Vec<&TestRunLine> = lines.iter().filter(|l| l.counts_for_state()).collect();
    let total = counted.len();
    let succeeded = counted.iter().filter(|l| l.is_success()).count();
    let rate = if total == 0 {
        0
    } else {
        ((succeeded * 200 + total) / (2 * total)) as u8
    };

    let state = if counted.iter().any(|l| l.is_failure()) {
        RunState::Failed
    } else if total > 0 && succeeded == total {
        RunState::Success
    } else {
        RunState::Open
    };
    (state, rate)
}

fn test_state_of(run: &TestRun) -> TestState {
    match run.state {
        RunState::Success => TestState::Success,
        RunState::Failed => TestState::Failed,
        RunState::Open => TestState::None,
    }
}

#[derive(Debug, Clone)]
pub struct TestRunEngine {
    ctx: Context,
    states: BranchStateMachine,
}

impl TestRunEngine {
    pub fn new(ctx: Context) -> Self {
        Self {
            states: BranchStateMachine::new(ctx.clone()),
            ctx,
        }
    }

    /// Test `commit` of the branch (its head when `None`).
    ///
    /// Branches without any enabled category succeed immediately with a
    /// rate of 100. Only one run per branch executes at a time.
    #[instrument(skip(self))]
    pub async fn run_tests(&self, branch_id: &BranchId, commit: Option<&str>) -> Result<TestRun> {
        let store = &self.ctx.store;
        let branch = store.get_branch(branch_id).await?;
        let sha = match commit.or(branch.latest_commit.as_deref()) {
            Some(sha) => sha.to_string(),
            None => {
                return Err(ShipwrightError::Validation(format!(
                    "branch {} has no commit to test",
                    branch.name
                )))
            }
        };

        let mut run = TestRun::new(branch.repo_id.clone(), branch.id.clone(), sha.clone());
        run.started = Some(Utc::now());

        if !branch.any_testing() {
            info!(branch = %branch.name, sha = %sha, "no test category enabled");
            run.state = RunState::Success;
            run.success_rate = 100;
            store.save_run(&run).await?;
            self.publish(&run).await?;
            return Ok(run);
        }

        let _guard = self
            .ctx
            .locks
            .try_acquire(format!("testrun_{}", branch.id))
            .await?;
        store.save_run(&run).await?;

        let clock = Instant::now();
        let log = LogSink::new();
        let outcome = self.execute(&branch, &run, &log).await;

        if let Err(e) = &outcome {
            error!(branch = %branch.name, error = %e, "test run aborted by error");
            log.push(format!("ERROR: {e}"));
            if !e.is_transient() {
                let mut writer = LineWriter::resume(self.ctx.store.clone(), &run).await?;
                writer
                    .failed_line(LineKind::Preparation, "Test run error", &e.to_string())
                    .await?;
            }
        }
        let mut run = store.get_run(&run.id).await?;
        let lines = store.lines_of_run(&run.id).await?;
        let (state, rate) = aggregate(&lines);
        run.state = state;
        run.success_rate = rate;
        run.duration_secs = clock.elapsed().as_secs_f64();
        run.log = Some(log.text());
        store.save_run(&run).await?;
        info!(
            branch = %branch.name,
            sha = %sha,
            state = %run.state,
            success_rate = run.success_rate,
            "test run finished"
        );
        self.publish(&run).await?;
        outcome.map(|_| run)
    }

    async fn execute(&self, branch: &Branch, run: &TestRun, log: &LogSink) -> Result<()> {
        let store = &self.ctx.store;
        let repo = store.get_repository(&branch.repo_id).await?;
        let machine = self.ctx.machine(&repo.machine_id).await?;
        let settings = &self.ctx.config.tests;

        let project = format!("{}_testrun_{}", branch.instance_name(), &run.id.as_str()[..8]);
        let dir = format!(
            "{}/testruns/{}/{}",
            machine.workspace_root.trim_end_matches('/'),
            repo.name,
            project
        );
        let session = self
            .ctx
            .session(&machine, dir.clone())
            .with_env("PROJECT_NAME", project.clone())
            .with_log(log.clone());

        let instance = Instance::new(session.clone(), project, settings.clone());
        let mut writer = LineWriter::new(self.ctx.store.clone(), run);

        let categories = [
            (branch.run_unittests, LineKind::Unittest),
            (branch.run_robottests, LineKind::Robottest),
            (branch.simulate_migration, LineKind::Migration),
        ];
        // Everything after the session exists runs in here so the directory
        // is removed on every exit path.
        let result: Result<()> = async {
            let git = self.ctx.git(session.clone());
            git.ensure_mirror(&repo.url).await?;
            {
                let _guard = git.lock().await?;
                git.checkout_new(&branch.name, &run.commit_sha).await?;
            }

            for (enabled, kind) in categories {
                if !enabled {
                    continue;
                }
                if writer.abort_requested().await? {
                    warn!(run = %run.id, "abort requested, skipping remaining categories");
                    break;
                }
                let prepared = instance.prepare().await;
                let category: Result<bool> = async {
                    if let Err(e) = prepared {
                        if e.is_transient() {
                            return Err(e);
                        }
                        writer
                            .failed_line(LineKind::Preparation, "Failed at preparation", &e.to_string())
                            .await?;
                        return Ok(false);
                    }
                    writer.log_line(format!("{kind:?}: preparation done")).await?;
                    let summary = match kind {
                        LineKind::Unittest => unittest::run(&instance, &mut writer, settings).await?,
                        LineKind::Robottest => robot::run(&instance, &mut writer, settings).await?,
                        _ => migration::run(&instance, &mut writer, branch).await?,
                    };
                    Ok(summary.aborted)
                }
                .await;
                instance.teardown().await;
                if category? {
                    break;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = session.remove(&dir).await {
            warn!(dir = %dir, error = %e, "could not remove test directory");
        }
        result
    }

    /// Push the run outcome to its commit when it is the newest run there.
    async fn publish(&self, run: &TestRun) -> Result<()> {
        let store = &self.ctx.store;
        let newest = store.runs_of_commit(&run.commit_sha).await?;
        if newest.first().map(|r| &r.id) != Some(&run.id) {
            return Ok(());
        }
        if store.get_commit(&run.commit_sha).await?.is_none() {
            warn!(sha = %run.commit_sha, "tested commit is not recorded");
            return Ok(());
        }
        self.states
            .set_test_state(&run.commit_sha, test_state_of(run))
            .await?;
        Ok(())
    }

    /// Recompute state and rate of a run from its lines.
    #[instrument(skip(self))]
    pub async fn recompute_state(&self, run_id: &TestRunId) -> Result<TestRun> {
        let store = &self.ctx.store;
        let mut run = store.get_run(run_id).await?;
        let lines = store.lines_of_run(run_id).await?;
        let (state, rate) = aggregate(&lines);
        run.state = state;
        run.success_rate = rate;
        store.save_run(&run).await?;
        self.publish(&run).await?;
        Ok(run)
    }

    /// Operator override of a failed line without rerunning it.
    pub async fn force_success(&self, line_id: &TestRunLineId) -> Result<TestRun> {
        let mut line = self.ctx.store.get_line(line_id).await?;
        line.force_success = true;
        self.ctx.store.save_line(&line).await?;
        info!(line = %line.name, "line forced to success");
        self.recompute_state(&line.run_id).await
    }

    /// Flag a run; the batch runner stops before its next item.
    pub async fn request_abort(&self, run_id: &TestRunId) -> Result<TestRun> {
        let mut run = self.ctx.store.get_run(run_id).await?;
        run.abort_requested = true;
        self.ctx.store.save_run(&run).await?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_state::{BranchId, LineState, RepoId};

    fn line(run: &TestRun, kind: LineKind, state: LineState) -> TestRunLine {
        let mut l = TestRunLine::new(run, 0, kind, "x");
        l.state = state;
        l
    }

    #[test]
    fn two_of_three_is_failed_at_67() {
        let run = TestRun::new(RepoId::new(), BranchId::new(), "abc");
        let lines = vec![
            line(&run, LineKind::Unittest, LineState::Success),
            line(&run, LineKind::Unittest, LineState::Success),
            line(&run, LineKind::Unittest, LineState::Failed),
        ];
        assert_eq!(aggregate(&lines), (RunState::Failed, 67));
    }

    #[test]
    fn log_lines_do_not_count() {
        let run = TestRun::new(RepoId::new(), BranchId::new(), "abc");
        let lines = vec![
            line(&run, LineKind::Log, LineState::Failed),
            line(&run, LineKind::Robottest, LineState::Success),
        ];
        assert_eq!(aggregate(&lines), (RunState::Success, 100));
    }

    #[test]
    fn forced_line_counts_as_success() {
        let run = TestRun::new(RepoId::new(), BranchId::new(), "abc");
        let mut failed = line(&run, LineKind::Unittest, LineState::Failed);
        failed.force_success = true;
        let lines = vec![failed, line(&run, LineKind::Unittest, LineState::Success)];
        assert_eq!(aggregate(&lines), (RunState::Success, 100));
    }

    #[test]
    fn empty_or_running_is_open() {
        let run = TestRun::new(RepoId::new(), BranchId::new(), "abc");
        assert_eq!(aggregate(&[]), (RunState::Open, 0));
        let lines = vec![
            line(&run, LineKind::Unittest, LineState::Success),
            line(&run, LineKind::Unittest, LineState::Running),
        ];
        assert_eq!(aggregate(&lines), (RunState::Open, 50));
    }
}
