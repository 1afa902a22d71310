//! Generic batch runner shared by all test categories.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use shipwright_state::{LineKind, LineState, RecordStore, RobotStats, TestRun, TestRunLine};
use tracing::{debug, info, warn};

use super::aggregate;
use crate::error::Result;

/// One unit of work in a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchItem {
    pub name: String,
    /// Cache key; with `hash` set a previous success skips the item
    pub unique_name: Option<String>,
    pub hash: Option<String>,
    pub parallelism: Option<u32>,
    /// Argument handed to the action (test path, module, dump)
    pub target: String,
}

impl BatchItem {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    fn cache_key(&self) -> Option<(&str, &str)> {
        Some((self.unique_name.as_deref()?, self.hash.as_deref()?))
    }
}

/// Extra data an action reports for its line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineReport {
    pub robot_stats: Option<RobotStats>,
    pub log_ref: Option<String>,
}

/// Outcome counts of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Abort was requested; remaining items were not started
    pub aborted: bool,
}

/// Writes the lines of one run and keeps the run state current.
pub struct LineWriter {
    store: Arc<dyn RecordStore>,
    run: TestRun,
    next_seq: u32,
}

impl LineWriter {
    pub fn new(store: Arc<dyn RecordStore>, run: &TestRun) -> Self {
        Self {
            store,
            run: run.clone(),
            next_seq: 0,
        }
    }

    /// Continue numbering after the lines already stored.
    pub async fn resume(store: Arc<dyn RecordStore>, run: &TestRun) -> Result<Self> {
        let next_seq = store
            .lines_of_run(&run.id)
            .await?
            .iter()
            .map(|l| l.seq + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            store,
            run: run.clone(),
            next_seq,
        })
    }

    pub fn run(&self) -> &TestRun {
        &self.run
    }

    fn line(&mut self, kind: LineKind, name: impl Into<String>) -> TestRunLine {
        let mut line = TestRunLine::new(&self.run, self.next_seq, kind, name);
        line.started = Some(Utc::now());
        self.next_seq += 1;
        line
    }

    async fn save(&self, line: &TestRunLine) -> Result<()> {
        self.store.save_line(line).await?;
        self.refresh().await
    }

    /// Recompute the run state from its lines. Keeps the abort flag as stored.
    async fn refresh(&self) -> Result<()> {
        let mut run = self.store.get_run(&self.run.id).await?;
        let lines = self.store.lines_of_run(&run.id).await?;
        let (state, rate) = aggregate(&lines);
        run.state = state;
        run.success_rate = rate;
        self.store.save_run(&run).await?;
        Ok(())
    }

    pub async fn abort_requested(&self) -> Result<bool> {
        Ok(self.store.get_run(&self.run.id).await?.abort_requested)
    }

    pub async fn log_line(&mut self, text: impl Into<String>) -> Result<()> {
        let mut line = self.line(LineKind::Log, text);
        line.state = LineState::Success;
        self.save(&line).await
    }

    pub async fn failed_line(&mut self, kind: LineKind, name: &str, error: &str) -> Result<()> {
        let mut line = self.line(kind, name);
        line.state = LineState::Failed;
        line.exc_info = Some(error.to_string());
        self.save(&line).await
    }

    /// Whether `item` already succeeded with the same hash in this repository.
    pub async fn is_cached(&self, item: &BatchItem) -> Result<bool> {
        match item.cache_key() {
            Some((name, hash)) => Ok(self
                .store
                .find_succeeded_line(&self.run.repo_id, name, hash)
                .await?
                .is_some()),
            None => Ok(false),
        }
    }

    /// Run `items` one after another, each as its own line.
    ///
    /// Cached items get a forced-success line without running. An item is
    /// attempted up to `tries` times; the last error ends up in `exc_info`.
    /// Stops early, flagged `aborted`, when abort was requested between
    /// items.
    pub async fn run_batch<'a, F>(
        &mut self,
        kind: LineKind,
        items: Vec<BatchItem>,
        tries: u32,
        action: F,
    ) -> Result<BatchSummary>
    where
        F: Fn(BatchItem) -> BoxFuture<'a, Result<LineReport>>,
    {
        let mut summary = BatchSummary::default();
        for item in items {
            if self.abort_requested().await? {
                info!(run = %self.run.id, "abort requested, stopping batch");
                summary.aborted = true;
                return Ok(summary);
            }

            let mut line = self.line(kind, item.name.clone());
            line.unique_name = item.unique_name.clone();
            line.hash = item.hash.clone();
            line.parallelism = item.parallelism;

            if self.is_cached(&item).await? {
                debug!(item = %item.name, "already succeeded with this hash");
                line.state = LineState::Success;
                line.force_success = true;
                self.save(&line).await?;
                summary.succeeded += 1;
                continue;
            }

            line.state = LineState::Running;
            self.save(&line).await?;

            let clock = Instant::now();
            for attempt in 1..=tries.max(1) {
                line.try_count = attempt;
                match action(item.clone()).await {
                    Ok(report) => {
                        line.state = LineState::Success;
                        line.exc_info = None;
                        line.robot_stats = report.robot_stats;
                        line.log_ref = report.log_ref;
                        break;
                    }
                    Err(e) => {
                        warn!(item = %item.name, attempt, error = %e, "test item failed");
                        line.state = LineState::Failed;
                        line.exc_info = Some(e.to_string());
                    }
                }
            }
            line.duration_secs = clock.elapsed().as_secs_f64();
            self.save(&line).await?;
            if line.state == LineState::Success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use shipwright_state::fakes::MemoryRecordStore;
    use shipwright_state::{BranchId, RepoId, RunState, TestRunStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::ShipwrightError;

    async fn setup() -> (Arc<MemoryRecordStore>, TestRun) {
        let store = Arc::new(MemoryRecordStore::new());
        let run = TestRun::new(RepoId::new(), BranchId::new(), "abc");
        store.save_run(&run).await.unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn flaky_item_succeeds_on_retry() {
        let (store, run) = setup().await;
        let mut writer = LineWriter::new(store.clone(), &run);
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let summary = writer
            .run_batch(
                LineKind::Unittest,
                vec![BatchItem::new("flaky", "t.py")],
                3,
                move |_item| {
                    async move {
                        if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(ShipwrightError::Validation("boom".into()))
                        } else {
                            Ok(LineReport::default())
                        }
                    }
                    .boxed()
                },
            )
            .await
            .unwrap();

        assert_eq!(summary, BatchSummary { succeeded: 1, failed: 0, aborted: false });
        let lines = store.lines_of_run(&run.id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].state, LineState::Success);
        assert_eq!(lines[0].try_count, 2);
        assert_eq!(store.get_run(&run.id).await.unwrap().state, RunState::Success);
    }

    #[tokio::test]
    async fn abort_stops_before_next_item() {
        let (store, run) = setup().await;
        let mut writer = LineWriter::new(store.clone(), &run);
        let flagging = store.clone();
        let run_id = run.id.clone();

        let summary = writer
            .run_batch(
                LineKind::Robottest,
                vec![BatchItem::new("a", "a"), BatchItem::new("b", "b")],
                1,
                move |_item| {
                    let store = flagging.clone();
                    let run_id = run_id.clone();
                    async move {
                        let mut run = store.get_run(&run_id).await?;
                        run.abort_requested = true;
                        store.save_run(&run).await?;
                        Ok::<_, ShipwrightError>(LineReport::default())
                    }
                    .boxed()
                },
            )
            .await
            .unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(store.lines_of_run(&run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_record_last_error() {
        let (store, run) = setup().await;
        let mut writer = LineWriter::new(store.clone(), &run);
        writer
            .run_batch(
                LineKind::Unittest,
                vec![BatchItem::new("broken", "t.py")],
                2,
                |_item| {
                    async { Err::<LineReport, _>(ShipwrightError::Validation("still broken".into())) }
                        .boxed()
                },
            )
            .await
            .unwrap();

        let lines = store.lines_of_run(&run.id).await.unwrap();
        assert_eq!(lines[0].state, LineState::Failed);
        assert_eq!(lines[0].try_count, 2);
        assert!(lines[0].exc_info.as_deref().unwrap().contains("still broken"));
        assert_eq!(store.get_run(&run.id).await.unwrap().state, RunState::Failed);
    }
}
