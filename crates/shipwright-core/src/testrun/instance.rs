//! The ephemeral instance a test category runs against.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::TestSettings;
use crate::error::{Result, ShipwrightError};
use crate::remote::{shell_quote, ExecOptions, ExecOutput, RemoteSession};

/// Marker separating banner output from file lists.
const LIST_MARKER: &str = "!!!";

const POSTGRES_PROBE: &str = "psql --sql \"select * from information_schema.tables limit 1;\"";

/// Instance commands run through the configured cli in the test checkout.
#[derive(Debug, Clone)]
pub struct Instance {
    session: RemoteSession,
    project: String,
    settings: TestSettings,
}

impl Instance {
    pub fn new(session: RemoteSession, project: impl Into<String>, settings: TestSettings) -> Self {
        Self {
            session,
            project: project.into(),
            settings,
        }
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn settings(&self) -> &TestSettings {
        &self.settings
    }

    fn command(&self, args: &str) -> String {
        format!("{} {args}", self.settings.instance_cli)
    }

    pub async fn cli(&self, args: &str) -> Result<ExecOutput> {
        self.session.run(&self.command(args)).await
    }

    /// Like [`Instance::cli`] but returns the output of failing commands.
    pub async fn cli_allow_error(&self, args: &str) -> Result<ExecOutput> {
        self.session
            .execute(&self.command(args), ExecOptions::allow_error())
            .await
    }

    /// Bounded by the per item timeout.
    pub async fn cli_timed(&self, args: &str) -> Result<ExecOutput> {
        self.session
            .execute(
                &self.command(args),
                ExecOptions::default().with_timeout(self.settings.timeout()),
            )
            .await
    }

    /// Poll until postgres answers or the configured deadline passes.
    pub async fn wait_for_postgres(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.settings.postgres_wait_secs);
        loop {
            let out = self.cli_allow_error(POSTGRES_PROBE).await?;
            if out.success() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ShipwrightError::Timeout {
                    command: self.command(POSTGRES_PROBE),
                    secs: self.settings.postgres_wait_secs,
                });
            }
            debug!(project = %self.project, "postgres not ready yet");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Build the instance, reset its database and save the clean snapshot.
    #[instrument(skip(self), fields(project = %self.project))]
    pub async fn prepare(&self) -> Result<()> {
        self.cli("reload").await?;
        self.cli("build").await?;
        self.cli_allow_error("kill").await?;
        self.cli_allow_error("rm").await?;
        self.cli("up -d postgres").await?;
        self.wait_for_postgres().await?;
        self.cli("-f db reset").await?;
        self.wait_for_postgres().await?;
        self.cli("update").await?;
        self.save_snapshot().await?;
        info!(project = %self.project, "instance prepared");
        Ok(())
    }

    pub async fn save_snapshot(&self) -> Result<()> {
        self.cli(&format!("snap save {}", shell_quote(&self.project)))
            .await?;
        self.wait_for_postgres().await
    }

    /// Back to the state saved by [`Instance::prepare`].
    pub async fn restore_snapshot(&self) -> Result<()> {
        self.cli(&format!("snap restore {}", shell_quote(&self.project)))
            .await?;
        self.wait_for_postgres().await
    }

    /// Stop and remove the instance. Never fails; problems are logged.
    pub async fn teardown(&self) {
        for args in ["kill", "rm", "down -v"] {
            match self.cli_allow_error(args).await {
                Ok(out) if !out.success() => {
                    debug!(project = %self.project, step = args, "teardown step returned non-zero")
                }
                Ok(_) => {}
                Err(e) => warn!(project = %self.project, step = args, error = %e, "teardown step failed"),
            }
        }
    }

    /// File list printed by a listing command after the `!!!` marker.
    pub async fn list_files(&self, args: &str) -> Result<Vec<String>> {
        let out = self.cli(args).await?;
        parse_file_list(&out.stdout).ok_or_else(|| {
            ShipwrightError::Validation(format!("no file list marker in output of {args}"))
        })
    }
}

pub(crate) fn parse_file_list(stdout: &str) -> Option<Vec<String>> {
    let (_, list) = stdout.split_once(LIST_MARKER)?;
    Some(
        list.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
