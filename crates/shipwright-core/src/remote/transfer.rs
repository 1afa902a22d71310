//! File helpers built on the copy channel.
//!
//! Transfers never go through the interactive channel so they cannot
//! interleave with streamed command output. Directory trees travel as a
//! gzip'ed tar archive.

use std::path::Path;
use std::process::Stdio;

use tracing::{debug, instrument};

use super::script::shell_quote;
use super::session::{ExecOptions, RemoteSession};
use super::transport::CopyDirection;
use crate::error::{Result, ShipwrightError};

/// Run a process on the orchestrator host, failing on non-zero exit.
async fn run_local(mut cmd: tokio::process::Command, what: &str) -> Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        return Err(ShipwrightError::CommandFailed {
            command: what.to_string(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(())
}

fn scratch_archive() -> String {
    format!("/tmp/shipwright-{}.tgz", uuid::Uuid::new_v4().simple())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| ShipwrightError::Validation(format!("non UTF-8 path: {}", path.display())))
}

impl RemoteSession {
    /// Whether `path` exists on the host (`stat`).
    ///
    /// Runs from `/` so it works before the session's own directory exists.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let opts = ExecOptions {
            cwd: Some("/".to_string()),
            ..ExecOptions::allow_error()
        };
        let out = self
            .execute(&format!("stat {}", shell_quote(path)), opts)
            .await?;
        Ok(out.success())
    }

    /// `rm -rf path`, from `/`.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let opts = ExecOptions {
            cwd: Some("/".to_string()),
            ..ExecOptions::default()
        };
        self.execute(&format!("rm -rf {}", shell_quote(path)), opts)
            .await?;
        Ok(())
    }

    /// Remove `path` if it exists; returns whether something was removed.
    pub async fn rmifexists(&self, path: &str) -> Result<bool> {
        if self.exists(path).await? {
            self.remove(path).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Copy a remote file to the orchestrator host.
    #[instrument(skip(self), fields(host = %self.target().host))]
    pub async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        let cmd = self
            .target()
            .copy_command(CopyDirection::Download, path_str(local)?, remote);
        debug!("copy channel download");
        run_local(cmd.into(), &format!("get {remote}")).await
    }

    /// Copy a local file to the host.
    #[instrument(skip(self), fields(host = %self.target().host))]
    pub async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let cmd = self
            .target()
            .copy_command(CopyDirection::Upload, path_str(local)?, remote);
        debug!("copy channel upload");
        run_local(cmd.into(), &format!("put {remote}")).await
    }

    pub async fn write_text(&self, remote: &str, content: &str) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("content");
        tokio::fs::write(&file, content).await?;
        self.put(&file, remote).await
    }

    pub async fn read_text(&self, remote: &str) -> Result<String> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("content");
        self.get(remote, &file).await?;
        Ok(tokio::fs::read_to_string(&file).await?)
    }

    /// Upload the contents of `local_dir` into `remote_dir` (created if needed).
    #[instrument(skip(self), fields(host = %self.target().host))]
    pub async fn put_tree(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("tree.tgz");
        let mut tar = tokio::process::Command::new("tar");
        tar.arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(local_dir)
            .arg(".");
        run_local(tar, "tar -czf").await?;

        let remote_archive = scratch_archive();
        self.put(&archive, &remote_archive).await?;
        self.run(&format!(
            "mkdir -p {dir} && tar -xzf {archive} -C {dir}; rc=$?; rm -f {archive}; exit $rc",
            dir = shell_quote(remote_dir),
            archive = remote_archive
        ))
        .await?;
        Ok(())
    }

    /// Download the contents of `remote_dir` into `local_dir` (created if needed).
    #[instrument(skip(self), fields(host = %self.target().host))]
    pub async fn get_tree(&self, remote_dir: &str, local_dir: &Path) -> Result<()> {
        let remote_archive = scratch_archive();
        self.run(&format!(
            "tar -czf {} -C {} .",
            remote_archive,
            shell_quote(remote_dir)
        ))
        .await?;

        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("tree.tgz");
        let fetched = self.get(&remote_archive, &archive).await;
        self.execute(
            &format!("rm -f {remote_archive}"),
            ExecOptions::allow_error(),
        )
        .await?;
        fetched?;

        tokio::fs::create_dir_all(local_dir).await?;
        let mut tar = tokio::process::Command::new("tar");
        tar.arg("-xzf").arg(&archive).arg("-C").arg(local_dir);
        run_local(tar, "tar -xzf").await
    }
}
