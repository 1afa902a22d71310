//! Remote command execution with deterministic completion detection.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::script::{build_script, strip_padding, Markers, EXIT_BAD_CWD};
use super::transport::Target;
use super::LogSink;
use crate::config::SessionConfig;
use crate::error::{Result, ShipwrightError};

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the command timed out or was killed
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// Return non-zero and timed-out results instead of an error
    pub allow_error: bool,
}

impl ExecOptions {
    pub fn allow_error() -> Self {
        Self {
            allow_error: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Lines collected from one stream plus the marker flags.
#[derive(Debug, Default)]
struct Collected {
    started: AtomicBool,
    stopped: AtomicBool,
    stop_seen_at: Mutex<Option<Instant>>,
    stdout: Mutex<Vec<String>>,
    stderr: Mutex<Vec<String>>,
    /// stderr emitted before the start marker (login noise, ssh errors)
    preamble: Mutex<Vec<String>>,
}

impl Collected {
    fn stop_age(&self) -> Option<Duration> {
        self.stop_seen_at
            .lock()
            .ok()
            .and_then(|t| t.map(|t| t.elapsed()))
    }

    fn take(lines: &Mutex<Vec<String>>) -> Vec<String> {
        lines.lock().map(|mut l| std::mem::take(&mut *l)).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_collector<R>(
    reader: R,
    stream: Stream,
    markers: Markers,
    collected: Arc<Collected>,
    log: Option<LogSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line == markers.start {
                collected.started.store(true, Ordering::SeqCst);
                continue;
            }
            if line == markers.stop {
                if let Ok(mut at) = collected.stop_seen_at.lock() {
                    *at = Some(Instant::now());
                }
                collected.stopped.store(true, Ordering::SeqCst);
                continue;
            }
            let started = collected.started.load(Ordering::SeqCst);
            let sink = match (stream, started) {
                (Stream::Stdout, true) => &collected.stdout,
                (Stream::Stderr, true) => &collected.stderr,
                (Stream::Stderr, false) => &collected.preamble,
                // banner noise before the command ran
                (Stream::Stdout, false) => continue,
            };
            if let Some(log) = &log {
                match stream {
                    Stream::Stdout => debug!(target: "shipwright::remote", "{line}"),
                    Stream::Stderr => warn!(target: "shipwright::remote", "{line}"),
                }
                log.push(line.clone());
            }
            if let Ok(mut buf) = sink.lock() {
                buf.push(line);
            }
        }
    })
}

/// A channel to one host bound to a working directory and environment.
///
/// Cloning (or [`RemoteSession::derive`]) is cheap: derived sessions share
/// the transport parameters and log sink but run their own processes.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    target: Arc<Target>,
    cwd: String,
    env: BTreeMap<String, String>,
    config: SessionConfig,
    log: Option<LogSink>,
    /// Backoff suggested when a lock file on the host is contended
    lock_retry_delay: Duration,
}

impl RemoteSession {
    pub fn new(target: Target, cwd: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            target: Arc::new(target),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            config,
            log: None,
            lock_retry_delay: Duration::from_secs(5),
        }
    }

    /// Session on the local host, used for tests and single-host setups.
    pub fn local(cwd: impl Into<String>) -> Self {
        Self::new(Target::local(), cwd, SessionConfig::default())
    }

    /// Derived session with another working directory and extra environment.
    pub fn derive(&self, cwd: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        let mut merged = self.env.clone();
        merged.extend(env);
        Self {
            target: Arc::clone(&self.target),
            cwd: cwd.into(),
            env: merged,
            config: self.config.clone(),
            log: self.log.clone(),
            lock_retry_delay: self.lock_retry_delay,
        }
    }

    pub fn with_cwd(&self, cwd: impl Into<String>) -> Self {
        self.derive(cwd, BTreeMap::new())
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Stream every output line into `log`.
    pub fn with_log(mut self, log: LogSink) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = delay;
        self
    }

    pub fn lock_retry_delay(&self) -> Duration {
        self.lock_retry_delay
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn log(&self) -> Option<&LogSink> {
        self.log.as_ref()
    }

    /// Run `command` in the session's cwd with default options.
    pub async fn run(&self, command: &str) -> Result<ExecOutput> {
        self.execute(command, ExecOptions::default()).await
    }

    /// Run `command`, returning its output.
    ///
    /// Errors on non-zero exit or timeout unless `opts.allow_error` is set.
    /// Connection and lock problems come back as transient errors regardless.
    #[instrument(skip(self, opts), fields(host = %self.target.host, cwd = %self.cwd))]
    pub async fn execute(&self, command: &str, opts: ExecOptions) -> Result<ExecOutput> {
        let markers = Markers::new();
        let mut env = self.env.clone();
        env.extend(opts.env.clone());
        let cwd = opts.cwd.clone().unwrap_or_else(|| self.cwd.clone());
        let script = build_script(&cwd, &env, &markers, command, !self.target.is_local());
        let timeout = opts.timeout.unwrap_or_else(|| self.config.default_timeout());

        debug!(command = %command, "executing");
        let mut child = self.spawn(&script).await?;

        let collected = Arc::new(Collected::default());
        let mut collectors = Vec::new();
        if let Some(out) = child.stdout.take() {
            collectors.push(spawn_collector(
                out,
                Stream::Stdout,
                markers.clone(),
                Arc::clone(&collected),
                self.log.clone(),
            ));
        }
        if let Some(err) = child.stderr.take() {
            collectors.push(spawn_collector(
                err,
                Stream::Stderr,
                markers.clone(),
                Arc::clone(&collected),
                self.log.clone(),
            ));
        }

        let outcome = self
            .wait_for_completion(&mut child, &collected, timeout)
            .await;
        let (status, timed_out) = match outcome {
            Ok(v) => v,
            Err(e) => {
                kill_tree(&mut child).await;
                return Err(e);
            }
        };
        if timed_out || status.is_none() {
            kill_tree(&mut child).await;
        }

        // Pipes close once the process tree is gone; don't hang on orphans
        // that inherited them.
        for handle in collectors {
            if tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                debug!("collector still attached after completion");
            }
        }

        let exit_code = if timed_out {
            None
        } else {
            status.map(|s| s.code().unwrap_or(-1)).or(Some(0))
        };
        let output = ExecOutput {
            exit_code,
            stdout: strip_padding(Collected::take(&collected.stdout)),
            stderr: strip_padding(Collected::take(&collected.stderr)),
            timed_out,
        };

        if output.success() || opts.allow_error {
            return Ok(output);
        }
        if timed_out {
            warn!(command = %command, secs = timeout.as_secs(), "command timed out");
            return Err(ShipwrightError::Timeout {
                command: command.to_string(),
                secs: timeout.as_secs(),
            });
        }
        Err(self.classify_failure(command, &output))
    }

    async fn spawn(&self, script: &str) -> Result<Child> {
        let mut std_cmd = self.target.interactive_command();
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        Ok(child)
    }

    /// Connection phase then execution phase.
    ///
    /// Returns the exit status (`None` if the process had to be abandoned
    /// after the stop marker) and whether the deadline was hit.
    async fn wait_for_completion(
        &self,
        child: &mut Child,
        collected: &Collected,
        timeout: Duration,
    ) -> Result<(Option<ExitStatus>, bool)> {
        let poll = self.config.poll_interval();
        let begin = Instant::now();

        // Connection phase: the start marker proves the script is running.
        let connect_deadline = begin + self.config.connect_timeout();
        while !collected.started.load(Ordering::SeqCst) {
            if let Some(status) = child.try_wait()? {
                // Give the collector a moment to see a marker already written.
                tokio::time::sleep(poll).await;
                if collected.started.load(Ordering::SeqCst) {
                    break;
                }
                return Err(self.early_exit_error(status, collected));
            }
            if Instant::now() >= connect_deadline {
                warn!(host = %self.target.host, "no start marker within connection deadline");
                return Err(ShipwrightError::retryable(
                    self.config.connection_retry_delay(),
                    format!(
                        "connection timeout: {} did not start the command within {}s",
                        self.target.host, self.config.connect_timeout_secs
                    ),
                ));
            }
            tokio::time::sleep(poll).await;
        }

        // Execution phase.
        let deadline = begin + timeout;
        let stop_grace = Duration::from_secs(self.config.stop_marker_grace_secs);
        let exit_grace = Duration::from_secs(self.config.exit_grace_secs);
        let mut exited_at: Option<Instant> = None;
        loop {
            let stopped = collected.stopped.load(Ordering::SeqCst);
            match child.try_wait()? {
                Some(status) => {
                    if status.code() != Some(0) || stopped {
                        return Ok((Some(status), false));
                    }
                    let since = *exited_at.get_or_insert_with(Instant::now);
                    if since.elapsed() >= exit_grace {
                        debug!("process exited without stop marker");
                        return Ok((Some(status), false));
                    }
                }
                None => {
                    if stopped
                        && collected
                            .stop_age()
                            .map(|age| age >= stop_grace)
                            .unwrap_or(false)
                    {
                        debug!("stop marker seen but process lingers; abandoning it");
                        return Ok((None, false));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok((None, true));
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn early_exit_error(&self, status: ExitStatus, collected: &Collected) -> ShipwrightError {
        let preamble = Collected::take(&collected.preamble).join("\n");
        let code = status.code();
        if code == Some(255) || is_handshake_failure(&preamble) {
            return ShipwrightError::retryable(
                self.config.connection_retry_delay(),
                format!("ssh to {} failed: {}", self.target.host, preamble.trim()),
            );
        }
        let reason = if code == Some(EXIT_BAD_CWD) {
            format!("working directory {} is missing", self.cwd)
        } else {
            preamble
        };
        ShipwrightError::CommandFailed {
            command: "<session setup>".to_string(),
            exit_code: code,
            stderr: reason,
        }
    }

    fn classify_failure(&self, command: &str, output: &ExecOutput) -> ShipwrightError {
        if is_lock_contention(&output.stderr) {
            info!(command = %command, "lock file held, will retry");
            return ShipwrightError::retryable(
                self.lock_retry_delay,
                format!("lock file held while running {command}"),
            );
        }
        ShipwrightError::CommandFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.clone(),
        }
    }
}

fn is_handshake_failure(stderr: &str) -> bool {
    [
        "Connection refused",
        "Connection reset",
        "Connection timed out",
        "kex_exchange_identification",
        "ssh_exchange_identification",
        "Could not resolve hostname",
    ]
    .iter()
    .any(|needle| stderr.contains(needle))
}

pub(crate) fn is_lock_contention(stderr: &str) -> bool {
    stderr.contains("index.lock") || stderr.contains("could not lock")
}

/// Kill the process group started for the command, then reap the child.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = tokio::process::Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pid}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_handshake_detection() {
        assert!(is_lock_contention(
            "fatal: Unable to create '/x/.git/index.lock': File exists."
        ));
        assert!(!is_lock_contention("fatal: not a git repository"));
        assert!(is_handshake_failure(
            "ssh: connect to host h port 22: Connection refused"
        ));
    }

    #[test]
    fn derive_merges_env_and_keeps_target() {
        let base = RemoteSession::local("/tmp").with_env("A", "1");
        let mut extra = BTreeMap::new();
        extra.insert("B".to_string(), "2".to_string());
        let derived = base.derive("/srv", extra);
        assert_eq!(derived.cwd(), "/srv");
        assert_eq!(derived.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(derived.env.get("B").map(String::as_str), Some("2"));
        assert!(Arc::ptr_eq(&base.target, &derived.target));
    }

    #[test]
    fn exec_output_success_requires_zero_and_no_timeout() {
        let mut out = ExecOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        };
        assert!(out.success());
        out.timed_out = true;
        assert!(!out.success());
    }
}
