//! Git operations layered on a [`RemoteSession`].
//!
//! A `GitOps` is bound to one working directory on one host: a repository
//! mirror, a branch checkout or a release source tree. Every call goes
//! through the session, so lock-file contention surfaces as a retryable
//! error like any other command.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, ShipwrightError};
use crate::lock::{KeyedLocks, LockGuard};
use crate::remote::{is_lock_contention, shell_quote, ExecOptions, ExecOutput, RemoteSession};

const REMOTE: &str = "origin";

/// Result of merging one ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge was aborted; `output` is the console output of the attempt
    Conflict { output: String },
}

/// Metadata of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct GitOps {
    session: RemoteSession,
    locks: KeyedLocks,
}

impl GitOps {
    pub fn new(session: RemoteSession, locks: KeyedLocks) -> Self {
        let mut env = BTreeMap::new();
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        for var in ["GIT_AUTHOR_NAME", "GIT_COMMITTER_NAME"] {
            env.insert(var.to_string(), "shipwright".to_string());
        }
        for var in ["GIT_AUTHOR_EMAIL", "GIT_COMMITTER_EMAIL"] {
            env.insert(var.to_string(), "shipwright@localhost".to_string());
        }
        let session = session.derive(session.cwd().to_string(), env);
        Self { session, locks }
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    pub fn path(&self) -> &str {
        self.session.cwd()
    }

    /// Advisory lock on this working directory.
    pub async fn lock(&self) -> Result<LockGuard> {
        self.locks
            .try_acquire(KeyedLocks::git_key(&self.session.target().host, self.path()))
            .await
    }

    async fn git(&self, args: &str) -> Result<ExecOutput> {
        self.session.run(&format!("git {args}")).await
    }

    async fn git_allow_error(&self, args: &str) -> Result<ExecOutput> {
        self.session
            .execute(&format!("git {args}"), ExecOptions::allow_error())
            .await
    }

    /// Clone `url` into this directory once, fetch otherwise.
    ///
    /// Returns `true` when a fresh clone was made.
    #[instrument(skip(self), fields(path = %self.path()))]
    pub async fn ensure_mirror(&self, url: &str) -> Result<bool> {
        let _guard = self.lock().await?;
        let dot_git = format!("{}/.git", self.path());
        if self.session.exists(&dot_git).await? {
            self.fetch().await?;
            return Ok(false);
        }

        let parent = Path::new(self.path())
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or("/")
            .to_string();
        info!(url = %url, "cloning mirror");
        let opts = ExecOptions {
            cwd: Some("/".to_string()),
            ..ExecOptions::default()
        };
        self.session
            .execute(
                &format!(
                    "mkdir -p {} && rm -rf {path} && git clone --no-checkout {} {path}",
                    shell_quote(&parent),
                    shell_quote(url),
                    path = shell_quote(self.path()),
                ),
                opts,
            )
            .await?;
        Ok(true)
    }

    pub async fn fetch(&self) -> Result<()> {
        self.git("fetch --all --prune --tags").await?;
        Ok(())
    }

    /// Check out an existing branch, then clean the tree.
    #[instrument(skip(self), fields(path = %self.path()))]
    pub async fn checkout_branch(&self, name: &str, force: bool) -> Result<()> {
        let flag = if force { " -f" } else { "" };
        self.git(&format!("checkout{flag} {}", shell_quote(name)))
            .await?;
        self.after_checkout().await
    }

    /// Create or replace branch `name` at `start` and check it out.
    pub async fn checkout_new(&self, name: &str, start: &str) -> Result<()> {
        self.git(&format!(
            "checkout -f -B {} {}",
            shell_quote(name),
            shell_quote(start)
        ))
        .await?;
        self.after_checkout().await
    }

    async fn after_checkout(&self) -> Result<()> {
        self.git("clean -xdff").await?;
        self.git("submodule update --init --force --recursive")
            .await?;
        Ok(())
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .git_allow_error(&format!(
                "show-ref --verify --quiet refs/heads/{}",
                shell_quote(name)
            ))
            .await?;
        Ok(out.success())
    }

    /// Branch names on the remote, without the remote prefix.
    pub async fn list_remote_branches(&self) -> Result<Vec<String>> {
        let out = self.git("branch -r").await?;
        Ok(parse_remote_branches(&out.stdout))
    }

    /// `(sha, commit time)` of the commits on a remote branch, newest first.
    pub async fn recent_commits(
        &self,
        branch: &str,
        since: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let out = self
            .git(&format!(
                "log --pretty=format:%H,%ct --since={} {}",
                shell_quote(since),
                shell_quote(&format!("{REMOTE}/{branch}"))
            ))
            .await?;
        out.stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let (sha, ts) = line
                    .trim()
                    .split_once(',')
                    .ok_or_else(|| ShipwrightError::Git(format!("unexpected log line: {line}")))?;
                Ok((sha.to_string(), parse_timestamp(ts)?))
            })
            .collect()
    }

    pub async fn commit_info(&self, sha: &str) -> Result<CommitInfo> {
        let out = self
            .git(&format!("show -s --format=%an%n%ct%n%B {}", shell_quote(sha)))
            .await?;
        let mut lines = out.stdout.lines();
        let author = lines.next().unwrap_or_default().to_string();
        let date = parse_timestamp(lines.next().unwrap_or_default())?;
        let message = lines.collect::<Vec<_>>().join("\n").trim().to_string();
        Ok(CommitInfo {
            sha: sha.to_string(),
            author,
            date,
            message,
        })
    }

    /// `git merge --no-ff` of `source` into the checked out branch.
    ///
    /// A failed merge is aborted so the tree stays usable for the next one.
    #[instrument(skip(self, message), fields(path = %self.path()))]
    pub async fn merge(&self, source: &str, message: &str) -> Result<MergeOutcome> {
        let out = self
            .git_allow_error(&format!(
                "merge --no-ff --no-edit -m {} {}",
                shell_quote(message),
                shell_quote(source)
            ))
            .await?;
        if out.success() {
            debug!(source = %source, "merged");
            return Ok(MergeOutcome::Merged);
        }
        if is_lock_contention(&out.stderr) {
            return Err(ShipwrightError::retryable(
                self.session.lock_retry_delay(),
                format!("lock file held while merging {source}"),
            ));
        }
        let output = [out.stdout.as_str(), out.stderr.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        warn!(source = %source, "merge conflict");
        let abort = self.git_allow_error("merge --abort").await?;
        if !abort.success() {
            self.reset_hard("HEAD").await?;
        }
        Ok(MergeOutcome::Conflict { output })
    }

    pub async fn tag(&self, name: &str, target: &str) -> Result<()> {
        self.git(&format!(
            "tag -f {} {}",
            shell_quote(name),
            shell_quote(target)
        ))
        .await?;
        Ok(())
    }

    pub async fn push(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { " -f" } else { "" };
        self.git(&format!("push{flag} {REMOTE} {}", shell_quote(branch)))
            .await?;
        Ok(())
    }

    pub async fn push_tags(&self) -> Result<()> {
        self.git(&format!("push -f {REMOTE} --tags")).await?;
        Ok(())
    }

    /// Inserted plus deleted lines between two refs.
    pub async fn count_changed_lines(&self, from: &str, to: &str) -> Result<u64> {
        let out = self
            .git(&format!(
                "diff --shortstat {} {}",
                shell_quote(from),
                shell_quote(to)
            ))
            .await?;
        Ok(parse_shortstat(&out.stdout))
    }

    /// Empty commit on the checked out branch; returns its sha.
    pub async fn commit_empty(&self, message: &str) -> Result<String> {
        self.git(&format!(
            "commit --allow-empty -m {}",
            shell_quote(message)
        ))
        .await?;
        self.head_sha().await
    }

    pub async fn reset_hard(&self, target: &str) -> Result<()> {
        self.git(&format!("reset --hard {}", shell_quote(target)))
            .await?;
        Ok(())
    }

    pub async fn head_sha(&self) -> Result<String> {
        self.rev_parse("HEAD").await
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self
            .git(&format!("rev-parse {}", shell_quote(rev)))
            .await?;
        let sha = out.stdout.trim().to_string();
        if sha.is_empty() {
            return Err(ShipwrightError::Git(format!("rev-parse {rev} returned nothing")));
        }
        Ok(sha)
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self
            .git_allow_error(&format!(
                "merge-base --is-ancestor {} {}",
                shell_quote(ancestor),
                shell_quote(descendant)
            ))
            .await?;
        match out.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(ShipwrightError::Git(format!(
                "merge-base failed: {}",
                out.stderr
            ))),
        }
    }
}

/// Remote branch ref for `name`.
pub fn remote_ref(name: &str) -> String {
    format!("{REMOTE}/{name}")
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = ts
        .trim()
        .parse()
        .map_err(|_| ShipwrightError::Git(format!("invalid commit timestamp: {ts:?}")))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| ShipwrightError::Git(format!("timestamp out of range: {secs}")))
}

fn parse_remote_branches(stdout: &str) -> Vec<String> {
    let prefix = format!("{REMOTE}/");
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains("->"))
        .map(|l| l.strip_prefix(&prefix).unwrap_or(l).to_string())
        .collect()
}

fn parse_shortstat(stdout: &str) -> u64 {
    let Ok(re) = Regex::new(r"(\d+) (insertion|deletion)") else {
        return 0;
    };
    re.captures_iter(stdout)
        .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
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

    /// Bare origin with `main` holding one file.
    fn make_origin(root: &Path) -> std::path::PathBuf {
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

    fn push_change(root: &Path, branch: &str, line: &str) {
        let seed = root.join("seed");
        run_git(&seed, &["checkout", "-B", branch, "main"]);
        std::fs::write(seed.join("app.txt"), format!("{line}\ntwo\nthree\n")).unwrap();
        run_git(&seed, &["commit", "-am", &format!("change on {branch}")]);
        run_git(&seed, &["push", "-f", "origin", branch]);
        run_git(&seed, &["checkout", "main"]);
    }

    fn ops(path: &Path) -> GitOps {
        let session = RemoteSession::local(path.to_str().unwrap())
            .with_env("GIT_AUTHOR_NAME", "test-user")
            .with_env("GIT_AUTHOR_EMAIL", "test@example.com")
            .with_env("GIT_COMMITTER_NAME", "test-user")
            .with_env("GIT_COMMITTER_EMAIL", "test@example.com");
        GitOps::new(session, KeyedLocks::default())
    }

    #[test]
    fn parses_git_output() {
        let branches = parse_remote_branches("  origin/HEAD -> origin/main\n  origin/main\n  origin/feature/x\n");
        assert_eq!(branches, vec!["main", "feature/x"]);
        assert_eq!(
            parse_shortstat(" 2 files changed, 5 insertions(+), 3 deletions(-)"),
            8
        );
        assert_eq!(parse_shortstat(" 1 file changed, 1 insertion(+)"), 1);
        assert_eq!(parse_shortstat(""), 0);
    }

    #[tokio::test]
    async fn mirror_lists_branches_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let origin = make_origin(dir.path());
        push_change(dir.path(), "feature", "uno");

        let git = ops(&dir.path().join("mirror"));
        assert!(git.ensure_mirror(origin.to_str().unwrap()).await.unwrap());
        assert!(!git.ensure_mirror(origin.to_str().unwrap()).await.unwrap());

        let mut branches = git.list_remote_branches().await.unwrap();
        branches.sort();
        assert_eq!(branches, vec!["feature", "main"]);

        let commits = git.recent_commits("feature", "4 months ago").await.unwrap();
        assert_eq!(commits.len(), 2);
        let info = git.commit_info(&commits[0].0).await.unwrap();
        assert_eq!(info.author, "test-user");
        assert_eq!(info.message, "change on feature");
    }

    #[tokio::test]
    async fn conflicting_merge_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let origin = make_origin(dir.path());
        push_change(dir.path(), "b1", "uno");
        push_change(dir.path(), "b2", "eins");

        let git = ops(&dir.path().join("mirror"));
        git.ensure_mirror(origin.to_str().unwrap()).await.unwrap();
        git.checkout_new("candidate", &remote_ref("main")).await.unwrap();

        let first = git.merge(&remote_ref("b1"), "merge b1").await.unwrap();
        assert_eq!(first, MergeOutcome::Merged);
        let after_first = git.head_sha().await.unwrap();

        match git.merge(&remote_ref("b2"), "merge b2").await.unwrap() {
            MergeOutcome::Conflict { output } => assert!(output.contains("CONFLICT")),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(git.head_sha().await.unwrap(), after_first);
        let content = std::fs::read_to_string(dir.path().join("mirror/app.txt")).unwrap();
        assert!(content.starts_with("uno"));
    }

    #[tokio::test]
    async fn marker_commit_adds_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let origin = make_origin(dir.path());
        let git = ops(&dir.path().join("mirror"));
        git.ensure_mirror(origin.to_str().unwrap()).await.unwrap();
        git.checkout_new("candidate", &remote_ref("main")).await.unwrap();

        let base = git.head_sha().await.unwrap();
        let marker = git.commit_empty("Release Item 1\nIncludes latest commits from:\n").await.unwrap();
        assert_ne!(base, marker);
        assert!(git.is_ancestor(&base, &marker).await.unwrap());
        assert!(!git.is_ancestor(&marker, &base).await.unwrap());
        assert_eq!(git.count_changed_lines(&base, &marker).await.unwrap(), 0);
        assert!(git.branch_exists("candidate").await.unwrap());
        assert!(!git.branch_exists("nope").await.unwrap());
    }
}
