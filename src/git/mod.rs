//! Serialized git command execution.
//!
//! Concurrent git processes sharing one object database (the mainline plus
//! its worktrees) can corrupt the index or refs; git gives no concurrency
//! guarantee across worktrees. Every git-mutating invocation in the system
//! therefore goes through one [`GitLock`], passed by `Arc` into each
//! component that needs it.

pub mod classify;

pub use classify::{parse_untracked_conflicts, GitFailureKind};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default per-command timeout. Bounds hangs from credential prompts,
/// network stalls, and lock contention.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("failed to spawn git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {command} failed: {stderr}")]
    CommandFailed {
        command: String,
        stderr: String,
        stdout: String,
    },
}

/// Captured output of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Combined stdout + stderr, for failure classification. Git reports
    /// merge conflicts on stdout and most everything else on stderr.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Mutual exclusion for all git-mutating commands.
///
/// Non-reentrant: a caller must never invoke `run` while already holding the
/// lock (i.e. from inside another `run` on the same instance). Doing so
/// deadlocks; the internal in-flight flag turns an overlapping entry that
/// slipped past the mutex into a panic instead of silent corruption.
pub struct GitLock {
    inner: Mutex<()>,
    in_flight: AtomicBool,
    default_timeout: Duration,
}

impl GitLock {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(()),
            in_flight: AtomicBool::new(false),
            default_timeout,
        }
    }

    /// Run `git <args>` in `cwd` with the default timeout, returning the
    /// captured output whether or not git exited zero. Callers interpret
    /// failures; there are no retries at this layer.
    pub async fn run(&self, args: &[&str], cwd: &Path) -> Result<GitOutput, GitError> {
        self.run_with_timeout(args, cwd, self.default_timeout).await
    }

    /// Like [`GitLock::run`] but succeeds only on a zero exit status.
    pub async fn run_checked(&self, args: &[&str], cwd: &Path) -> Result<GitOutput, GitError> {
        let output = self.run(args, cwd).await?;
        if output.success {
            Ok(output)
        } else {
            Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: output.stderr.trim().to_string(),
                stdout: output.stdout.trim().to_string(),
            })
        }
    }

    pub async fn run_with_timeout(
        &self,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<GitOutput, GitError> {
        let _guard = self.inner.lock().await;

        if self.in_flight.swap(true, Ordering::SeqCst) {
            panic!("GitLock is non-reentrant: overlapping git invocation detected");
        }
        let result = self.run_locked(args, cwd, timeout).await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_locked(
        &self,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<GitOutput, GitError> {
        let command_desc = args.join(" ");
        debug!(command = %command_desc, cwd = %cwd.display(), "running git command");

        let child = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GitError::Spawn {
                command: command_desc.clone(),
                source,
            })?;

        // kill_on_drop reaps the child when the timeout fires and the
        // wait future is dropped.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(GitError::Spawn {
                    command: command_desc,
                    source,
                })
            }
            Err(_) => {
                warn!(command = %command_desc, ?timeout, "git command timed out");
                return Err(GitError::Timeout {
                    command: command_desc,
                    timeout,
                });
            }
        };

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for GitLock {
    fn default() -> Self {
        Self::new(DEFAULT_GIT_TIMEOUT)
    }
}

/// Resolve the git directory for `cwd` (`.git` for a normal checkout, the
/// per-worktree gitdir otherwise). Used by merge recovery to look for
/// in-progress merge/rebase markers.
pub async fn git_dir(lock: &GitLock, cwd: &Path) -> Result<PathBuf, GitError> {
    let output = lock
        .run_checked(&["rev-parse", "--absolute-git-dir"], cwd)
        .await?;
    Ok(PathBuf::from(output.stdout.trim()))
}
