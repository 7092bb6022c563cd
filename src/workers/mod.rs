//! Bounded pool of issue-solving workers.
//!
//! Each dispatched issue gets an isolated worktree/branch pair (created
//! through the shared [`GitLock`]), a copy of any auxiliary configuration the
//! solve tool needs, and one solve subprocess with a per-issue timeout. The
//! pool is shutdown-aware: children terminated during shutdown produce
//! results tagged `interrupted` rather than failed.

pub mod solve;

pub use solve::{parse_solve_output, SolveOutcome};

use crate::git::GitLock;
use crate::issue::Issue;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum issues in flight at once
    pub max_workers: usize,
    /// argv of the solve tool; the issue id is appended as `--issue <id>`.
    /// No shell interpolation anywhere.
    pub solve_command: Vec<String>,
    /// Per-issue solve timeout in seconds
    pub solve_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL during shutdown
    pub grace_period_secs: u64,
    /// Directory worktrees are created under
    pub worktree_root: PathBuf,
    /// Files copied from the repo root into each fresh worktree
    /// (tool configuration the solve subprocess expects to find)
    pub aux_files: Vec<PathBuf>,
    /// Prefix for per-issue branch names
    pub branch_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            solve_command: Vec::new(),
            solve_timeout_secs: 1800,
            grace_period_secs: 10,
            worktree_root: PathBuf::from(".swarm/worktrees"),
            aux_files: Vec::new(),
            branch_prefix: "swarm/".to_string(),
        }
    }
}

/// Result of one dispatched issue. Created exactly once per dispatch and
/// never mutated afterward; consumers clone what they keep.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub issue_id: String,
    pub success: bool,
    /// Set when the worker was terminated by a shutdown sequence.
    /// Interrupted work is not a failure; it is eligible for retry.
    pub interrupted: bool,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub duration: Duration,
    pub error: Option<String>,
    /// Set when the solve tool reported the issue should be closed
    /// (invalid/duplicate) rather than implemented.
    pub close_reason: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

enum SolveEnding {
    Exited(bool),
    TimedOut,
    Interrupted,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    git: Arc<GitLock>,
    repo_root: PathBuf,
    mainline: String,
    semaphore: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
    interrupted: Arc<Mutex<HashSet<String>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        git: Arc<GitLock>,
        repo_root: PathBuf,
        mainline: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            config,
            git,
            repo_root,
            mainline,
            semaphore,
            shutdown_rx,
            interrupted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Worker slots currently free.
    pub fn capacity(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers.max(1)
    }

    /// Identifiers of issues whose subprocess was terminated by shutdown.
    /// Returns a defensive copy.
    pub fn interrupted_ids(&self) -> HashSet<String> {
        self.interrupted
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn branch_name(&self, issue_id: &str) -> String {
        format!("{}{}", self.config.branch_prefix, issue_id)
    }

    pub fn worktree_path(&self, issue_id: &str) -> PathBuf {
        self.config.worktree_root.join(issue_id)
    }

    /// Run one issue end to end. Never panics and never returns an error:
    /// every outcome, including infrastructure failures, is folded into the
    /// [`WorkerResult`] so the control loop keeps running.
    pub async fn run_issue(&self, issue: Issue) -> WorkerResult {
        // Bounded concurrency; the permit is held for the whole pipeline.
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.failed_result(
                    &issue.id,
                    Instant::now(),
                    "worker pool semaphore closed".to_string(),
                )
            }
        };

        let started = Instant::now();
        let branch = self.branch_name(&issue.id);
        let worktree = self.worktree_path(&issue.id);

        info!(issue_id = %issue.id, branch = %branch, "dispatching worker");

        if let Err(e) = self.setup_worktree(&branch, &worktree).await {
            error!(issue_id = %issue.id, error = %e, "worktree setup failed");
            return self.failed_result(&issue.id, started, format!("worktree setup failed: {e}"));
        }

        self.run_solve(&issue, started, branch, worktree).await
    }

    async fn setup_worktree(&self, branch: &str, worktree: &std::path::Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.config.worktree_root).await?;

        let worktree_str = worktree
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("worktree path is not valid UTF-8"))?;

        // -B resets a leftover branch from an earlier interrupted run.
        self.git
            .run_checked(
                &[
                    "worktree",
                    "add",
                    "-B",
                    branch,
                    worktree_str,
                    &self.mainline,
                ],
                &self.repo_root,
            )
            .await?;

        for aux in &self.config.aux_files {
            let src = self.repo_root.join(aux);
            if !src.exists() {
                continue;
            }
            let dst = worktree.join(aux);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&src, &dst).await?;
        }

        Ok(())
    }

    async fn run_solve(
        &self,
        issue: &Issue,
        started: Instant,
        branch: String,
        worktree: PathBuf,
    ) -> WorkerResult {
        let Some((program, rest)) = self.config.solve_command.split_first() else {
            return self.failed_result(&issue.id, started, "no solve command configured".into());
        };

        let mut child = match Command::new(program)
            .args(rest)
            .arg("--issue")
            .arg(&issue.id)
            .current_dir(&worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return self.failed_result(
                    &issue.id,
                    started,
                    format!("failed to spawn solve subprocess: {e}"),
                );
            }
        };

        let stdout_task = spawn_pipe_reader(child.stdout.take());
        let stderr_task = spawn_pipe_reader(child.stderr.take());

        let ending = self.await_solve(&mut child, &issue.id).await;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration = started.elapsed();

        match ending {
            SolveEnding::Interrupted => WorkerResult {
                issue_id: issue.id.clone(),
                success: false,
                interrupted: true,
                branch_name: branch,
                worktree_path: worktree,
                duration,
                error: Some("solve subprocess terminated by shutdown".to_string()),
                close_reason: None,
                stdout,
                stderr,
            },
            SolveEnding::TimedOut => WorkerResult {
                issue_id: issue.id.clone(),
                success: false,
                interrupted: false,
                branch_name: branch,
                worktree_path: worktree,
                duration,
                error: Some(format!(
                    "solve subprocess timed out after {}s",
                    self.config.solve_timeout_secs
                )),
                close_reason: None,
                stdout,
                stderr,
            },
            SolveEnding::Exited(exit_success) => {
                let outcome = parse_solve_output(&stdout, exit_success);
                let (success, error, close_reason) = match outcome {
                    SolveOutcome::Implemented => (true, None, None),
                    SolveOutcome::Failed { reason } => (false, Some(reason), None),
                    SolveOutcome::Closed { reason } => (false, None, Some(reason)),
                };
                WorkerResult {
                    issue_id: issue.id.clone(),
                    success,
                    interrupted: false,
                    branch_name: branch,
                    worktree_path: worktree,
                    duration,
                    error,
                    close_reason,
                    stdout,
                    stderr,
                }
            }
        }
    }

    /// Wait for the child, the per-issue timeout, or a shutdown signal,
    /// whichever comes first. On shutdown the issue id is recorded in the
    /// interrupted set before any result is constructed.
    async fn await_solve(&self, child: &mut Child, issue_id: &str) -> SolveEnding {
        let mut shutdown = self.shutdown_rx.clone();
        let timeout = Duration::from_secs(self.config.solve_timeout_secs);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let shutdown_fired = async move {
            // A dropped sender means shutdown can no longer be requested.
            if shutdown.wait_for(|requested| *requested).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::pin!(shutdown_fired);

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => SolveEnding::Exited(status.success()),
                Err(e) => {
                    warn!(issue_id = %issue_id, error = %e, "failed to wait on solve subprocess");
                    SolveEnding::Exited(false)
                }
            },
            _ = &mut deadline => {
                warn!(issue_id = %issue_id, timeout_secs = timeout.as_secs(), "solve subprocess timed out, killing");
                let _ = child.kill().await;
                SolveEnding::TimedOut
            }
            _ = &mut shutdown_fired => {
                // Tag before terminating so the result construction below can
                // never race the interrupted bookkeeping.
                if let Ok(mut set) = self.interrupted.lock() {
                    set.insert(issue_id.to_string());
                }
                info!(issue_id = %issue_id, "shutdown requested, terminating solve subprocess");
                self.terminate_gracefully(child).await;
                SolveEnding::Interrupted
            }
        }
    }

    /// SIGTERM, grace period, then SIGKILL.
    async fn terminate_gracefully(&self, child: &mut Child) {
        let grace = Duration::from_secs(self.config.grace_period_secs);

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let _ = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status();
        }

        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!("solve subprocess ignored SIGTERM, force-killing");
            let _ = child.kill().await;
        }
    }

    fn failed_result(&self, issue_id: &str, started: Instant, error: String) -> WorkerResult {
        WorkerResult {
            issue_id: issue_id.to_string(),
            success: false,
            interrupted: false,
            branch_name: self.branch_name(issue_id),
            worktree_path: self.worktree_path(issue_id),
            duration: started.elapsed(),
            error: Some(error),
            close_reason: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    })
}
