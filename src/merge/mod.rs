//! Serialized integration of worker branches into the mainline.
//!
//! A single consumer task drains a FIFO queue of merge requests; it is the
//! only code path that mutates the mainline working copy. Each request runs
//! a fixed sequence: circuit check, index recovery, local-change stashing,
//! mainline sync, merge with classified conflict handling, finalize. Repeated
//! consecutive failures trip a circuit breaker that fails further requests
//! fast until a merge succeeds again.

use crate::git::classify::classify_failure;
use crate::git::{git_dir, parse_untracked_conflicts, GitFailureKind, GitLock, GitOutput};
use crate::telemetry::{create_coordination_span, generate_correlation_id};
use crate::workers::WorkerResult;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Consecutive failures before the circuit breaker pauses integration
    pub breaker_threshold: u32,
    /// Pull from the remote while syncing the mainline. Off for repos
    /// without a configured remote (tests, offline runs).
    pub sync_with_remote: bool,
    pub remote: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            breaker_threshold: 3,
            sync_with_remote: true,
            remote: "origin".to_string(),
        }
    }
}

/// Terminal and pending states of a queued merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Pending,
    Merged,
    Conflict,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub status: MergeStatus,
    pub error: Option<String>,
}

impl MergeOutcome {
    fn pending() -> Self {
        Self {
            status: MergeStatus::Pending,
            error: None,
        }
    }
}

/// Handle returned by [`MergeCoordinator::queue_merge`]; observes the final
/// status of that specific request once the consumer sets it.
pub struct MergeTicket {
    issue_id: String,
    rx: watch::Receiver<MergeOutcome>,
}

impl MergeTicket {
    pub fn issue_id(&self) -> &str {
        &self.issue_id
    }

    pub fn status(&self) -> MergeStatus {
        self.rx.borrow().status
    }

    pub fn error(&self) -> Option<String> {
        self.rx.borrow().error.clone()
    }

    /// Block until this request reaches a terminal status.
    pub async fn wait(&mut self) -> MergeOutcome {
        let _ = self
            .rx
            .wait_for(|outcome| outcome.status != MergeStatus::Pending)
            .await;
        self.rx.borrow().clone()
    }
}

/// Synchronized snapshot of the circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub consecutive_failures: u32,
    pub paused: bool,
}

#[derive(Default)]
struct CoordinatorState {
    merged: HashSet<String>,
    failed: HashMap<String, String>,
    consecutive_failures: u32,
    paused: bool,
    /// HEAD of the mainline after the most recent successful merge; hard
    /// reset target for the recovery ladder.
    last_good_ref: Option<String>,
}

struct QueueItem {
    result: WorkerResult,
    outcome_tx: watch::Sender<MergeOutcome>,
    correlation_id: String,
}

pub struct MergeCoordinator {
    tx: mpsc::UnboundedSender<QueueItem>,
    state: Arc<Mutex<CoordinatorState>>,
    pending_rx: watch::Receiver<usize>,
    pending_tx: watch::Sender<usize>,
    handle: JoinHandle<()>,
}

impl MergeCoordinator {
    /// Spawn the consumer task. `mainline` is the integration branch name;
    /// `repo_root` its working copy.
    pub fn new(
        config: MergeConfig,
        git: Arc<GitLock>,
        repo_root: PathBuf,
        mainline: String,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = watch::channel(0usize);
        let state = Arc::new(Mutex::new(CoordinatorState::default()));

        let consumer = Consumer {
            config,
            git,
            repo_root,
            mainline,
            state: Arc::clone(&state),
            pending_tx: pending_tx.clone(),
        };
        let handle = tokio::spawn(consumer.run(rx));

        Self {
            tx,
            state,
            pending_rx,
            pending_tx,
            handle,
        }
    }

    /// Enqueue one worker result for integration. Non-blocking and
    /// thread-safe; the returned ticket observes the final status.
    pub fn queue_merge(&self, result: WorkerResult) -> MergeTicket {
        let issue_id = result.issue_id.clone();
        let (outcome_tx, outcome_rx) = watch::channel(MergeOutcome::pending());

        self.pending_tx.send_modify(|pending| *pending += 1);

        let item = QueueItem {
            result,
            outcome_tx,
            correlation_id: generate_correlation_id(),
        };
        if let Err(mpsc::error::SendError(item)) = self.tx.send(item) {
            // Consumer already shut down: settle the ticket immediately.
            self.pending_tx.send_modify(|pending| *pending -= 1);
            let _ = item.outcome_tx.send(MergeOutcome {
                status: MergeStatus::Failed,
                error: Some("merge coordinator is shut down".to_string()),
            });
        }

        MergeTicket {
            issue_id,
            rx: outcome_rx,
        }
    }

    /// Block until the queue has fully drained or the timeout elapses.
    /// Returns true when drained.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let mut rx = self.pending_rx.clone();
        // The Ref returned by wait_for borrows rx; settle it before rx drops.
        let drained = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|pending| *pending == 0)).await,
            Ok(Ok(_))
        );
        drained
    }

    /// Identifiers merged so far. Defensive copy.
    pub fn merged_ids(&self) -> HashSet<String> {
        self.state
            .lock()
            .map(|s| s.merged.clone())
            .unwrap_or_default()
    }

    /// Failed integrations, id to reason. Defensive copy.
    pub fn failed_merges(&self) -> HashMap<String, String> {
        self.state
            .lock()
            .map(|s| s.failed.clone())
            .unwrap_or_default()
    }

    /// Operator action: clear the paused flag without touching the failure
    /// counter. The next failure re-trips immediately; the next successful
    /// merge resets the counter to zero.
    pub fn resume(&self) {
        if let Ok(mut s) = self.state.lock() {
            if s.paused {
                info!("circuit breaker resumed by operator");
            }
            s.paused = false;
        }
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.state
            .lock()
            .map(|s| BreakerSnapshot {
                consecutive_failures: s.consecutive_failures,
                paused: s.paused,
            })
            .unwrap_or_default()
    }

    /// Close the queue and wait for the consumer to drain what is already
    /// enqueued. The in-progress request always runs to a terminal status;
    /// partial merges are never abandoned mid-step.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "merge consumer task ended abnormally");
        }
    }
}

struct Consumer {
    config: MergeConfig,
    git: Arc<GitLock>,
    repo_root: PathBuf,
    mainline: String,
    state: Arc<Mutex<CoordinatorState>>,
    pending_tx: watch::Sender<usize>,
}

impl Consumer {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
        // recv() yields None once the producer side is dropped and the
        // queue is empty, so shutdown naturally drains.
        while let Some(item) = rx.recv().await {
            let span = create_coordination_span(
                "merge",
                Some(&item.result.issue_id),
                Some(&item.correlation_id),
            );
            let outcome = self.process(&item).instrument(span).await;
            let _ = item.outcome_tx.send(outcome);
            self.pending_tx.send_modify(|pending| *pending -= 1);
        }
        info!("merge consumer drained and stopped");
    }

    async fn process(&self, item: &QueueItem) -> MergeOutcome {
        let issue_id = &item.result.issue_id;
        let branch = &item.result.branch_name;
        // The enclosing span already carries the issue and correlation ids.
        info!(branch = %branch, "processing merge request");

        // 1. Circuit check: fail fast, zero git work.
        if self.breaker_paused() {
            let reason =
                "circuit breaker open: integration paused after repeated merge failures".to_string();
            warn!(issue_id = %issue_id, "{reason}");
            self.record_fast_fail(issue_id, &reason);
            return MergeOutcome {
                status: MergeStatus::Failed,
                error: Some(reason),
            };
        }

        // 2. Index recovery.
        if let Err(reason) = self.ensure_clean_mainline().await {
            let reason = format!("unrecoverable mainline index state: {reason}");
            error!(issue_id = %issue_id, "{reason}");
            return self.finalize_failure(issue_id, MergeStatus::Failed, reason);
        }

        // 3. Local-change isolation.
        let mut stashed = match self.stash_local_changes().await {
            Ok(stashed) => stashed,
            Err(reason) => {
                return self.finalize_failure(
                    issue_id,
                    MergeStatus::Failed,
                    format!("failed to stash local mainline changes: {reason}"),
                )
            }
        };

        // 4. Sync mainline.
        if let Err(reason) = self.sync_mainline(&mut stashed).await {
            let outcome = self.finalize_failure(issue_id, MergeStatus::Failed, reason);
            self.pop_stash(stashed).await;
            return outcome;
        }

        // 5. Integrate.
        let merge_result = self.integrate(&item.result).await;

        // 6. Finalize.
        let outcome = match merge_result {
            Ok(()) => self.finalize_success(&item.result).await,
            Err((status, reason)) => {
                // Worktree left intact for diagnosis.
                warn!(issue_id = %issue_id, reason = %reason, "merge request failed");
                self.finalize_failure(issue_id, status, reason)
            }
        };
        self.pop_stash(stashed).await;
        outcome
    }

    fn breaker_paused(&self) -> bool {
        self.state.lock().map(|s| s.paused).unwrap_or(false)
    }

    fn record_fast_fail(&self, issue_id: &str, reason: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.failed.insert(issue_id.to_string(), reason.to_string());
        }
    }

    /// Detect a half-finished merge or rebase and walk the recovery ladder:
    /// `merge --abort`, then `rebase --abort` when a rebase marker is
    /// present, then a hard reset to the last known-good ref. Re-checks
    /// after each rung.
    async fn ensure_clean_mainline(&self) -> Result<(), String> {
        if !self.mainline_dirty().await? {
            return Ok(());
        }
        warn!("mainline has an in-progress merge/rebase marker, attempting recovery");

        let _ = self.git.run(&["merge", "--abort"], &self.repo_root).await;
        if !self.mainline_dirty().await? {
            info!("mainline recovered via merge --abort");
            return Ok(());
        }

        if self.rebase_marker_present().await? {
            let _ = self.git.run(&["rebase", "--abort"], &self.repo_root).await;
            if !self.mainline_dirty().await? {
                info!("mainline recovered via rebase --abort");
                return Ok(());
            }
        }

        let target = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.last_good_ref.clone())
            .unwrap_or_else(|| "HEAD".to_string());
        warn!(target = %target, "falling back to hard reset");
        let _ = self
            .git
            .run(&["reset", "--hard", &target], &self.repo_root)
            .await;

        if !self.mainline_dirty().await? {
            info!("mainline recovered via hard reset");
            return Ok(());
        }
        Err("merge/rebase markers persist after abort and hard reset".to_string())
    }

    async fn mainline_dirty(&self) -> Result<bool, String> {
        let gitdir = git_dir(&self.git, &self.repo_root)
            .await
            .map_err(|e| e.to_string())?;
        Ok(gitdir.join("MERGE_HEAD").exists()
            || gitdir.join("REBASE_HEAD").exists()
            || gitdir.join("rebase-merge").exists()
            || gitdir.join("rebase-apply").exists())
    }

    async fn rebase_marker_present(&self) -> Result<bool, String> {
        let gitdir = git_dir(&self.git, &self.repo_root)
            .await
            .map_err(|e| e.to_string())?;
        Ok(gitdir.join("REBASE_HEAD").exists()
            || gitdir.join("rebase-merge").exists()
            || gitdir.join("rebase-apply").exists())
    }

    /// Stash uncommitted changes in the mainline working copy so branch
    /// switching cannot clobber them. Returns whether anything was stashed.
    async fn stash_local_changes(&self) -> Result<bool, String> {
        let status = self
            .git
            .run_checked(&["status", "--porcelain"], &self.repo_root)
            .await
            .map_err(|e| e.to_string())?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }
        self.git
            .run_checked(
                &[
                    "stash",
                    "push",
                    "--include-untracked",
                    "-m",
                    "issue-swarm mainline autostash",
                ],
                &self.repo_root,
            )
            .await
            .map_err(|e| e.to_string())?;
        info!("stashed uncommitted mainline changes");
        Ok(true)
    }

    async fn pop_stash(&self, stashed: bool) {
        if !stashed {
            return;
        }
        match self.git.run(&["stash", "pop"], &self.repo_root).await {
            Ok(output) if output.success => info!("restored stashed mainline changes"),
            Ok(output) => warn!(
                stderr = %output.stderr.trim(),
                "failed to pop mainline stash; local changes remain stashed"
            ),
            Err(e) => warn!(error = %e, "failed to pop mainline stash"),
        }
    }

    async fn sync_mainline(&self, stashed: &mut bool) -> Result<(), String> {
        self.git
            .run_checked(&["checkout", &self.mainline], &self.repo_root)
            .await
            .map_err(|e| format!("checkout of {} failed: {e}", self.mainline))?;

        if !self.config.sync_with_remote {
            return Ok(());
        }

        let pull_args = ["pull", "--rebase", self.config.remote.as_str(), &self.mainline];
        let pull = self
            .git
            .run(&pull_args, &self.repo_root)
            .await
            .map_err(|e| format!("pull --rebase failed: {e}"))?;
        if pull.success {
            return Ok(());
        }

        if classify_failure(&pull.combined()) == GitFailureKind::PullConflict {
            // Local changes surfaced after the first stash; stash again and
            // retry once.
            if self.stash_local_changes().await? {
                *stashed = true;
            }
            let retry = self
                .git
                .run(&pull_args, &self.repo_root)
                .await
                .map_err(|e| format!("pull --rebase retry failed: {e}"))?;
            if retry.success {
                return Ok(());
            }
            return Err(format!(
                "pull --rebase failed after re-stash: {}",
                summarize(&retry)
            ));
        }

        Err(format!("pull --rebase failed: {}", summarize(&pull)))
    }

    /// Merge the worker branch, routing failures by classification.
    async fn integrate(&self, result: &WorkerResult) -> Result<(), (MergeStatus, String)> {
        let branch = result.branch_name.as_str();
        let message = format!("Merge {} ({})", branch, result.issue_id);

        let merge = self
            .git
            .run(&["merge", "--no-ff", branch, "-m", &message], &self.repo_root)
            .await
            .map_err(|e| (MergeStatus::Failed, format!("merge invocation failed: {e}")))?;
        if merge.success {
            return Ok(());
        }

        let text = merge.combined();
        match classify_failure(&text) {
            GitFailureKind::UntrackedConflict => {
                let _ = self.git.run(&["merge", "--abort"], &self.repo_root).await;
                match parse_untracked_conflicts(&text) {
                    Some(files) => Err((
                        MergeStatus::Conflict,
                        format!(
                            "untracked files in the mainline would be overwritten: {}",
                            files.join(", ")
                        ),
                    )),
                    None => Err((
                        MergeStatus::Failed,
                        "untracked-file conflict detected but the conflicting file list \
                         could not be parsed from git output"
                            .to_string(),
                    )),
                }
            }
            GitFailureKind::MergeConflict => self.retry_after_rebase(result, &message).await,
            GitFailureKind::IndexCorruption => {
                let _ = self.git.run(&["merge", "--abort"], &self.repo_root).await;
                Err((
                    MergeStatus::Failed,
                    format!("merge hit a corrupt index state: {}", summarize(&merge)),
                ))
            }
            _ => Err((
                MergeStatus::Failed,
                format!("merge failed: {}", summarize(&merge)),
            )),
        }
    }

    /// Content-conflict handler: abort the merge, rebase the worker branch
    /// atop the refreshed mainline (stashing the worktree's own uncommitted
    /// state around the rebase), then retry the merge exactly once.
    async fn retry_after_rebase(
        &self,
        result: &WorkerResult,
        message: &str,
    ) -> Result<(), (MergeStatus, String)> {
        let branch = result.branch_name.as_str();
        let worktree = result.worktree_path.as_path();
        info!(branch = %branch, "content conflict; rebasing worker branch and retrying once");

        let _ = self.git.run(&["merge", "--abort"], &self.repo_root).await;

        let worktree_stashed = {
            let status = self
                .git
                .run_checked(&["status", "--porcelain"], worktree)
                .await
                .map_err(|e| (MergeStatus::Failed, format!("worktree status failed: {e}")))?;
            if status.stdout.trim().is_empty() {
                false
            } else {
                self.git
                    .run_checked(
                        &["stash", "push", "--include-untracked", "-m", "issue-swarm rebase stash"],
                        worktree,
                    )
                    .await
                    .map_err(|e| (MergeStatus::Failed, format!("worktree stash failed: {e}")))?;
                true
            }
        };

        let rebase = self
            .git
            .run(&["rebase", &self.mainline], worktree)
            .await
            .map_err(|e| (MergeStatus::Failed, format!("rebase invocation failed: {e}")))?;
        if !rebase.success {
            let _ = self.git.run(&["rebase", "--abort"], worktree).await;
            if worktree_stashed {
                let _ = self.git.run(&["stash", "pop"], worktree).await;
            }
            return Err((
                MergeStatus::Conflict,
                format!(
                    "content conflict: rebase onto {} failed: {}",
                    self.mainline,
                    summarize(&rebase)
                ),
            ));
        }

        if worktree_stashed {
            let _ = self.git.run(&["stash", "pop"], worktree).await;
        }

        let retry = self
            .git
            .run(&["merge", "--no-ff", branch, "-m", message], &self.repo_root)
            .await
            .map_err(|e| (MergeStatus::Failed, format!("merge retry failed: {e}")))?;
        if retry.success {
            Ok(())
        } else {
            let _ = self.git.run(&["merge", "--abort"], &self.repo_root).await;
            Err((
                MergeStatus::Conflict,
                format!("merge still conflicts after rebase: {}", summarize(&retry)),
            ))
        }
    }

    async fn finalize_success(&self, result: &WorkerResult) -> MergeOutcome {
        // Worktree and branch are reclaimed only now that the merge has
        // reached a terminal state.
        if let Some(worktree) = result.worktree_path.to_str() {
            if let Err(e) = self
                .git
                .run(&["worktree", "remove", "--force", worktree], &self.repo_root)
                .await
            {
                warn!(error = %e, "failed to remove merged worktree");
            }
        }
        if let Err(e) = self
            .git
            .run(&["branch", "-D", &result.branch_name], &self.repo_root)
            .await
        {
            warn!(error = %e, "failed to delete merged branch");
        }

        let head = self
            .git
            .run_checked(&["rev-parse", "HEAD"], &self.repo_root)
            .await
            .ok()
            .map(|out| out.stdout.trim().to_string());

        if let Ok(mut s) = self.state.lock() {
            s.merged.insert(result.issue_id.clone());
            s.consecutive_failures = 0;
            if s.paused {
                info!("circuit breaker reset by successful merge");
            }
            s.paused = false;
            if head.is_some() {
                s.last_good_ref = head;
            }
        }

        info!(issue_id = %result.issue_id, branch = %result.branch_name, "merge completed");
        MergeOutcome {
            status: MergeStatus::Merged,
            error: None,
        }
    }

    fn finalize_failure(&self, issue_id: &str, status: MergeStatus, reason: String) -> MergeOutcome {
        if let Ok(mut s) = self.state.lock() {
            s.failed.insert(issue_id.to_string(), reason.clone());
            s.consecutive_failures += 1;
            if s.consecutive_failures >= self.config.breaker_threshold && !s.paused {
                s.paused = true;
                error!(
                    consecutive_failures = s.consecutive_failures,
                    "circuit breaker tripped: pausing integration pending manual \
                     intervention or a successful merge"
                );
            }
        }
        MergeOutcome {
            status,
            error: Some(reason),
        }
    }
}

/// First meaningful line of a failed command's output, for error messages.
fn summarize(output: &GitOutput) -> String {
    let text = output.combined();
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string()
}
