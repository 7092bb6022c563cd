//! Control loop tying the scheduler, worker pool, and merge coordinator
//! together.
//!
//! The loop is single-threaded: it asks the dependency graph for ready
//! issues, filters them through overlap detection, dispatches up to the
//! pool's remaining capacity, and then processes one worker completion at a
//! time. A successful worker's branch is queued for merge and the loop waits
//! for that specific merge to finish before dispatching further work, so a
//! new worker's worktree setup can never run concurrently with the merge
//! consumer's inspection of mainline state.

use crate::graph::DependencyGraph;
use crate::merge::{MergeCoordinator, MergeStatus};
use crate::overlap::OverlapDetector;
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::create_coordination_span;
use crate::workers::{WorkerPool, WorkerResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

/// Final accounting of one orchestrator run. Interrupted issues are
/// reported separately from failures; they are retryable.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub merged: Vec<String>,
    pub failed: HashMap<String, String>,
    pub interrupted: Vec<String>,
    pub closed: HashMap<String, String>,
    pub durations_ms: HashMap<String, u64>,
    /// True when integration is halted pending manual intervention.
    pub breaker_tripped: bool,
}

/// Mutated only from the single control-loop task; reports take copies.
#[derive(Default)]
struct OrchestratorState {
    merged: HashSet<String>,
    failed: HashMap<String, String>,
    interrupted: HashSet<String>,
    closed: HashMap<String, String>,
    /// issue id -> touched-file hints, for overlap checks against running work
    in_flight: HashMap<String, Vec<PathBuf>>,
    durations: HashMap<String, Duration>,
}

impl OrchestratorState {
    fn settled(&self) -> usize {
        self.merged.len() + self.failed.len() + self.interrupted.len() + self.closed.len()
    }

    /// Issues that must not be dispatched (again): running or terminally
    /// accounted for. Merged ids are excluded by `ready` itself.
    fn undispatchable(&self) -> HashSet<String> {
        self.in_flight
            .keys()
            .chain(self.failed.keys())
            .chain(self.interrupted.iter())
            .chain(self.closed.keys())
            .cloned()
            .collect()
    }
}

pub struct Orchestrator {
    graph: DependencyGraph,
    overlap: OverlapDetector,
    pool: Arc<WorkerPool>,
    coordinator: MergeCoordinator,
    shutdown: Arc<ShutdownCoordinator>,
    /// Upper bound on waiting for the merge queue to drain after each queue
    merge_wait: Duration,
    state: OrchestratorState,
}

impl Orchestrator {
    pub fn new(
        graph: DependencyGraph,
        overlap: OverlapDetector,
        pool: Arc<WorkerPool>,
        coordinator: MergeCoordinator,
        shutdown: Arc<ShutdownCoordinator>,
        merge_wait: Duration,
    ) -> Self {
        Self {
            graph,
            overlap,
            pool,
            coordinator,
            shutdown,
            merge_wait,
            state: OrchestratorState::default(),
        }
    }

    /// Run all issues to completion (or until shutdown) and produce the
    /// final report.
    pub async fn run(mut self) -> RunReport {
        let started_at = Utc::now();
        let total = self.graph.len();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();

        info!(total_issues = total, max_workers = self.pool.max_workers(), "orchestrator starting");

        loop {
            if self.shutdown.is_requested() {
                break;
            }
            if self.state.settled() >= total && workers.is_empty() {
                break;
            }

            let dispatched = self.dispatch_ready(&mut workers);
            if workers.is_empty() && dispatched == 0 {
                // Nothing running and nothing dispatchable: the rest are
                // blocked behind unmerged dependencies.
                self.fail_blocked_issues();
                break;
            }

            self.await_one_completion(&mut workers).await;
        }

        // On shutdown, in-flight workers come back tagged interrupted.
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => self.handle_completion(result).await,
                Err(e) => warn!(error = %e, "worker task ended abnormally"),
            }
        }

        if !self.coordinator.wait_for_completion(self.merge_wait).await {
            warn!("merge queue did not drain before the wait limit");
        }

        let breaker = self.coordinator.breaker();
        self.coordinator.shutdown().await;

        let mut merged: Vec<String> = self.state.merged.iter().cloned().collect();
        merged.sort();
        let mut interrupted: Vec<String> = self.state.interrupted.iter().cloned().collect();
        interrupted.sort();

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            merged,
            failed: self.state.failed.clone(),
            interrupted,
            closed: self.state.closed.clone(),
            durations_ms: self
                .state
                .durations
                .iter()
                .map(|(id, d)| (id.clone(), d.as_millis() as u64))
                .collect(),
            breaker_tripped: breaker.paused,
        };
        info!(
            merged = report.merged.len(),
            failed = report.failed.len(),
            interrupted = report.interrupted.len(),
            closed = report.closed.len(),
            breaker_tripped = report.breaker_tripped,
            "orchestrator finished"
        );
        report
    }

    /// Dispatch ready, non-overlapping issues up to the pool's free
    /// capacity. Returns how many were dispatched.
    fn dispatch_ready(&mut self, workers: &mut JoinSet<WorkerResult>) -> usize {
        let undispatchable = self.state.undispatchable();
        let ready = self.graph.ready(&self.state.merged, &undispatchable);
        if ready.is_empty() {
            return 0;
        }

        let in_flight_files: HashSet<PathBuf> = self
            .state
            .in_flight
            .values()
            .flatten()
            .cloned()
            .collect();
        let plan = self.overlap.partition(&ready, &in_flight_files);

        let capacity = self
            .pool
            .max_workers()
            .saturating_sub(self.state.in_flight.len());

        let mut dispatched = 0;
        for issue in plan.dispatch.into_iter().take(capacity) {
            info!(issue_id = %issue.id, priority = %issue.priority, "dispatching issue");
            self.state
                .in_flight
                .insert(issue.id.clone(), issue.touched_files.clone());
            let pool = Arc::clone(&self.pool);
            let issue = issue.clone();
            let span = create_coordination_span("dispatch", Some(&issue.id), None);
            workers.spawn(async move { pool.run_issue(issue).await }.instrument(span));
            dispatched += 1;
        }
        dispatched
    }

    async fn await_one_completion(&mut self, workers: &mut JoinSet<WorkerResult>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let shutdown_fired = async move {
            if shutdown_rx.wait_for(|requested| *requested).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            joined = workers.join_next() => match joined {
                Some(Ok(result)) => self.handle_completion(result).await,
                Some(Err(e)) => warn!(error = %e, "worker task ended abnormally"),
                None => {}
            },
            _ = shutdown_fired => {
                // Workers observe the same signal; loop back and drain them.
            }
        }
    }

    /// Classify one worker completion. Successful work is queued for merge
    /// and the specific merge awaited before any further dispatch happens.
    async fn handle_completion(&mut self, result: WorkerResult) {
        let issue_id = result.issue_id.clone();
        self.state.in_flight.remove(&issue_id);
        self.state.durations.insert(issue_id.clone(), result.duration);

        if result.interrupted {
            info!(issue_id = %issue_id, "worker interrupted by shutdown; eligible for retry");
            self.state.interrupted.insert(issue_id);
            return;
        }

        if let Some(reason) = result.close_reason.clone() {
            info!(issue_id = %issue_id, reason = %reason, "issue closed without merge");
            self.state.closed.insert(issue_id, reason);
            return;
        }

        if !result.success {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "worker failed without detail".to_string());
            warn!(issue_id = %issue_id, reason = %reason, "worker failed");
            self.state.failed.insert(issue_id, reason);
            return;
        }

        let mut ticket = self.coordinator.queue_merge(result);
        let outcome = ticket.wait().await;
        if !self.coordinator.wait_for_completion(self.merge_wait).await {
            warn!(issue_id = %issue_id, "merge queue still busy after wait limit");
        }

        match outcome.status {
            MergeStatus::Merged => {
                self.state.merged.insert(issue_id);
            }
            _ => {
                let reason = outcome
                    .error
                    .unwrap_or_else(|| "merge failed without detail".to_string());
                self.state.failed.insert(issue_id, reason);
            }
        }
    }

    /// Terminal bookkeeping for issues that can never become ready because a
    /// dependency failed, was closed, or was interrupted.
    fn fail_blocked_issues(&mut self) {
        let blocked: Vec<String> = self
            .graph
            .issues()
            .iter()
            .filter(|i| {
                !self.state.merged.contains(&i.id)
                    && !self.state.failed.contains_key(&i.id)
                    && !self.state.interrupted.contains(&i.id)
                    && !self.state.closed.contains_key(&i.id)
            })
            .map(|i| i.id.clone())
            .collect();
        for id in blocked {
            warn!(issue_id = %id, "issue blocked: dependencies will never merge");
            self.state
                .failed
                .insert(id, "blocked: a declared dependency was not merged".to_string());
        }
    }
}
