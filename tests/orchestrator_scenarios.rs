//! End-to-end orchestrator runs against real repositories with scripted
//! solve tools.

#![cfg(unix)]

mod common;

use common::{init_repo, write_solve_script};
use issue_swarm::git::GitLock;
use issue_swarm::graph::DependencyGraph;
use issue_swarm::issue::Issue;
use issue_swarm::merge::{MergeConfig, MergeCoordinator};
use issue_swarm::orchestrator::{Orchestrator, RunReport};
use issue_swarm::overlap::{OverlapDetector, OverlapPolicy};
use issue_swarm::shutdown::ShutdownCoordinator;
use issue_swarm::workers::{WorkerPool, WorkerPoolConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    orchestrator: Orchestrator,
    shutdown: Arc<ShutdownCoordinator>,
}

fn harness(root: &Path, solve: &Path, issues: Vec<Issue>, max_workers: usize) -> Harness {
    let graph = DependencyGraph::new(issues).expect("valid issue set");
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let git = Arc::new(GitLock::new(Duration::from_secs(30)));

    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig {
            max_workers,
            solve_command: vec![solve.to_string_lossy().into_owned()],
            solve_timeout_secs: 60,
            grace_period_secs: 5,
            worktree_root: root.join(".swarm").join("worktrees"),
            aux_files: Vec::new(),
            branch_prefix: "swarm/".to_string(),
        },
        Arc::clone(&git),
        root.to_path_buf(),
        "main".to_string(),
        shutdown.subscribe(),
    ));
    let coordinator = MergeCoordinator::new(
        MergeConfig {
            breaker_threshold: 3,
            sync_with_remote: false,
            remote: "origin".to_string(),
        },
        git,
        root.to_path_buf(),
        "main".to_string(),
    );
    let orchestrator = Orchestrator::new(
        graph,
        OverlapDetector::new(OverlapPolicy::Serialize),
        pool,
        coordinator,
        Arc::clone(&shutdown),
        Duration::from_secs(60),
    );
    Harness {
        orchestrator,
        shutdown,
    }
}

/// Script that records its dispatch order, commits one file, and reports
/// implemented.
fn committing_script(root: &Path, log: &Path) -> std::path::PathBuf {
    write_solve_script(
        root,
        &format!(
            "echo \"$id\" >> {log}\n\
             echo work > \"solved_$id.txt\"\n\
             git add .\n\
             git commit -q -m \"solve $id\"\n\
             printf '{{\"outcome\": \"implemented\"}}\\n'",
            log = log.display()
        ),
    )
}

#[tokio::test]
async fn dependent_issue_runs_only_after_its_dependency_merges() {
    let repo = init_repo();
    let root = repo.path();
    let log = root.join("dispatch.log");
    let script = committing_script(root, &log);

    let issues = vec![
        Issue::new("BUG-001"),
        Issue::new("ENH-010").with_dependency("BUG-001"),
    ];
    let h = harness(root, &script, issues, 2);
    let report: RunReport = h.orchestrator.run().await;

    assert_eq!(report.merged, vec!["BUG-001", "ENH-010"]);
    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);

    let order = std::fs::read_to_string(&log).unwrap();
    let order: Vec<&str> = order.lines().collect();
    assert_eq!(order, vec!["BUG-001", "ENH-010"]);

    // Both branches landed on the mainline.
    assert!(root.join("solved_BUG-001.txt").exists());
    assert!(root.join("solved_ENH-010.txt").exists());
}

#[tokio::test]
async fn independent_issues_all_merge() {
    let repo = init_repo();
    let root = repo.path();
    let log = root.join("dispatch.log");
    let script = committing_script(root, &log);

    let issues = vec![Issue::new("A-1"), Issue::new("A-2"), Issue::new("A-3")];
    let h = harness(root, &script, issues, 2);
    let report = h.orchestrator.run().await;

    assert_eq!(report.merged, vec!["A-1", "A-2", "A-3"]);
    assert!(report.failed.is_empty());
    assert!(!report.breaker_tripped);
    for id in ["A-1", "A-2", "A-3"] {
        assert!(report.durations_ms.contains_key(id));
    }
}

#[tokio::test]
async fn close_outcome_is_reported_separately_from_failure() {
    let repo = init_repo();
    let root = repo.path();
    let script = write_solve_script(
        root,
        "printf '{\"outcome\": \"close\", \"reason\": \"duplicate\"}\\n'",
    );

    let issues = vec![Issue::new("DUP-1")];
    let h = harness(root, &script, issues, 1);
    let report = h.orchestrator.run().await;

    assert!(report.merged.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(report.closed.get("DUP-1").map(String::as_str), Some("duplicate"));
}

#[tokio::test]
async fn dependents_of_a_failed_issue_are_reported_blocked() {
    let repo = init_repo();
    let root = repo.path();
    let script = write_solve_script(
        root,
        "printf '{\"outcome\": \"failed\", \"reason\": \"could not reproduce\"}\\n'",
    );

    let issues = vec![
        Issue::new("FAIL-1"),
        Issue::new("DEP-2").with_dependency("FAIL-1"),
    ];
    let h = harness(root, &script, issues, 2);
    let report = h.orchestrator.run().await;

    assert!(report.merged.is_empty());
    assert_eq!(
        report.failed.get("FAIL-1").map(String::as_str),
        Some("could not reproduce")
    );
    let blocked = report.failed.get("DEP-2").unwrap();
    assert!(blocked.contains("blocked"), "unexpected reason: {blocked}");
}

#[tokio::test]
async fn shutdown_reports_in_flight_work_as_interrupted() {
    let repo = init_repo();
    let root = repo.path();
    let script = write_solve_script(root, "exec sleep 30");

    let issues = vec![Issue::new("LONG-1")];
    let h = harness(root, &script, issues, 1);
    let shutdown = Arc::clone(&h.shutdown);

    let runner = tokio::spawn(h.orchestrator.run());
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.request_shutdown();

    let report = runner.await.unwrap();
    assert_eq!(report.interrupted, vec!["LONG-1"]);
    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
    assert!(report.merged.is_empty());
}
