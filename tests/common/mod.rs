//! Shared harness for integration tests: real git repositories in
//! temporary directories.

#![allow(dead_code)]

use issue_swarm::workers::WorkerResult;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

/// Run a git command for test setup, panicking on failure.
pub fn git(root: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .expect("git should be runnable");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

pub fn git_stdout(root: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .expect("git should be runnable");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Initialize a repository with a `main` branch and one seed commit.
pub fn init_repo() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path();
    git(root, &["init", "-q"]);
    git(root, &["checkout", "-q", "-b", "main"]);
    git(root, &["config", "user.name", "Swarm Test"]);
    git(root, &["config", "user.email", "swarm@example.com"]);
    git(root, &["config", "commit.gpgsign", "false"]);
    std::fs::write(root.join("README.md"), "seed\n").expect("write seed");
    git(root, &["add", "."]);
    git(root, &["commit", "-q", "-m", "initial commit"]);
    dir
}

/// Create a worker branch plus worktree with one committed change, the way
/// the worker pool leaves things for the merge coordinator.
pub fn make_worker_branch(root: &Path, issue_id: &str) -> (String, PathBuf) {
    let branch = format!("swarm/{issue_id}");
    let worktree = root.join(".swarm").join("worktrees").join(issue_id);
    std::fs::create_dir_all(worktree.parent().expect("parent")).expect("mkdir");
    git(
        root,
        &[
            "worktree",
            "add",
            "-q",
            "-B",
            &branch,
            worktree.to_str().expect("utf8 path"),
            "main",
        ],
    );
    std::fs::write(
        worktree.join(format!("solved_{issue_id}.txt")),
        format!("work for {issue_id}\n"),
    )
    .expect("write change");
    git(&worktree, &["add", "."]);
    git(&worktree, &["commit", "-q", "-m", &format!("solve {issue_id}")]);
    (branch, worktree)
}

/// A successful WorkerResult pointing at an existing branch/worktree.
pub fn worker_result(issue_id: &str, branch: &str, worktree: &Path) -> WorkerResult {
    WorkerResult {
        issue_id: issue_id.to_string(),
        success: true,
        interrupted: false,
        branch_name: branch.to_string(),
        worktree_path: worktree.to_path_buf(),
        duration: Duration::from_millis(1),
        error: None,
        close_reason: None,
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// A WorkerResult whose branch does not exist, guaranteed to fail to merge.
pub fn bogus_result(issue_id: &str) -> WorkerResult {
    WorkerResult {
        issue_id: issue_id.to_string(),
        success: true,
        interrupted: false,
        branch_name: format!("swarm/{issue_id}"),
        worktree_path: PathBuf::from("/nonexistent"),
        duration: Duration::from_millis(1),
        error: None,
        close_reason: None,
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// Write an executable solve script the worker pool can exec directly
/// (argv invocation, no shell interpolation by the pool).
#[cfg(unix)]
pub fn write_solve_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("solve.sh");
    let script = format!(
        "#!/bin/sh\nid=\"\"\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"--issue\" ]; then id=\"$2\"; shift 2; else shift 1; fi\ndone\n{body}\n"
    );
    std::fs::write(&path, script).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("stat").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}
