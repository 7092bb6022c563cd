//! Classification of git command failures.
//!
//! Maps the text git emits on a failed command onto a closed set of kinds
//! via a prioritized rule table, so the merge coordinator can route each
//! failure to the right handler. The table is plain data and testable
//! without any real git invocation.

/// Closed set of failure kinds the merge coordinator routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitFailureKind {
    /// A previous merge or rebase was left half-finished (stuck markers,
    /// unmerged index entries). Handled by the recovery ladder.
    IndexCorruption,
    /// Untracked files in the working tree would be overwritten.
    UntrackedConflict,
    /// Pull refused because of uncommitted local changes.
    PullConflict,
    /// Ordinary content conflict between the branches being merged.
    MergeConflict,
    Unknown,
}

/// Prioritized match rules; the first rule whose needle appears in the
/// failure text (case-insensitive) wins. Order matters: index-state markers
/// first, then the overwrite variants, with the generic conflict text last.
const CLASSIFY_RULES: &[(&str, GitFailureKind)] = &[
    (
        "you have not concluded your merge",
        GitFailureKind::IndexCorruption,
    ),
    ("merge_head exists", GitFailureKind::IndexCorruption),
    (
        "you are in the middle of a merge",
        GitFailureKind::IndexCorruption,
    ),
    ("rebase in progress", GitFailureKind::IndexCorruption),
    (
        "you are currently rebasing",
        GitFailureKind::IndexCorruption,
    ),
    ("needs merge", GitFailureKind::IndexCorruption),
    (
        "you have unmerged files",
        GitFailureKind::IndexCorruption,
    ),
    (
        "unmerged files",
        GitFailureKind::IndexCorruption,
    ),
    (
        "untracked working tree files would be overwritten",
        GitFailureKind::UntrackedConflict,
    ),
    (
        "your local changes to the following files would be overwritten",
        GitFailureKind::PullConflict,
    ),
    (
        "cannot pull with rebase: you have unstaged changes",
        GitFailureKind::PullConflict,
    ),
    (
        "please commit your changes or stash them",
        GitFailureKind::PullConflict,
    ),
    ("conflict (", GitFailureKind::MergeConflict),
    (
        "automatic merge failed; fix conflicts",
        GitFailureKind::MergeConflict,
    ),
    (
        "merge conflict in",
        GitFailureKind::MergeConflict,
    ),
];

/// Classify the combined stdout/stderr of a failed git command.
pub fn classify_failure(text: &str) -> GitFailureKind {
    let lowered = text.to_lowercase();
    for (needle, kind) in CLASSIFY_RULES {
        if lowered.contains(needle) {
            return *kind;
        }
    }
    GitFailureKind::Unknown
}

/// Extract the conflicting file list from an untracked-conflict message:
///
/// ```text
/// error: The following untracked working tree files would be overwritten by merge:
///         src/generated.rs
///         docs/api.md
/// Please move or remove them before you merge.
/// ```
///
/// Returns `None` when the list cannot be parsed, which the coordinator
/// reports as an explicit failure rather than guessing.
pub fn parse_untracked_conflicts(text: &str) -> Option<Vec<String>> {
    // Scan line by line; lowercasing can change byte lengths (e.g. dotted
    // capital I), so offsets computed on a lowercased copy must never be
    // used to slice the original text.
    let mut lines = text.lines();
    lines.find(|line| {
        line.to_lowercase()
            .contains("untracked working tree files would be overwritten")
    })?;

    let mut files = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lowered = trimmed.to_lowercase();
        if lowered.starts_with("please move or remove")
            || lowered.starts_with("aborting")
            || lowered.starts_with("error:")
        {
            break;
        }
        // File entries are indented under the header.
        if line.starts_with(' ') || line.starts_with('\t') {
            files.push(trimmed.to_string());
        } else {
            break;
        }
    }

    if files.is_empty() {
        None
    } else {
        Some(files)
    }
}
