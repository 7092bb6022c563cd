//! Pre-flight overlap detection between dispatch candidates.
//!
//! Issues that declare touched-file hints intersecting another candidate's
//! hints (or the hints of work already in flight) are likely to produce
//! merge conflicts if run concurrently. Detection here only reduces that
//! risk; the merge coordinator still handles real conflicts.

use crate::issue::Issue;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Defer the overlapping issue until the earlier one completes and
    /// merges. A soft delay: the deferred issue stays eligible and is
    /// re-evaluated on the next scheduling pass.
    #[default]
    Serialize,
    /// Dispatch both and log a warning, accepting higher conflict risk.
    Warn,
}

/// Outcome of one partitioning pass over the ready set.
#[derive(Debug, Default)]
pub struct DispatchPlan<'a> {
    pub dispatch: Vec<&'a Issue>,
    pub deferred: Vec<&'a Issue>,
}

pub struct OverlapDetector {
    policy: OverlapPolicy,
}

impl OverlapDetector {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// Partition `candidates` (already in dispatch order) into issues safe to
    /// dispatch now and issues deferred to a later pass. `in_flight_files`
    /// holds the touched-file hints of issues currently running.
    ///
    /// Issues without hints never overlap anything.
    pub fn partition<'a>(
        &self,
        candidates: &[&'a Issue],
        in_flight_files: &HashSet<PathBuf>,
    ) -> DispatchPlan<'a> {
        let mut plan = DispatchPlan::default();
        let mut claimed: HashSet<PathBuf> = in_flight_files.clone();

        for &issue in candidates {
            let overlapping: Vec<&PathBuf> = issue
                .touched_files
                .iter()
                .filter(|f| claimed.contains(*f))
                .collect();

            if overlapping.is_empty() {
                claimed.extend(issue.touched_files.iter().cloned());
                plan.dispatch.push(issue);
                continue;
            }

            match self.policy {
                OverlapPolicy::Serialize => {
                    warn!(
                        issue_id = %issue.id,
                        files = ?overlapping,
                        "deferring dispatch: touched files overlap in-flight work"
                    );
                    plan.deferred.push(issue);
                }
                OverlapPolicy::Warn => {
                    warn!(
                        issue_id = %issue.id,
                        files = ?overlapping,
                        "dispatching despite file overlap; merge conflicts likely"
                    );
                    claimed.extend(issue.touched_files.iter().cloned());
                    plan.dispatch.push(issue);
                }
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_with_files(id: &str, files: &[&str]) -> Issue {
        let mut issue = Issue::new(id);
        for f in files {
            issue = issue.with_touched_file(*f);
        }
        issue
    }

    #[test]
    fn non_overlapping_issues_all_dispatch() {
        let a = issue_with_files("A", &["src/a.rs"]);
        let b = issue_with_files("B", &["src/b.rs"]);
        let detector = OverlapDetector::new(OverlapPolicy::Serialize);

        let plan = detector.partition(&[&a, &b], &HashSet::new());
        assert_eq!(plan.dispatch.len(), 2);
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn serialize_defers_overlapping_candidate() {
        let a = issue_with_files("A", &["src/shared.rs"]);
        let b = issue_with_files("B", &["src/shared.rs", "src/b.rs"]);
        let detector = OverlapDetector::new(OverlapPolicy::Serialize);

        let plan = detector.partition(&[&a, &b], &HashSet::new());
        assert_eq!(plan.dispatch.len(), 1);
        assert_eq!(plan.dispatch[0].id, "A");
        assert_eq!(plan.deferred.len(), 1);
        assert_eq!(plan.deferred[0].id, "B");
    }

    #[test]
    fn serialize_defers_against_in_flight_files() {
        let a = issue_with_files("A", &["src/lib.rs"]);
        let detector = OverlapDetector::new(OverlapPolicy::Serialize);

        let in_flight: HashSet<PathBuf> = [PathBuf::from("src/lib.rs")].into();
        let plan = detector.partition(&[&a], &in_flight);
        assert!(plan.dispatch.is_empty());
        assert_eq!(plan.deferred.len(), 1);
    }

    #[test]
    fn warn_policy_dispatches_everything() {
        let a = issue_with_files("A", &["src/shared.rs"]);
        let b = issue_with_files("B", &["src/shared.rs"]);
        let detector = OverlapDetector::new(OverlapPolicy::Warn);

        let plan = detector.partition(&[&a, &b], &HashSet::new());
        assert_eq!(plan.dispatch.len(), 2);
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn issues_without_hints_never_overlap() {
        let a = issue_with_files("A", &[]);
        let b = issue_with_files("B", &[]);
        let detector = OverlapDetector::new(OverlapPolicy::Serialize);

        let in_flight: HashSet<PathBuf> = [PathBuf::from("src/lib.rs")].into();
        let plan = detector.partition(&[&a, &b], &in_flight);
        assert_eq!(plan.dispatch.len(), 2);
    }
}
