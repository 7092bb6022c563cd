//! Contract with the external solve tool.
//!
//! The tool is a black box invoked per issue; it reports its outcome as a
//! structured JSON object on the last non-empty line of stdout:
//!
//! ```text
//! {"outcome": "implemented"}
//! {"outcome": "failed", "reason": "tests did not pass"}
//! {"outcome": "close", "reason": "duplicate of BUG-007"}
//! ```
//!
//! When no structured line is present the exit status decides.

use serde::Deserialize;

/// Classified result of one solve invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    /// The issue was implemented; the branch is ready to merge.
    Implemented,
    Failed { reason: String },
    /// The issue should be closed without a merge (invalid, duplicate, ...).
    Closed { reason: String },
}

#[derive(Debug, Deserialize)]
struct SolveReport {
    outcome: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse the solve tool's stdout plus exit status into an outcome.
pub fn parse_solve_output(stdout: &str, exit_success: bool) -> SolveOutcome {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(report) = serde_json::from_str::<SolveReport>(trimmed) {
            let reason = report.reason.unwrap_or_default();
            return match report.outcome.as_str() {
                "implemented" => SolveOutcome::Implemented,
                "close" => SolveOutcome::Closed { reason },
                "failed" => SolveOutcome::Failed {
                    reason: if reason.is_empty() {
                        "solve tool reported failure".to_string()
                    } else {
                        reason
                    },
                },
                other => SolveOutcome::Failed {
                    reason: format!("solve tool reported unknown outcome '{other}'"),
                },
            };
        }
        // Last non-empty line was not structured; fall back to exit status.
        break;
    }

    if exit_success {
        SolveOutcome::Implemented
    } else {
        SolveOutcome::Failed {
            reason: "solve subprocess exited non-zero".to_string(),
        }
    }
}
