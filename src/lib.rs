// issue-swarm - parallel issue resolution with serialized mainline integration
// This exposes the core components for testing and integration

pub mod config;
pub mod git;
pub mod graph;
pub mod issue;
pub mod merge;
pub mod orchestrator;
pub mod overlap;
pub mod priority;
pub mod shutdown;
pub mod telemetry;
pub mod workers;

// Re-export key types for easy access
pub use config::SwarmConfig;
pub use git::{GitError, GitFailureKind, GitLock, GitOutput};
pub use graph::{DependencyGraph, GraphError};
pub use issue::Issue;
pub use merge::{BreakerSnapshot, MergeConfig, MergeCoordinator, MergeStatus, MergeTicket};
pub use orchestrator::{Orchestrator, RunReport};
pub use overlap::{OverlapDetector, OverlapPolicy};
pub use priority::Priority;
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use workers::{SolveOutcome, WorkerPool, WorkerPoolConfig, WorkerResult};
