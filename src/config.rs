use crate::merge::MergeConfig;
use crate::overlap::OverlapPolicy;
use crate::workers::WorkerPoolConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for issue-swarm. Layered: built-in defaults, then
/// `issue-swarm.toml`, then `ISSUE_SWARM_*` environment variables
/// (double underscore as section separator, e.g.
/// `ISSUE_SWARM_REPO__MAINLINE=main`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub repo: RepoConfig,
    pub workers: WorkerPoolConfig,
    pub merge: MergeConfig,
    pub overlap_policy: OverlapPolicy,
    pub observability: ObservabilityConfig,
    /// Per-command git timeout in seconds
    pub git_timeout_secs: u64,
    /// Upper bound on waiting for the merge queue to drain, in seconds
    pub merge_wait_secs: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            repo: RepoConfig::default(),
            workers: WorkerPoolConfig::default(),
            merge: MergeConfig::default(),
            overlap_policy: OverlapPolicy::default(),
            observability: ObservabilityConfig::default(),
            git_timeout_secs: 30,
            merge_wait_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Working copy of the mainline repository
    pub root: PathBuf,
    /// Shared integration branch
    pub mainline: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            mainline: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Emit JSON log lines instead of the compact format
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { json_logs: false }
    }
}

impl SwarmConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let builder = match path {
            Some(p) => Config::builder().add_source(File::from(p)),
            None => Config::builder().add_source(File::with_name("issue-swarm").required(false)),
        };
        let settings = builder
            .add_source(Environment::with_prefix("ISSUE_SWARM").separator("__"))
            .build()
            .context("failed to load configuration")?;
        settings
            .try_deserialize()
            .context("invalid configuration values")
    }
}
