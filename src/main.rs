use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use issue_swarm::config::SwarmConfig;
use issue_swarm::git::GitLock;
use issue_swarm::graph::DependencyGraph;
use issue_swarm::issue::Issue;
use issue_swarm::merge::MergeCoordinator;
use issue_swarm::orchestrator::Orchestrator;
use issue_swarm::overlap::OverlapDetector;
use issue_swarm::shutdown::ShutdownCoordinator;
use issue_swarm::telemetry::init_telemetry;
use issue_swarm::workers::WorkerPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "issue-swarm")]
#[command(about = "Parallel issue resolution with serialized mainline integration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a batch of issues concurrently and merge the results
    Run {
        /// JSON file with the issue records to resolve
        #[arg(long)]
        issues: PathBuf,
        /// Configuration file (defaults to issue-swarm.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured worker count
        #[arg(long)]
        max_workers: Option<usize>,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            issues,
            config,
            max_workers,
            json,
        } => run(issues, config, max_workers, json).await,
    }
}

async fn run(
    issues_path: PathBuf,
    config_path: Option<PathBuf>,
    max_workers: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut config = SwarmConfig::load(config_path.as_deref())?;
    if let Some(n) = max_workers {
        config.workers.max_workers = n;
    }
    init_telemetry(config.observability.json_logs)?;

    let issues = load_issues(&issues_path)?;
    let graph = DependencyGraph::new(issues).context("invalid issue set")?;

    let shutdown = Arc::new(ShutdownCoordinator::new());
    shutdown.install_ctrl_c_handler();

    let git = Arc::new(GitLock::new(Duration::from_secs(config.git_timeout_secs)));
    let pool = Arc::new(WorkerPool::new(
        config.workers.clone(),
        Arc::clone(&git),
        config.repo.root.clone(),
        config.repo.mainline.clone(),
        shutdown.subscribe(),
    ));
    let coordinator = MergeCoordinator::new(
        config.merge.clone(),
        Arc::clone(&git),
        config.repo.root.clone(),
        config.repo.mainline.clone(),
    );
    let orchestrator = Orchestrator::new(
        graph,
        OverlapDetector::new(config.overlap_policy),
        pool,
        coordinator,
        shutdown,
        Duration::from_secs(config.merge_wait_secs),
    );

    let report = orchestrator.run().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn load_issues(path: &PathBuf) -> Result<Vec<Issue>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read issue file {}", path.display()))?;
    serde_json::from_str(&raw).context("failed to parse issue records")
}

fn print_report(report: &issue_swarm::orchestrator::RunReport) {
    println!("merged:      {}", report.merged.len());
    for id in &report.merged {
        println!("  {id}");
    }
    println!("failed:      {}", report.failed.len());
    for (id, reason) in &report.failed {
        println!("  {id}: {reason}");
    }
    println!("closed:      {}", report.closed.len());
    for (id, reason) in &report.closed {
        println!("  {id}: {reason}");
    }
    println!("interrupted: {} (retryable)", report.interrupted.len());
    for id in &report.interrupted {
        println!("  {id}");
    }
    if report.breaker_tripped {
        println!("circuit breaker tripped: integration halted pending manual intervention");
    }
}
