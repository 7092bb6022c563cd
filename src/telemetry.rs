use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize structured logging. JSON output when `json` is set, compact
/// human-readable otherwise; level is taken from `RUST_LOG` with `info` as
/// the fallback.
pub fn init_telemetry(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().compact())
            .with(filter)
            .init();
    }

    tracing::info!("issue-swarm telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span with common dispatch/merge attributes
pub fn create_coordination_span(
    operation: &str,
    issue_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "swarm_coordination",
        operation = operation,
        issue.id = issue_id,
        correlation.id = correlation_id,
    )
}
