//! Prometheus recorder and metric names shared across the crate.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Provider calls (counter, labels: provider, outcome).
pub const GENERATIONS_TOTAL: &str = "nebula_generations_total";
/// Provider call latency (histogram, labels: provider).
pub const GENERATION_DURATION_SECONDS: &str = "nebula_generation_duration_seconds";
/// Coins debited from callers (counter).
pub const BILLED_COINS_TOTAL: &str = "nebula_billed_coins_total";
/// Coins credited to creators (counter, labels: event_type).
pub const REVENUE_CREDITED_TOTAL: &str = "nebula_revenue_credited_total";
/// Summarization runs (counter, labels: outcome).
pub const SUMMARIZATIONS_TOTAL: &str = "nebula_summarizations_total";

/// Installs the global recorder. Call once at startup.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus recorder installed");
    Ok(handle)
}
