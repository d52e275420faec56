//! Prometheus metrics export
//!
//! Recording functions are no-ops until a recorder is installed, so library
//! users that never call [`init_metrics`] pay nothing.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

use crate::config::MetricsConfig;

/// Install the Prometheus exporter when enabled
pub fn init_metrics(config: &MetricsConfig) -> Result<bool> {
    if !config.enabled {
        return Ok(false);
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address {}", config.listen_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("kopia_admin_exec_duration_seconds".to_string()),
            &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )
        .context("Invalid histogram buckets")?
        .install()
        .context("Failed to install Prometheus exporter")?;

    Ok(true)
}

/// Record a captured execution
pub fn record_exec(container: &str, duration_secs: f64, outcome: &'static str) {
    counter!("kopia_admin_exec_total", "container" => container.to_string(), "outcome" => outcome).increment(1);
    histogram!("kopia_admin_exec_duration_seconds", "container" => container.to_string()).record(duration_secs);
}

/// Record the exit of an interactive dialogue
pub fn record_dialogue(outcome: &'static str) {
    counter!("kopia_admin_dialogues_total", "outcome" => outcome).increment(1);
}

/// Record a provisioning operation reaching `Settled`
pub fn record_provisioning(operation: &'static str) {
    counter!("kopia_admin_provisioning_total", "operation" => operation).increment(1);
}
