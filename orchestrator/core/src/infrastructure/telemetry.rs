// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process-wide logging and metrics setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Metrics recorded by
//! the orchestrator and monitors are no-ops until an exporter is installed.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{IpAddr, SocketAddr};
use tracing_subscriber::EnvFilter;

use crate::domain::node_config::{LoggingConfig, MetricsConfig};

/// Install the global tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let json = match config.format.as_str() {
        "json" => true,
        "text" => false,
        other => anyhow::bail!("Unknown log format '{}'", other),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

/// Start the Prometheus scrape endpoint. Must run inside a tokio runtime.
pub fn install_metrics_exporter(config: &MetricsConfig) -> Result<SocketAddr> {
    let addr = metrics_addr(config)?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe_metrics();
    tracing::info!("Metrics exposed on http://{}/metrics", addr);
    Ok(addr)
}

fn metrics_addr(config: &MetricsConfig) -> Result<SocketAddr> {
    let ip: IpAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid metrics bind address '{}'", config.bind_address))?;
    Ok(SocketAddr::new(ip, config.port))
}

fn describe_metrics() {
    metrics::describe_counter!(
        "mindr_containers_started_total",
        "Agent containers started"
    );
    metrics::describe_counter!(
        "mindr_containers_stopped_total",
        "Agent containers stopped and removed"
    );
    metrics::describe_counter!(
        "mindr_containers_failed_total",
        "Agent containers marked failed by their monitor"
    );
    metrics::describe_counter!(
        "mindr_resource_limit_breaches_total",
        "Resource limit breaches, by resource"
    );
    metrics::describe_gauge!(
        "mindr_containers_tracked",
        "Containers currently tracked by the orchestrator"
    );
}
