//! # Service Catalog Controller
//!
//! A Kubernetes controller that provisions and binds Open Service Broker API
//! services on behalf of `ServiceInstance` and `ServiceBinding` resources.
//!
//! ## Overview
//!
//! 1. **Provision** - `ServiceInstance` resources are provisioned, updated and
//!    deprovisioned against the broker registered for their class
//! 2. **Bind** - `ServiceBinding` resources obtain credentials from the broker
//!    and write them into a Secret in the binding's namespace
//! 3. **Orphan mitigation** - ambiguous broker failures are cleaned up with a
//!    deprovision or unbind before the controller gives up
//!
//! Configuration comes from environment variables; the flags below override
//! the most commonly tuned ones.

use anyhow::{Context, Result};
use clap::Parser;
use service_catalog_controller::config::{ControllerConfig, parse_kubernetes_duration};
use service_catalog_controller::runtime::{initialization::initialize, watch_loop::run_watch_loop};
use std::time::Duration;

/// Service Catalog Controller
#[derive(Parser, Debug)]
#[command(name = "service-catalog-controller")]
#[command(about = "Reconciles ServiceInstance and ServiceBinding resources against OSB brokers", long_about = None)]
struct Cli {
    /// Concurrent reconciliations per resource kind
    #[arg(long)]
    concurrent_syncs: Option<usize>,

    /// How long failed operations are retried before they are marked failed (e.g. "1w", "30m")
    #[arg(long, value_parser = parse_duration_arg)]
    reconciliation_retry_duration: Option<Duration>,

    /// Upper bound of the operation polling backoff (e.g. "20m")
    #[arg(long, value_parser = parse_duration_arg)]
    operation_polling_maximum_backoff_duration: Option<Duration>,

    /// Per-request timeout for broker calls (e.g. "60s")
    #[arg(long, value_parser = parse_duration_arg)]
    osb_api_request_timeout: Option<Duration>,

    /// Interval on which every resource is reconciled again (e.g. "5m")
    #[arg(long, value_parser = parse_duration_arg)]
    resync_interval: Option<Duration>,

    /// Interval after which broker catalogs are fetched again (e.g. "15m")
    #[arg(long, value_parser = parse_duration_arg)]
    broker_relist_interval: Option<Duration>,

    /// Port of the metrics and probe server
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn parse_duration_arg(raw: &str) -> Result<Duration, String> {
    parse_kubernetes_duration(raw).map_err(|e| e.to_string())
}

impl Cli {
    fn apply(self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(concurrent_syncs) = self.concurrent_syncs {
            config.concurrent_syncs = concurrent_syncs.max(1);
        }
        if let Some(duration) = self.reconciliation_retry_duration {
            config.reconciliation_retry_duration = duration;
        }
        if let Some(duration) = self.operation_polling_maximum_backoff_duration {
            config.operation_polling_maximum_backoff = duration;
        }
        if let Some(duration) = self.osb_api_request_timeout {
            config.osb_api_request_timeout = duration;
        }
        if let Some(duration) = self.resync_interval {
            config.resync_interval = duration;
        }
        if let Some(duration) = self.broker_relist_interval {
            config.broker_relist_interval = duration;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().apply(ControllerConfig::from_env());

    let init = initialize(config)
        .await
        .context("Failed to initialize controller")?;

    run_watch_loop(
        init.client,
        init.reconciler,
        init.server_state,
        init.controller_config,
    )
    .await
}
