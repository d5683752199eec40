//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::config::duration::parse_kubernetes_duration;
use crate::controller::backoff::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;

/// How a failure to resolve `parametersFrom` secrets is retried.
///
/// Secrets commonly arrive after the resource that references them, so the
/// default keeps retrying within the ordinary retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParametersErrorPolicy {
    /// Retry under `reconciliation_retry_duration`, then fail terminally
    #[default]
    RetryWithinBudget,
    /// Keep retrying at the capped backoff forever
    RetryIndefinitely,
    /// Fail terminally on the first resolution error
    FailImmediately,
}

impl ParametersErrorPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ParametersErrorPolicy::RetryWithinBudget => "retry-within-budget",
            ParametersErrorPolicy::RetryIndefinitely => "retry-indefinitely",
            ParametersErrorPolicy::FailImmediately => "fail-immediately",
        }
    }
}

impl FromStr for ParametersErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "retry-within-budget" => Ok(ParametersErrorPolicy::RetryWithinBudget),
            "retry-indefinitely" => Ok(ParametersErrorPolicy::RetryIndefinitely),
            "fail-immediately" => Ok(ParametersErrorPolicy::FailImmediately),
            other => Err(format!("unknown parameters error policy '{other}'")),
        }
    }
}

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent reconciliations per resource kind
    pub concurrent_syncs: usize,
    /// Maximum time to keep retrying an operation before marking it failed
    pub reconciliation_retry_duration: Duration,
    /// First delay before polling an asynchronous broker operation
    pub operation_polling_initial_backoff: Duration,
    /// Upper bound of the poll and retry backoff
    pub operation_polling_maximum_backoff: Duration,
    /// Growth factor of the poll and retry backoff
    pub backoff_multiplier: u32,
    /// First delay before retrying a failed synchronous broker call
    pub retry_initial_backoff: Duration,
    /// Per-request timeout for broker calls
    pub osb_api_request_timeout: Duration,
    /// Value of the `X-Broker-API-Version` header
    pub osb_api_preferred_version: String,
    /// Interval on which every known resource is reconciled again
    pub resync_interval: Duration,
    /// Interval after which a cached broker catalog is fetched again
    pub broker_relist_interval: Duration,
    /// Delay before restarting a watch stream after it ends or errors
    pub watch_restart_delay: Duration,
    /// Retry behaviour for `parametersFrom` resolution failures
    pub parameters_error_policy: ParametersErrorPolicy,
    /// Port of the metrics and probe server
    pub metrics_port: u16,
    /// Global log level used when `RUST_LOG` is not set
    pub log_level: String,
    /// Sent to brokers as the organization GUID of provision requests
    pub cluster_id: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            concurrent_syncs: DEFAULT_CONCURRENT_SYNCS,
            reconciliation_retry_duration: Duration::from_secs(
                DEFAULT_RECONCILIATION_RETRY_DURATION_SECS,
            ),
            operation_polling_initial_backoff: Duration::from_secs(
                DEFAULT_OPERATION_POLLING_INITIAL_BACKOFF_SECS,
            ),
            operation_polling_maximum_backoff: Duration::from_secs(
                DEFAULT_OPERATION_POLLING_MAXIMUM_BACKOFF_SECS,
            ),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            retry_initial_backoff: Duration::from_secs(DEFAULT_RETRY_INITIAL_BACKOFF_SECS),
            osb_api_request_timeout: Duration::from_secs(DEFAULT_OSB_API_REQUEST_TIMEOUT_SECS),
            osb_api_preferred_version: DEFAULT_OSB_API_PREFERRED_VERSION.to_string(),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            broker_relist_interval: Duration::from_secs(DEFAULT_BROKER_RELIST_INTERVAL_SECS),
            watch_restart_delay: Duration::from_secs(DEFAULT_WATCH_RESTART_DELAY_SECS),
            parameters_error_policy: ParametersErrorPolicy::default(),
            metrics_port: DEFAULT_METRICS_PORT,
            log_level: "INFO".to_string(),
            cluster_id: DEFAULT_CLUSTER_ID.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrent_syncs: env_var_or_default("CONCURRENT_SYNCS", defaults.concurrent_syncs)
                .max(1),
            reconciliation_retry_duration: env_duration_or_default(
                "RECONCILIATION_RETRY_DURATION",
                defaults.reconciliation_retry_duration,
            ),
            operation_polling_initial_backoff: env_duration_or_default(
                "OPERATION_POLLING_INITIAL_BACKOFF",
                defaults.operation_polling_initial_backoff,
            ),
            operation_polling_maximum_backoff: env_duration_or_default(
                "OPERATION_POLLING_MAXIMUM_BACKOFF_DURATION",
                defaults.operation_polling_maximum_backoff,
            ),
            backoff_multiplier: env_var_or_default(
                "OPERATION_POLLING_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            )
            .max(1),
            retry_initial_backoff: env_duration_or_default(
                "RETRY_INITIAL_BACKOFF",
                defaults.retry_initial_backoff,
            ),
            osb_api_request_timeout: env_duration_or_default(
                "OSB_API_REQUEST_TIMEOUT",
                defaults.osb_api_request_timeout,
            ),
            osb_api_preferred_version: env_var_or_default_str(
                "OSB_API_PREFERRED_VERSION",
                &defaults.osb_api_preferred_version,
            ),
            resync_interval: env_duration_or_default("RESYNC_INTERVAL", defaults.resync_interval),
            broker_relist_interval: env_duration_or_default(
                "BROKER_RELIST_INTERVAL",
                defaults.broker_relist_interval,
            ),
            watch_restart_delay: env_duration_or_default(
                "WATCH_RESTART_DELAY",
                defaults.watch_restart_delay,
            ),
            parameters_error_policy: env_var_or_default(
                "PARAMETERS_ERROR_POLICY",
                defaults.parameters_error_policy,
            ),
            metrics_port: env_var_or_default("METRICS_PORT", defaults.metrics_port),
            log_level: env_var_or_default_str("LOG_LEVEL", &defaults.log_level),
            cluster_id: env_var_or_default_str("CLUSTER_ID", &defaults.cluster_id),
        }
    }

    /// Backoff and retry budget derived from this configuration
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_duration: self.reconciliation_retry_duration,
            poll_initial: self.operation_polling_initial_backoff,
            retry_initial: self.retry_initial_backoff,
            max_delay: self.operation_polling_maximum_backoff,
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value '{}' for {}", raw, key);
            default
        }),
        Err(_) => default,
    }
}

/// Read environment variable as a Kubernetes duration string or return default
fn env_duration_or_default(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => parse_kubernetes_duration(&raw).unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid duration for {}: {}", key, e);
            default
        }),
        Err(_) => default,
    }
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
