//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8444;

/// Default number of concurrent reconciliations per resource kind
pub const DEFAULT_CONCURRENT_SYNCS: usize = 5;

/// Default maximum time to keep retrying a failed operation before giving up (7 days)
pub const DEFAULT_RECONCILIATION_RETRY_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default first delay before polling an asynchronous broker operation (seconds)
pub const DEFAULT_OPERATION_POLLING_INITIAL_BACKOFF_SECS: u64 = 1;

/// Default maximum delay between polls of an asynchronous broker operation (20 minutes)
pub const DEFAULT_OPERATION_POLLING_MAXIMUM_BACKOFF_SECS: u64 = 20 * 60;

/// Default growth factor of the poll and retry backoff
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Default first delay before retrying a failed synchronous broker call (seconds)
pub const DEFAULT_RETRY_INITIAL_BACKOFF_SECS: u64 = 5;

/// Default per-request timeout for broker calls (seconds)
pub const DEFAULT_OSB_API_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default value sent in the `X-Broker-API-Version` header
pub const DEFAULT_OSB_API_PREFERRED_VERSION: &str = "2.13";

/// Default interval on which every known resource is reconciled again (5 minutes)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 5 * 60;

/// Default interval after which a broker catalog is fetched again (24 hours)
pub const DEFAULT_BROKER_RELIST_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Default delay before restarting a watch stream after it ends or errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default organization GUID sent with provision requests
pub const DEFAULT_CLUSTER_ID: &str = "service-catalog";

/// Finalizer held on instances and bindings until the broker side is cleaned up
pub const FINALIZER_NAME: &str = "servicecatalog.k8s.io/controller";

/// Field manager used for server-side apply of credential secrets
pub const FIELD_MANAGER: &str = "service-catalog-controller";

/// Platform reported in the OSB originating identity header
pub const ORIGINATING_IDENTITY_PLATFORM: &str = "kubernetes";

/// Placeholder recorded in status for parameter values that came from secrets
pub const REDACTED_PARAMETER_VALUE: &str = "<redacted>";
