//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, and Kubernetes client setup.

use crate::broker::{BrokerRegistry, KubeBrokerRegistry};
use crate::config::{ControllerConfig, SharedControllerConfig};
use crate::constants::DEFAULT_SERVER_STARTUP_TIMEOUT_SECS;
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{ServerState, start_server};
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::observability;
use crate::store::{KubeResourceStore, KubeSecretStore, ResourceStore, SecretStore};
use anyhow::{Context, Result};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, error, info, warn};

const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler context
    pub reconciler: Arc<Reconciler>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub controller_config: SharedControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("controller_config", &self.controller_config)
            .finish_non_exhaustive()
    }
}

/// Install the tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise `log_level` applies to this crate.
pub fn init_tracing(log_level: &str) {
    let fallback = format!("service_catalog_controller={}", log_level.to_lowercase());
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .try_init()
    {
        eprintln!("Tracing subscriber already initialized: {e}");
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reconciler setup
/// - Startup summary of existing resources
///
/// # Errors
/// Returns an error if the server cannot start, the Kubernetes client cannot
/// be created or metrics fail to register
pub async fn initialize(config: ControllerConfig) -> Result<InitializationResult> {
    // Must happen before anything opens a TLS connection
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    init_tracing(&config.log_level);

    info!("Starting Service Catalog Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let controller_config: SharedControllerConfig = Arc::new(config);
    info!("Configuration: {:?}", controller_config);

    let server_state = Arc::new(ServerState::default());
    let server_port = controller_config.metrics_port;
    let server_handle = {
        let server_state = Arc::clone(&server_state);
        tokio::spawn(async move {
            if let Err(e) = start_server(server_port, server_state).await {
                error!("HTTP server error: {}", e);
            }
        })
    };
    wait_for_server_ready(&server_state, &server_handle).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let instances: Arc<dyn ResourceStore<ServiceInstance>> =
        Arc::new(KubeResourceStore::new(client.clone()));
    let bindings: Arc<dyn ResourceStore<ServiceBinding>> =
        Arc::new(KubeResourceStore::new(client.clone()));
    let secrets: Arc<dyn SecretStore> = Arc::new(KubeSecretStore::new(client.clone()));
    let brokers: Arc<dyn BrokerRegistry> = Arc::new(KubeBrokerRegistry::new(
        client.clone(),
        Arc::clone(&secrets),
        Arc::clone(&controller_config),
    ));
    let reconciler = Arc::new(Reconciler::new(
        instances,
        bindings,
        secrets,
        brokers,
        Arc::clone(&controller_config),
    ));

    log_existing_resources(&reconciler)
        .instrument(tracing::info_span!("controller.startup.existing_resources"))
        .await;

    info!("Controller initialized, starting watch loop...");
    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
        controller_config,
    })
}

async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(DEFAULT_SERVER_STARTUP_TIMEOUT_SECS);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(SERVER_POLL_INTERVAL).await;
    }
}

/// Log how many instances and bindings exist per namespace
///
/// A failure here only means the CRDs are not queryable yet; the watches
/// retry on their own.
async fn log_existing_resources(reconciler: &Reconciler) {
    let instances = match reconciler.instances.list(None).await {
        Ok(instances) => instances,
        Err(e) => {
            warn!("ServiceInstance CRD is not queryable yet: {}", e);
            return;
        }
    };
    let bindings = match reconciler.bindings.list(None).await {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!("ServiceBinding CRD is not queryable yet: {}", e);
            return;
        }
    };

    let mut per_namespace: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for namespace in instances
        .iter()
        .filter_map(|i| i.metadata.namespace.clone())
    {
        per_namespace.entry(namespace).or_default().0 += 1;
    }
    for namespace in bindings
        .iter()
        .filter_map(|b| b.metadata.namespace.clone())
    {
        per_namespace.entry(namespace).or_default().1 += 1;
    }

    info!("Service Catalog Controller - Startup Resource Summary");
    info!(
        "ServiceInstances: {}, ServiceBindings: {}, Namespaces: {}",
        instances.len(),
        bindings.len(),
        per_namespace.len()
    );
    for (namespace, (instance_count, binding_count)) in &per_namespace {
        info!(
            "  {}: {} instance(s), {} binding(s)",
            namespace, instance_count, binding_count
        );
    }
}
