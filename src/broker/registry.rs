//! # Broker Registry
//!
//! Resolves a broker name to a client and its catalog. Catalogs are cached
//! and fetched again once the broker's relist interval has passed.

use crate::broker::adapter::BrokerAdapter;
use crate::broker::http::{BasicAuth, HttpBrokerClient};
use crate::broker::{BrokerClient, BrokerError, Catalog};
use crate::config::{SharedControllerConfig, parse_kubernetes_duration};
use crate::crd::ClusterServiceBroker;
use crate::store::{SecretStore, StoreError};
use async_trait::async_trait;
use kube::Client;
use kube::api::Api;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("broker '{0}' not found")]
    BrokerNotFound(String),
    #[error("invalid broker '{name}': {reason}")]
    InvalidBroker { name: String, reason: String },
    #[error("failed to fetch catalog of broker '{name}': {source}")]
    Catalog {
        name: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to read broker: {0}")]
    Store(#[from] StoreError),
}

/// A broker ready for calls
#[derive(Debug, Clone)]
pub struct ResolvedBroker {
    pub adapter: BrokerAdapter,
    pub catalog: Arc<Catalog>,
}

#[async_trait]
pub trait BrokerRegistry: Send + Sync {
    async fn resolve(&self, broker_name: &str) -> Result<ResolvedBroker, RegistryError>;
}

#[derive(Debug)]
struct CachedCatalog {
    catalog: Arc<Catalog>,
    fetched_at: Instant,
}

/// Catalogs per broker name
#[derive(Debug, Default)]
struct CatalogCache {
    entries: Mutex<HashMap<String, CachedCatalog>>,
}

impl CatalogCache {
    async fn get_or_fetch(
        &self,
        name: &str,
        relist_interval: Duration,
        client: &dyn BrokerClient,
    ) -> Result<Arc<Catalog>, RegistryError> {
        {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = entries.get(name) {
                if cached.fetched_at.elapsed() < relist_interval {
                    return Ok(Arc::clone(&cached.catalog));
                }
            }
        }

        let catalog = match client.get_catalog().await {
            Ok(catalog) => Arc::new(catalog),
            Err(source) => {
                // Keep serving a stale catalog rather than blocking every resource of the broker
                let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(cached) = entries.get(name) {
                    warn!(
                        "Catalog relist of broker {} failed, using cached catalog: {}",
                        name, source
                    );
                    return Ok(Arc::clone(&cached.catalog));
                }
                return Err(RegistryError::Catalog {
                    name: name.to_string(),
                    source,
                });
            }
        };
        info!(
            "Fetched catalog of broker {} ({} services)",
            name,
            catalog.services.len()
        );
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                CachedCatalog {
                    catalog: Arc::clone(&catalog),
                    fetched_at: Instant::now(),
                },
            );
        Ok(catalog)
    }
}

/// Registry reading ClusterServiceBroker resources from the cluster
pub struct KubeBrokerRegistry {
    client: Client,
    secrets: Arc<dyn SecretStore>,
    config: SharedControllerConfig,
    catalogs: CatalogCache,
}

impl std::fmt::Debug for KubeBrokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBrokerRegistry").finish_non_exhaustive()
    }
}

impl KubeBrokerRegistry {
    #[must_use]
    pub fn new(client: Client, secrets: Arc<dyn SecretStore>, config: SharedControllerConfig) -> Self {
        Self {
            client,
            secrets,
            config,
            catalogs: CatalogCache::default(),
        }
    }

    async fn basic_auth(
        &self,
        broker: &ClusterServiceBroker,
        name: &str,
    ) -> Result<Option<BasicAuth>, RegistryError> {
        let Some(secret_ref) = &broker.spec.auth_secret_ref else {
            return Ok(None);
        };
        let invalid = |reason: String| RegistryError::InvalidBroker {
            name: name.to_string(),
            reason,
        };
        let namespace = secret_ref
            .namespace
            .as_deref()
            .ok_or_else(|| invalid("authSecretRef.namespace is required".to_string()))?;
        let data = self
            .secrets
            .get_secret(namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| invalid(format!("auth secret {namespace}/{} not found", secret_ref.name)))?;
        let field = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .ok_or_else(|| invalid(format!("auth secret is missing '{key}'")))
        };
        Ok(Some(BasicAuth {
            username: field("username")?,
            password: field("password")?,
        }))
    }
}

#[async_trait]
impl BrokerRegistry for KubeBrokerRegistry {
    async fn resolve(&self, broker_name: &str) -> Result<ResolvedBroker, RegistryError> {
        let api: Api<ClusterServiceBroker> = Api::all(self.client.clone());
        let broker = api
            .get_opt(broker_name)
            .await
            .map_err(|e| RegistryError::Store(StoreError::Kube(e)))?
            .ok_or_else(|| RegistryError::BrokerNotFound(broker_name.to_string()))?;

        let auth = self.basic_auth(&broker, broker_name).await?;
        let client: Arc<dyn BrokerClient> = Arc::new(
            HttpBrokerClient::new(
                &broker.spec.url,
                &self.config.osb_api_preferred_version,
                auth,
                self.config.osb_api_request_timeout,
            )
            .map_err(|source| RegistryError::Catalog {
                name: broker_name.to_string(),
                source,
            })?,
        );

        let relist_interval = match broker.spec.relist_interval.as_deref() {
            Some(raw) => parse_kubernetes_duration(raw).unwrap_or_else(|e| {
                warn!("Invalid relistInterval on broker {}: {}", broker_name, e);
                self.config.broker_relist_interval
            }),
            None => self.config.broker_relist_interval,
        };
        let catalog = self
            .catalogs
            .get_or_fetch(broker_name, relist_interval, client.as_ref())
            .await?;

        Ok(ResolvedBroker {
            adapter: BrokerAdapter::new(client, self.config.osb_api_request_timeout),
            catalog,
        })
    }
}

/// Registry over a fixed set of clients
pub struct StaticBrokerRegistry {
    brokers: HashMap<String, Arc<dyn BrokerClient>>,
    timeout: Duration,
    relist_interval: Duration,
    catalogs: CatalogCache,
}

impl std::fmt::Debug for StaticBrokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticBrokerRegistry")
            .field("brokers", &self.brokers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StaticBrokerRegistry {
    #[must_use]
    pub fn new(timeout: Duration, relist_interval: Duration) -> Self {
        Self {
            brokers: HashMap::new(),
            timeout,
            relist_interval,
            catalogs: CatalogCache::default(),
        }
    }

    #[must_use]
    pub fn with_broker(mut self, name: &str, client: Arc<dyn BrokerClient>) -> Self {
        self.brokers.insert(name.to_string(), client);
        self
    }
}

#[async_trait]
impl BrokerRegistry for StaticBrokerRegistry {
    async fn resolve(&self, broker_name: &str) -> Result<ResolvedBroker, RegistryError> {
        let client = self
            .brokers
            .get(broker_name)
            .cloned()
            .ok_or_else(|| RegistryError::BrokerNotFound(broker_name.to_string()))?;
        let catalog = self
            .catalogs
            .get_or_fetch(broker_name, self.relist_interval, client.as_ref())
            .await?;
        Ok(ResolvedBroker {
            adapter: BrokerAdapter::new(client, self.timeout),
            catalog,
        })
    }
}
