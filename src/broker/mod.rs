//! # Open Service Broker
//!
//! Client abstraction over the Open Service Broker API.
//!
//! - `http.rs` - reqwest implementation of [`BrokerClient`]
//! - `adapter.rs` - Classification of broker responses into reconcile outcomes
//! - `identity.rs` - Originating identity header
//! - `registry.rs` - Resolution of broker names to clients and catalogs

pub mod adapter;
pub mod http;
pub mod identity;
pub mod registry;

pub use adapter::{CallFailure, CallOutcome, PollOutcome};
pub use identity::OriginatingIdentity;
pub use registry::{
    BrokerRegistry, KubeBrokerRegistry, RegistryError, ResolvedBroker, StaticBrokerRegistry,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Kind of transport failure, which decides orphan risk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request may have reached the broker
    Timeout,
    /// The request never reached the broker
    Connect,
    Other,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker answered with a status the operation does not accept
    #[error("broker returned HTTP {status}{}", http_detail(.error, .description))]
    Http {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },
    #[error("broker request failed: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error("invalid broker response: {0}")]
    InvalidResponse(String),
}

fn http_detail(error: &Option<String>, description: &Option<String>) -> String {
    let mut detail = String::new();
    if let Some(e) = error {
        detail.push_str(&format!(" ({e})"));
    }
    if let Some(d) = description {
        detail.push_str(&format!(": {d}"));
    }
    detail
}

impl BrokerError {
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            BrokerError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// OSB catalog
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct Catalog {
    #[serde(default)]
    pub services: Vec<CatalogService>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updateable: Option<bool>,
    #[serde(default)]
    pub plans: Vec<CatalogPlan>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CatalogPlan {
    pub id: String,
    pub name: String,
    /// Overrides the service's `bindable` when set
    #[serde(default)]
    pub bindable: Option<bool>,
}

/// Catalog ids resolved from a class and plan name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub service_id: String,
    pub plan_id: String,
    pub bindable: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogLookupError {
    #[error("service class '{0}' not found in broker catalog")]
    ClassNotFound(String),
    #[error("plan '{plan}' not found for service class '{class}' in broker catalog")]
    PlanNotFound { class: String, plan: String },
}

impl Catalog {
    /// Resolve class and plan external names to catalog ids
    pub fn resolve_plan(
        &self,
        class_name: &str,
        plan_name: &str,
    ) -> Result<ResolvedPlan, CatalogLookupError> {
        let service = self
            .services
            .iter()
            .find(|s| s.name == class_name)
            .ok_or_else(|| CatalogLookupError::ClassNotFound(class_name.to_string()))?;
        let plan = service
            .plans
            .iter()
            .find(|p| p.name == plan_name)
            .ok_or_else(|| CatalogLookupError::PlanNotFound {
                class: class_name.to_string(),
                plan: plan_name.to_string(),
            })?;
        Ok(ResolvedPlan {
            service_id: service.id.clone(),
            plan_id: plan.id.clone(),
            bindable: plan.bindable.unwrap_or(service.bindable),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub parameters: Option<Map<String, Value>>,
    pub context: Value,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInstanceRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    pub context: Value,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub parameters: Option<Map<String, Value>>,
    pub context: Value,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

/// Last-operation poll for an instance or, with `binding_id`, a binding
#[derive(Debug, Clone, PartialEq)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub binding_id: Option<String>,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation: Option<String>,
    pub originating_identity: Option<OriginatingIdentity>,
}

/// Response of provision, update, deprovision and unbind
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationResponse {
    /// The broker accepted the request and will complete it asynchronously
    pub is_async: bool,
    pub operation: Option<String>,
    pub dashboard_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindResponse {
    pub is_async: bool,
    pub operation: Option<String>,
    pub credentials: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default)]
    pub description: Option<String>,
}

/// Calls of the Open Service Broker API
///
/// Implementations return `Ok` only for the success statuses of each call
/// (200/201/202, and 200 for polls); every other status is
/// [`BrokerError::Http`], leaving its interpretation to the adapter.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_catalog(&self) -> Result<Catalog, BrokerError>;

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<OperationResponse, BrokerError>;

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<OperationResponse, BrokerError>;

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<OperationResponse, BrokerError>;

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError>;

    async fn unbind(&self, request: &UnbindRequest) -> Result<OperationResponse, BrokerError>;

    async fn get_binding(&self, request: &GetBindingRequest) -> Result<BindResponse, BrokerError>;

    async fn poll_binding_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;
}
