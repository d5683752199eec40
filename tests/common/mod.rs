//! Common test utilities for the reconciler integration tests
//!
//! Provides a scripted in-process broker, fixtures for the CRDs and a harness
//! wiring the reconciler to in-memory stores.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use service_catalog_controller::broker::{
    BindRequest, BindResponse, BrokerClient, BrokerError, Catalog, DeprovisionRequest,
    GetBindingRequest, LastOperationRequest, LastOperationResponse, LastOperationState,
    OperationResponse, ProvisionRequest, StaticBrokerRegistry, TransportErrorKind, UnbindRequest,
    UpdateInstanceRequest,
};
use service_catalog_controller::config::ControllerConfig;
use service_catalog_controller::controller::reconciler::{ReconcileAction, Reconciler, ResourceKey};
pub use service_catalog_controller::controller::reconciler::StatusResource;
pub use service_catalog_controller::crd::HasConditions;
use service_catalog_controller::crd::{
    Condition, LocalObjectReference, ServiceBinding, ServiceBindingSpec,
    ServiceBindingStatus, ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus,
};
use service_catalog_controller::store::{MemoryResourceStore, MemorySecretStore};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests
///
/// Uses a `Once` to ensure it's only called once across all tests.
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

pub const NAMESPACE: &str = "default";
pub const BROKER: &str = "test-broker";
pub const CLUSTER_ID: &str = "test-cluster";

/// Broker calls, in the order they are logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Catalog,
    Provision,
    Update,
    Deprovision,
    PollInstance,
    Bind,
    Unbind,
    GetBinding,
    PollBinding,
}

#[derive(Debug)]
enum Scripted {
    Operation(Result<OperationResponse, BrokerError>),
    Binding(Result<BindResponse, BrokerError>),
    Poll(Result<LastOperationResponse, BrokerError>),
}

/// In-process broker answering from per-call scripts
///
/// Unscripted calls succeed synchronously; bind and get-binding return
/// [`default_credentials`].
#[derive(Debug, Default)]
pub struct FakeBroker {
    scripts: Mutex<HashMap<Call, VecDeque<Scripted>>>,
    calls: Mutex<Vec<Call>>,
    pub provisions: Mutex<Vec<ProvisionRequest>>,
    pub updates: Mutex<Vec<UpdateInstanceRequest>>,
    pub binds: Mutex<Vec<BindRequest>>,
    pub polls: Mutex<Vec<LastOperationRequest>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, call: Call, response: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(call)
            .or_default()
            .push_back(response);
    }

    fn next(&self, call: Call) -> Option<Scripted> {
        self.calls.lock().unwrap().push(call);
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&call)
            .and_then(VecDeque::pop_front)
    }

    /// Script the next provision, update, deprovision or unbind response
    pub fn script_operation(&self, call: Call, response: Result<OperationResponse, BrokerError>) {
        self.push(call, Scripted::Operation(response));
    }

    /// Script the next bind or get-binding response
    pub fn script_binding(&self, call: Call, response: Result<BindResponse, BrokerError>) {
        self.push(call, Scripted::Binding(response));
    }

    /// Script the next instance or binding last-operation response
    pub fn script_poll(&self, call: Call, response: Result<LastOperationResponse, BrokerError>) {
        self.push(call, Scripted::Poll(response));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than catalog fetches
    pub fn operations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| *c != Call::Catalog)
            .collect()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    fn operation(&self, call: Call) -> Result<OperationResponse, BrokerError> {
        match self.next(call) {
            Some(Scripted::Operation(response)) => response,
            None => Ok(OperationResponse::default()),
            Some(other) => panic!("{call:?} scripted with {other:?}"),
        }
    }

    fn binding(&self, call: Call) -> Result<BindResponse, BrokerError> {
        match self.next(call) {
            Some(Scripted::Binding(response)) => response,
            None => Ok(BindResponse {
                credentials: Some(default_credentials()),
                ..BindResponse::default()
            }),
            Some(other) => panic!("{call:?} scripted with {other:?}"),
        }
    }

    fn poll(&self, call: Call) -> Result<LastOperationResponse, BrokerError> {
        match self.next(call) {
            Some(Scripted::Poll(response)) => response,
            None => Ok(last_operation(LastOperationState::Succeeded)),
            Some(other) => panic!("{call:?} scripted with {other:?}"),
        }
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn get_catalog(&self) -> Result<Catalog, BrokerError> {
        self.calls.lock().unwrap().push(Call::Catalog);
        Ok(catalog())
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<OperationResponse, BrokerError> {
        self.provisions.lock().unwrap().push(request.clone());
        self.operation(Call::Provision)
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<OperationResponse, BrokerError> {
        self.updates.lock().unwrap().push(request.clone());
        self.operation(Call::Update)
    }

    async fn deprovision_instance(
        &self,
        _request: &DeprovisionRequest,
    ) -> Result<OperationResponse, BrokerError> {
        self.operation(Call::Deprovision)
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.polls.lock().unwrap().push(request.clone());
        self.poll(Call::PollInstance)
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError> {
        self.binds.lock().unwrap().push(request.clone());
        self.binding(Call::Bind)
    }

    async fn unbind(&self, _request: &UnbindRequest) -> Result<OperationResponse, BrokerError> {
        self.operation(Call::Unbind)
    }

    async fn get_binding(&self, _request: &GetBindingRequest) -> Result<BindResponse, BrokerError> {
        self.binding(Call::GetBinding)
    }

    async fn poll_binding_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.polls.lock().unwrap().push(request.clone());
        self.poll(Call::PollBinding)
    }
}

/// Catalog with one bindable class and a non-bindable plan
pub fn catalog() -> Catalog {
    serde_json::from_value(json!({
        "services": [{
            "id": "svc-db",
            "name": "database",
            "bindable": true,
            "plans": [
                {"id": "plan-small", "name": "small"},
                {"id": "plan-large", "name": "large"},
                {"id": "plan-archive", "name": "archive", "bindable": false}
            ]
        }]
    }))
    .unwrap()
}

pub fn default_credentials() -> Map<String, Value> {
    json!({"username": "admin", "password": "s3cret", "port": 5432})
        .as_object()
        .cloned()
        .unwrap()
}

pub fn http_error(status: u16) -> BrokerError {
    BrokerError::Http {
        status,
        error: None,
        description: None,
    }
}

pub fn connection_refused() -> BrokerError {
    BrokerError::Transport {
        kind: TransportErrorKind::Connect,
        message: "connection refused".to_string(),
    }
}

pub fn accepted(operation: &str) -> OperationResponse {
    OperationResponse {
        is_async: true,
        operation: Some(operation.to_string()),
        dashboard_url: None,
    }
}

pub fn last_operation(state: LastOperationState) -> LastOperationResponse {
    LastOperationResponse {
        state,
        description: None,
    }
}

pub fn instance(name: &str, plan: &str) -> ServiceInstance {
    let mut instance = ServiceInstance::new(
        name,
        ServiceInstanceSpec {
            broker_name: BROKER.to_string(),
            class_external_name: "database".to_string(),
            plan_external_name: plan.to_string(),
            parameters: None,
            parameters_from: vec![],
            external_id: None,
            user_info: None,
            update_requests: 0,
        },
    );
    instance.metadata.namespace = Some(NAMESPACE.to_string());
    instance
}

pub fn binding(name: &str, instance_name: &str) -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        name,
        ServiceBindingSpec {
            instance_ref: LocalObjectReference {
                name: instance_name.to_string(),
            },
            parameters: None,
            parameters_from: vec![],
            secret_name: None,
            secret_transforms: vec![],
            external_id: None,
            user_info: None,
        },
    );
    binding.metadata.namespace = Some(NAMESPACE.to_string());
    binding
}

/// Small backoffs and a fixed cluster id; the retry budget stays at its default
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        operation_polling_initial_backoff: Duration::from_secs(1),
        retry_initial_backoff: Duration::from_secs(1),
        osb_api_request_timeout: Duration::from_secs(5),
        cluster_id: CLUSTER_ID.to_string(),
        ..ControllerConfig::default()
    }
}

/// Reconciler over in-memory stores and one [`FakeBroker`]
pub struct Harness {
    pub instances: Arc<MemoryResourceStore<ServiceInstance>>,
    pub bindings: Arc<MemoryResourceStore<ServiceBinding>>,
    pub secrets: Arc<MemorySecretStore>,
    pub broker: Arc<FakeBroker>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let instances = Arc::new(MemoryResourceStore::new());
        let bindings = Arc::new(MemoryResourceStore::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let broker = FakeBroker::new();
        let registry = StaticBrokerRegistry::new(
            config.osb_api_request_timeout,
            config.broker_relist_interval,
        )
        .with_broker(BROKER, Arc::clone(&broker) as Arc<dyn BrokerClient>);
        let reconciler = Reconciler::new(
            Arc::clone(&instances) as _,
            Arc::clone(&bindings) as _,
            Arc::clone(&secrets) as _,
            Arc::new(registry),
            Arc::new(config),
        );
        Self {
            instances,
            bindings,
            secrets,
            broker,
            reconciler,
        }
    }

    pub async fn reconcile_instance(&self, name: &str) -> ReconcileAction {
        self.reconciler
            .reconcile_instance(&ResourceKey::new(NAMESPACE, name))
            .await
            .unwrap()
    }

    pub async fn reconcile_binding(&self, name: &str) -> ReconcileAction {
        self.reconciler
            .reconcile_binding(&ResourceKey::new(NAMESPACE, name))
            .await
            .unwrap()
    }

    /// Reconcile until a pass asks for something other than an immediate requeue
    pub async fn settle_instance(&self, name: &str) -> ReconcileAction {
        for _ in 0..10 {
            let action = self.reconcile_instance(name).await;
            if action != ReconcileAction::RequeueNow {
                return action;
            }
        }
        panic!("instance {name} kept requeueing");
    }

    pub async fn settle_binding(&self, name: &str) -> ReconcileAction {
        for _ in 0..10 {
            let action = self.reconcile_binding(name).await;
            if action != ReconcileAction::RequeueNow {
                return action;
            }
        }
        panic!("binding {name} kept requeueing");
    }

    /// Create an instance and provision it synchronously
    pub async fn ready_instance(&self, name: &str, plan: &str) -> ServiceInstance {
        self.instances.create(instance(name, plan)).unwrap();
        assert_eq!(self.settle_instance(name).await, ReconcileAction::Done);
        let instance = self.instance(name);
        assert!(instance.current_status().condition_is_true("Ready"));
        instance
    }

    /// Create a binding to a ready instance and bind it synchronously
    pub async fn ready_binding(&self, name: &str, instance_name: &str) -> ServiceBinding {
        self.bindings.create(binding(name, instance_name)).unwrap();
        assert_eq!(self.settle_binding(name).await, ReconcileAction::Done);
        let binding = self.binding(name);
        assert!(binding.current_status().condition_is_true("Ready"));
        binding
    }

    pub fn instance(&self, name: &str) -> ServiceInstance {
        self.instances
            .snapshot(NAMESPACE, name)
            .unwrap_or_else(|| panic!("instance {name} not found"))
    }

    pub fn binding(&self, name: &str) -> ServiceBinding {
        self.bindings
            .snapshot(NAMESPACE, name)
            .unwrap_or_else(|| panic!("binding {name} not found"))
    }

    pub fn instance_status(&self, name: &str) -> ServiceInstanceStatus {
        self.instance(name).current_status()
    }

    pub fn binding_status(&self, name: &str) -> ServiceBindingStatus {
        self.binding(name).current_status()
    }
}

/// Reason of condition `condition_type`, if set
pub fn reason<S: HasConditions>(status: &S, condition_type: &str) -> Option<String> {
    status
        .condition(condition_type)
        .and_then(|c: &Condition| c.reason.clone())
}
