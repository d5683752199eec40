//! # Types
//!
//! Core types for the reconcilers.

use crate::broker::BrokerRegistry;
use crate::config::{ParametersErrorPolicy, SharedControllerConfig};
use crate::constants::FINALIZER_NAME;
use crate::controller::backoff::{FibonacciBackoff, RetryPolicy};
use crate::crd::{ServiceBinding, ServiceBindingStatus, ServiceInstance, ServiceInstanceStatus};
use crate::observability::metrics;
use crate::store::{ResourceStore, SecretStore, StoreError, StoredResource};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Unexpected failures of a pass. Broker and configuration problems never
/// surface here; they are recorded as conditions.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode originating identity: {0}")]
    Identity(#[from] serde_json::Error),
}

/// Namespace and name of a reconciled resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key of a resource; `None` when the object has no namespace or name
    #[must_use]
    pub fn from_resource<K: kube::Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self {
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
        })
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Why a key is requeued after a delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// An asynchronous broker operation is outstanding
    Poll,
    /// A failed broker call or resolution is retried
    Retry,
    /// Waiting on another resource
    Blocked,
    /// An unexpected error occurred; see the error policy
    ErrorBackoff,
}

impl RequeueReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RequeueReason::Poll => "poll",
            RequeueReason::Retry => "retry",
            RequeueReason::Blocked => "blocked",
            RequeueReason::ErrorBackoff => "error-backoff",
        }
    }
}

/// What the controller does with a key after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing to do until the resource (or a dependency) changes
    Done,
    Requeue {
        after: Duration,
        reason: RequeueReason,
    },
    /// Run again right away with a fresh read, e.g. after a write conflict
    RequeueNow,
}

impl ReconcileAction {
    #[must_use]
    pub fn poll(after: Duration) -> Self {
        ReconcileAction::Requeue {
            after,
            reason: RequeueReason::Poll,
        }
    }

    #[must_use]
    pub fn retry(after: Duration) -> Self {
        ReconcileAction::Requeue {
            after,
            reason: RequeueReason::Retry,
        }
    }
}

/// Failure that happened before any broker call was issued
#[derive(Debug, Clone)]
pub(crate) struct PreparationFailure<R> {
    pub reason: R,
    pub message: String,
    /// Resolving `parametersFrom` failed
    pub parameters: bool,
}

impl<R> PreparationFailure<R> {
    pub(crate) fn broker(reason: R, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            parameters: false,
        }
    }

    pub(crate) fn parameters(reason: R, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            parameters: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Retry,
    Fail,
}

/// Retry or fail a preparation failure, honouring the parameters error policy
pub(crate) fn preparation_disposition(
    policy: ParametersErrorPolicy,
    parameters_error: bool,
    budget_expired: bool,
) -> Disposition {
    match (parameters_error, policy) {
        (true, ParametersErrorPolicy::FailImmediately) => Disposition::Fail,
        (true, ParametersErrorPolicy::RetryIndefinitely) => Disposition::Retry,
        _ if budget_expired => Disposition::Fail,
        _ => Disposition::Retry,
    }
}

/// Backoff state for a specific resource
/// Tracks error count and backoff calculator for progressive retries
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min, max),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }
}

/// Custom resources with a status subresource
pub trait StatusResource: StoredResource {
    type Status: Clone + PartialEq + Default + Send + Sync;

    fn status_ref(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Option<Self::Status>;

    /// Status, or an empty one for a resource never reconciled
    fn current_status(&self) -> Self::Status {
        self.status_ref().cloned().unwrap_or_default()
    }
}

impl StatusResource for ServiceInstance {
    type Status = ServiceInstanceStatus;

    fn status_ref(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<Self::Status> {
        &mut self.status
    }
}

impl StatusResource for ServiceBinding {
    type Status = ServiceBindingStatus;

    fn status_ref(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<Self::Status> {
        &mut self.status
    }
}

/// Write `status` unless it is unchanged. `None` means the object changed
/// since it was read and the pass must start over.
pub(crate) async fn write_status<K: StatusResource>(
    store: &dyn ResourceStore<K>,
    obj: &K,
    status: K::Status,
) -> Result<Option<K>, ReconcilerError> {
    if obj.status_ref() == Some(&status) {
        return Ok(Some(obj.clone()));
    }
    let mut updated = obj.clone();
    *updated.status_mut() = Some(status);
    conflict_to_none(store.update_status(&updated).await)
}

/// Add the controller finalizer if missing
pub(crate) async fn ensure_finalizer<K: StatusResource>(
    store: &dyn ResourceStore<K>,
    obj: &K,
) -> Result<Option<K>, ReconcilerError> {
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == FINALIZER_NAME) {
        return Ok(Some(obj.clone()));
    }
    finalizers.push(FINALIZER_NAME.to_string());
    conflict_to_none(store.update_finalizers(obj, finalizers).await)
}

/// Release the object by dropping the controller finalizer
pub(crate) async fn remove_finalizer<K: StatusResource>(
    store: &dyn ResourceStore<K>,
    obj: &K,
) -> Result<Option<K>, ReconcilerError> {
    let finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == FINALIZER_NAME) {
        return Ok(Some(obj.clone()));
    }
    let remaining = finalizers
        .into_iter()
        .filter(|f| f != FINALIZER_NAME)
        .collect();
    conflict_to_none(store.update_finalizers(obj, remaining).await)
}

fn conflict_to_none<K: StatusResource>(
    result: Result<K, StoreError>,
) -> Result<Option<K>, ReconcilerError> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_conflict() => {
            debug!("{}", e);
            metrics::increment_requeues("conflict");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Shared context of the instance and binding reconcilers
#[derive(Clone)]
pub struct Reconciler {
    pub instances: Arc<dyn ResourceStore<ServiceInstance>>,
    pub bindings: Arc<dyn ResourceStore<ServiceBinding>>,
    pub secrets: Arc<dyn SecretStore>,
    pub brokers: Arc<dyn BrokerRegistry>,
    pub config: SharedControllerConfig,
    // Backoff state per resource (identified by kind/namespace/name), used by the error policy
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        instances: Arc<dyn ResourceStore<ServiceInstance>>,
        bindings: Arc<dyn ResourceStore<ServiceBinding>>,
        secrets: Arc<dyn SecretStore>,
        brokers: Arc<dyn BrokerRegistry>,
        config: SharedControllerConfig,
    ) -> Self {
        Self {
            instances,
            bindings,
            secrets,
            brokers,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }
}
