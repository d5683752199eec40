//! # Broker Call Adapter
//!
//! Issues broker calls under the request timeout and classifies each result
//! into what the reconcilers act on.
//!
//! | Result                               | Outcome                                    |
//! |--------------------------------------|--------------------------------------------|
//! | 200/201                              | `Succeeded`                                |
//! | 202                                  | `InProgress(operation)`                    |
//! | 409 on provision                     | `Succeeded` (instance exists at broker)    |
//! | 410 on deprovision/unbind            | `Succeeded`                                |
//! | 408                                  | `FailedRetriable`, orphan risk             |
//! | 422 `ConcurrencyError`               | `FailedRetriable`                          |
//! | other 4xx                            | `Failed`                                   |
//! | 5xx                                  | `FailedRetriable`, orphan risk             |
//! | unexpected 2xx (e.g. 204)            | `FailedRetriable`, orphan risk             |
//! | timeout                              | `FailedRetriable`, orphan risk             |
//! | connection refused, other transport  | `FailedRetriable`                          |
//!
//! Orphan risk only applies to calls that create something at the broker
//! (provision, bind).

use crate::broker::{
    BindRequest, BindResponse, BrokerClient, BrokerError, DeprovisionRequest, GetBindingRequest,
    LastOperationRequest, LastOperationResponse, LastOperationState, OperationResponse,
    ProvisionRequest, TransportErrorKind, UnbindRequest, UpdateInstanceRequest,
};
use crate::observability::metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Broker call being classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Provision,
    Update,
    Deprovision,
    Bind,
    Unbind,
    GetBinding,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Provision => "provision",
            OperationKind::Update => "update",
            OperationKind::Deprovision => "deprovision",
            OperationKind::Bind => "bind",
            OperationKind::Unbind => "unbind",
            OperationKind::GetBinding => "get_binding",
        }
    }

    /// Calls whose unknown outcome may leave an orphan at the broker
    fn creates_resource(self) -> bool {
        matches!(self, OperationKind::Provision | OperationKind::Bind)
    }

    /// Calls for which 410 Gone means the goal is already reached
    fn removes_resource(self) -> bool {
        matches!(self, OperationKind::Deprovision | OperationKind::Unbind)
    }
}

/// Why a broker call failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    /// HTTP status, when the broker answered
    pub status: Option<u16>,
    pub message: String,
    /// The broker may have created the resource despite the failure
    pub orphan_risk: bool,
}

/// Classified result of a broker call
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Succeeded(T),
    /// Accepted asynchronously, with the broker's operation token
    InProgress(Option<String>),
    /// Terminal failure; retrying the same request cannot succeed
    Failed(CallFailure),
    FailedRetriable(CallFailure),
}

impl<T> CallOutcome<T> {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            CallOutcome::Succeeded(_) => "succeeded",
            CallOutcome::InProgress(_) => "in_progress",
            CallOutcome::Failed(_) => "failed",
            CallOutcome::FailedRetriable(_) => "failed_retriable",
        }
    }
}

/// Classified result of a last-operation poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    InProgress(Option<String>),
    Succeeded,
    /// The broker reports the operation failed
    Failed(String),
    /// The poll itself failed; the operation state is unknown
    Error(String),
}

impl PollOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::InProgress(_) => "in_progress",
            PollOutcome::Succeeded => "succeeded",
            PollOutcome::Failed(_) => "failed",
            PollOutcome::Error(_) => "error",
        }
    }
}

/// Responses that can report asynchronous acceptance
pub trait AsyncResponse: Default {
    fn is_async(&self) -> bool;
    fn operation(&self) -> Option<String>;
}

impl AsyncResponse for OperationResponse {
    fn is_async(&self) -> bool {
        self.is_async
    }

    fn operation(&self) -> Option<String> {
        self.operation.clone()
    }
}

impl AsyncResponse for BindResponse {
    fn is_async(&self) -> bool {
        self.is_async
    }

    fn operation(&self) -> Option<String> {
        self.operation.clone()
    }
}

/// Classify the result of a broker call
pub fn classify<T: AsyncResponse>(
    kind: OperationKind,
    result: Result<T, BrokerError>,
) -> CallOutcome<T> {
    let orphan_risk = kind.creates_resource();
    match result {
        Ok(response) if response.is_async() => CallOutcome::InProgress(response.operation()),
        Ok(response) => CallOutcome::Succeeded(response),
        Err(error) => {
            let message = error.to_string();
            let failure = |status: Option<u16>, orphan_risk: bool| CallFailure {
                status,
                message: message.clone(),
                orphan_risk,
            };
            match error {
                BrokerError::Http { status: 409, .. } if kind == OperationKind::Provision => {
                    CallOutcome::Succeeded(T::default())
                }
                BrokerError::Http { status: 410, .. } if kind.removes_resource() => {
                    CallOutcome::Succeeded(T::default())
                }
                BrokerError::Http { status: 408, .. } => {
                    CallOutcome::FailedRetriable(failure(Some(408), orphan_risk))
                }
                BrokerError::Http {
                    status: 422,
                    error: Some(ref e),
                    ..
                } if e == "ConcurrencyError" => {
                    CallOutcome::FailedRetriable(failure(Some(422), false))
                }
                BrokerError::Http { status, .. } if (400..500).contains(&status) => {
                    CallOutcome::Failed(failure(Some(status), false))
                }
                BrokerError::Http { status, .. } => {
                    CallOutcome::FailedRetriable(failure(Some(status), orphan_risk))
                }
                BrokerError::Transport {
                    kind: TransportErrorKind::Timeout,
                    ..
                } => CallOutcome::FailedRetriable(failure(None, orphan_risk)),
                BrokerError::Transport { .. } => CallOutcome::FailedRetriable(failure(None, false)),
                // The broker answered 2xx with a body we could not use
                BrokerError::InvalidResponse(_) => {
                    CallOutcome::FailedRetriable(failure(None, orphan_risk))
                }
            }
        }
    }
}

/// Classify a last-operation poll for an operation of `kind`
pub fn classify_poll(
    kind: OperationKind,
    result: Result<LastOperationResponse, BrokerError>,
) -> PollOutcome {
    match result {
        Ok(LastOperationResponse {
            state: LastOperationState::InProgress,
            description,
        }) => PollOutcome::InProgress(description),
        Ok(LastOperationResponse {
            state: LastOperationState::Succeeded,
            ..
        }) => PollOutcome::Succeeded,
        Ok(LastOperationResponse {
            state: LastOperationState::Failed,
            description,
        }) => PollOutcome::Failed(
            description.unwrap_or_else(|| format!("asynchronous {} failed", kind.as_str())),
        ),
        Err(BrokerError::Http { status: 410, .. }) if kind.removes_resource() => {
            PollOutcome::Succeeded
        }
        Err(BrokerError::Http { status: 410, .. }) => PollOutcome::Failed(format!(
            "broker reports the resource of the asynchronous {} is gone",
            kind.as_str()
        )),
        Err(error) => PollOutcome::Error(error.to_string()),
    }
}

/// Broker client bound to a request timeout, recording call metrics
#[derive(Clone)]
pub struct BrokerAdapter {
    client: Arc<dyn BrokerClient>,
    timeout: Duration,
}

impl std::fmt::Debug for BrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAdapter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BrokerAdapter {
    #[must_use]
    pub fn new(client: Arc<dyn BrokerClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T, F>(&self, kind: OperationKind, call: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, BrokerError>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Transport {
                kind: TransportErrorKind::Timeout,
                message: format!(
                    "{} call timed out after {:?}",
                    kind.as_str(),
                    self.timeout
                ),
            }),
        };
        metrics::observe_broker_call_duration(kind.as_str(), start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!("Broker {} call returned error: {}", kind.as_str(), e);
        }
        result
    }

    fn record<T>(kind: OperationKind, outcome: CallOutcome<T>) -> CallOutcome<T> {
        metrics::increment_broker_calls(kind.as_str(), outcome.label());
        if let CallOutcome::Failed(f) | CallOutcome::FailedRetriable(f) = &outcome {
            if f.orphan_risk {
                warn!(
                    "Broker {} outcome unknown, orphan mitigation required: {}",
                    kind.as_str(),
                    f.message
                );
            }
        }
        outcome
    }

    pub async fn provision(&self, request: &ProvisionRequest) -> CallOutcome<OperationResponse> {
        let kind = OperationKind::Provision;
        let result = self
            .bounded(kind, self.client.provision_instance(request))
            .await;
        Self::record(kind, classify(kind, result))
    }

    pub async fn update(&self, request: &UpdateInstanceRequest) -> CallOutcome<OperationResponse> {
        let kind = OperationKind::Update;
        let result = self.bounded(kind, self.client.update_instance(request)).await;
        Self::record(kind, classify(kind, result))
    }

    pub async fn deprovision(&self, request: &DeprovisionRequest) -> CallOutcome<OperationResponse> {
        let kind = OperationKind::Deprovision;
        let result = self
            .bounded(kind, self.client.deprovision_instance(request))
            .await;
        Self::record(kind, classify(kind, result))
    }

    pub async fn bind(&self, request: &BindRequest) -> CallOutcome<BindResponse> {
        let kind = OperationKind::Bind;
        let result = self.bounded(kind, self.client.bind(request)).await;
        Self::record(kind, classify(kind, result))
    }

    pub async fn unbind(&self, request: &UnbindRequest) -> CallOutcome<OperationResponse> {
        let kind = OperationKind::Unbind;
        let result = self.bounded(kind, self.client.unbind(request)).await;
        Self::record(kind, classify(kind, result))
    }

    pub async fn get_binding(&self, request: &GetBindingRequest) -> CallOutcome<BindResponse> {
        let kind = OperationKind::GetBinding;
        let result = self.bounded(kind, self.client.get_binding(request)).await;
        Self::record(kind, classify(kind, result))
    }

    /// Poll an instance operation of `kind`
    pub async fn poll_instance(
        &self,
        kind: OperationKind,
        request: &LastOperationRequest,
    ) -> PollOutcome {
        let result = self
            .bounded(kind, self.client.poll_last_operation(request))
            .await;
        let outcome = classify_poll(kind, result);
        metrics::increment_broker_polls(kind.as_str(), outcome.label());
        outcome
    }

    /// Poll a binding operation of `kind`
    pub async fn poll_binding(
        &self,
        kind: OperationKind,
        request: &LastOperationRequest,
    ) -> PollOutcome {
        let result = self
            .bounded(kind, self.client.poll_binding_last_operation(request))
            .await;
        let outcome = classify_poll(kind, result);
        metrics::increment_broker_polls(kind.as_str(), outcome.label());
        outcome
    }
}
