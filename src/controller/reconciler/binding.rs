//! # Binding Reconciler
//!
//! Drives a ServiceBinding through bind and unbind, and writes the
//! transformed credentials into the binding's secret.
//!
//! A binding only proceeds once its instance is Ready. Bind failures that may
//! have left credentials behind at the broker are followed by an unbind
//! (orphan mitigation) before the bind is retried or given up. Unbind is
//! retried forever; once the retry budget is spent the binding is marked
//! `FailedRetriable` but keeps trying at the capped interval.

use crate::broker::adapter::OperationKind;
use crate::broker::{
    BindRequest, CallFailure, CallOutcome, GetBindingRequest, LastOperationRequest,
    OriginatingIdentity, PollOutcome, RegistryError, ResolvedBroker, UnbindRequest,
};
use crate::constants::ORIGINATING_IDENTITY_PLATFORM;
use crate::controller::parameters::resolve_parameters;
use crate::controller::reconciler::conditions::{
    copy_condition, format_time, parse_time, remove_condition, set_condition,
};
use crate::controller::reconciler::reasons::{BindingReason, ConditionStatus, ConditionType};
use crate::controller::reconciler::types::{
    Disposition, PreparationFailure, ReconcileAction, Reconciler, ReconcilerError, ResourceKey,
    StatusResource, ensure_finalizer, preparation_disposition, remove_finalizer, write_status,
};
use crate::controller::transform::{
    TransformError, apply_transforms, credentials_from_broker, to_secret_data,
};
use crate::crd::{
    BindingOperation, BindingProperties, HasConditions, InstanceProperties, ServiceBinding,
    ServiceBindingStatus, ServiceInstance, UnbindStatus,
};
use crate::observability::metrics;
use crate::store::{SecretData, SecretOwnership, StoreError};
use chrono::{DateTime, Utc};
use kube::Resource;
use serde_json::{Map, Value, json};
use tracing::{Instrument, debug, info, info_span, warn};

/// State of one pass over one binding
struct BindingPass {
    key: ResourceKey,
    binding: ServiceBinding,
    status: ServiceBindingStatus,
    generation: i64,
    now: DateTime<Utc>,
    deleting: bool,
}

impl BindingPass {
    fn new(key: ResourceKey, binding: ServiceBinding) -> Self {
        Self {
            key,
            status: binding.current_status(),
            generation: binding.metadata.generation.unwrap_or(0),
            now: Utc::now(),
            deleting: binding.metadata.deletion_timestamp.is_some(),
            binding,
        }
    }

    fn external_id(&self) -> Result<String, StoreError> {
        self.binding
            .external_id()
            .ok_or(StoreError::MissingMetadata("uid"))
    }

    fn secret_name(&self) -> Result<String, StoreError> {
        self.binding
            .secret_name()
            .ok_or(StoreError::MissingMetadata("name"))
    }

    fn set_ready(
        &mut self,
        status: ConditionStatus,
        reason: BindingReason,
        message: impl Into<String>,
    ) {
        set_condition(
            &mut self.status.conditions,
            ConditionType::Ready,
            status,
            reason,
            message,
            self.now,
        );
    }

    fn set_failed(&mut self, reason: BindingReason, message: impl Into<String>) {
        set_condition(
            &mut self.status.conditions,
            ConditionType::Failed,
            ConditionStatus::True,
            reason,
            message,
            self.now,
        );
    }

    fn operation_start(&self) -> DateTime<Utc> {
        parse_time(self.status.operation_start_time.as_deref()).unwrap_or(self.now)
    }

    fn begin_operation(&mut self, operation: BindingOperation) {
        self.status.current_operation = Some(operation);
        self.status.operation_start_time = Some(format_time(self.now));
        self.status.operation_attempts = 0;
        self.status.async_op_in_progress = false;
        self.status.last_operation = None;
        self.status.observed_generation = Some(self.generation);
        remove_condition(&mut self.status.conditions, ConditionType::Failed);
    }

    fn clear_operation(&mut self) {
        self.status.current_operation = None;
        self.status.operation_start_time = None;
        self.status.operation_attempts = 0;
        self.status.async_op_in_progress = false;
        self.status.last_operation = None;
        self.status.in_progress_properties = None;
    }

    fn clear_orphan_mitigation(&mut self) {
        self.status.orphan_mitigation_in_progress = false;
        self.status.orphan_mitigation_start_time = None;
        self.status.orphan_mitigation_attempts = 0;
        self.status.retry_after_orphan_mitigation = false;
        self.status.async_op_in_progress = false;
        self.status.last_operation = None;
    }

    fn settled(&self) -> ReconcileAction {
        if self.deleting {
            ReconcileAction::RequeueNow
        } else {
            ReconcileAction::Done
        }
    }
}

/// The instance side of a binding: broker ids and the broker to call
struct BoundInstance {
    broker: ResolvedBroker,
    instance_id: String,
    properties: InstanceProperties,
}

fn registry_reason(error: &RegistryError) -> BindingReason {
    match error {
        RegistryError::BrokerNotFound(_) | RegistryError::InvalidBroker { .. } => {
            BindingReason::ReferencesNonexistentBroker
        }
        RegistryError::Catalog { .. } | RegistryError::Store(_) => {
            BindingReason::ErrorFetchingCatalog
        }
    }
}

/// Injection failures that may clear up on their own
fn injection_retriable(error: &TransformError) -> bool {
    matches!(
        error,
        TransformError::Store(_) | TransformError::MissingSecret { .. }
    )
}

impl Reconciler {
    /// Run one reconcile pass for the ServiceBinding at `key`
    pub async fn reconcile_binding(
        &self,
        key: &ResourceKey,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let Some(binding) = self.bindings.get(&key.namespace, &key.name).await? else {
            debug!("ServiceBinding {} no longer exists", key);
            return Ok(ReconcileAction::Done);
        };
        let span = info_span!(
            "reconcile.binding",
            resource.namespace = %key.namespace,
            resource.name = %key.name,
            resource.generation = binding.metadata.generation.unwrap_or(0),
        );
        self.binding_pass(key.clone(), binding)
            .instrument(span)
            .await
    }

    async fn binding_pass(
        &self,
        key: ResourceKey,
        binding: ServiceBinding,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let binding = if binding.metadata.deletion_timestamp.is_some() {
            binding
        } else {
            match ensure_finalizer(self.bindings.as_ref(), &binding).await? {
                Some(binding) => binding,
                None => return Ok(ReconcileAction::RequeueNow),
            }
        };
        let pass = BindingPass::new(key, binding);

        if pass.status.orphan_mitigation_in_progress {
            return self.binding_orphan_mitigation(pass).await;
        }
        if pass.status.async_op_in_progress {
            return self.poll_binding_operation(pass).await;
        }
        if pass.deleting {
            return self.unbind(pass).await;
        }
        if pass
            .status
            .condition_is_true(ConditionType::Failed.as_str())
            && pass.status.reconciled_generation == Some(pass.generation)
        {
            debug!(
                "Binding {} failed at generation {}, waiting for a spec change",
                pass.key, pass.generation
            );
            return Ok(ReconcileAction::Done);
        }
        if pass.status.condition_is_true(ConditionType::Ready.as_str())
            && pass.status.current_operation.is_none()
        {
            if pass.status.reconciled_generation != Some(pass.generation) {
                // Credentials are immutable once issued; a new generation is only recorded
                let mut pass = pass;
                pass.status.observed_generation = Some(pass.generation);
                pass.status.reconciled_generation = Some(pass.generation);
                return self
                    .save_binding_then(&mut pass, ReconcileAction::Done)
                    .await;
            }
            debug!("Binding {} is up to date", pass.key);
            return Ok(ReconcileAction::Done);
        }
        self.bind(pass).await
    }

    async fn save_binding(&self, pass: &mut BindingPass) -> Result<Option<()>, ReconcilerError> {
        match write_status(self.bindings.as_ref(), &pass.binding, pass.status.clone()).await? {
            Some(binding) => {
                pass.binding = binding;
                Ok(Some(()))
            }
            None => Ok(None),
        }
    }

    async fn save_binding_then(
        &self,
        pass: &mut BindingPass,
        action: ReconcileAction,
    ) -> Result<ReconcileAction, ReconcilerError> {
        Ok(match self.save_binding(pass).await? {
            Some(()) => action,
            None => ReconcileAction::RequeueNow,
        })
    }

    async fn referenced_instance(
        &self,
        pass: &BindingPass,
    ) -> Result<Option<ServiceInstance>, ReconcilerError> {
        Ok(self
            .instances
            .get(&pass.key.namespace, &pass.binding.spec.instance_ref.name)
            .await?)
    }

    /// Broker and ids of the instance the binding belongs to
    async fn bound_instance(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Result<BoundInstance, PreparationFailure<BindingReason>>, ReconcilerError> {
        let status = instance.current_status();
        let Some(properties) = status
            .external_properties
            .or(status.in_progress_properties)
        else {
            return Ok(Err(PreparationFailure::broker(
                BindingReason::ErrorInstanceNotReady,
                "the instance has not been provisioned",
            )));
        };
        let instance_id = instance
            .external_id()
            .ok_or(StoreError::MissingMetadata("uid"))?;
        match self.brokers.resolve(&instance.spec.broker_name).await {
            Ok(broker) => Ok(Ok(BoundInstance {
                broker,
                instance_id,
                properties,
            })),
            Err(e) => Ok(Err(PreparationFailure::broker(
                registry_reason(&e),
                e.to_string(),
            ))),
        }
    }

    fn schedule_binding_retry(
        &self,
        pass: &mut BindingPass,
        reason: BindingReason,
        message: String,
    ) -> std::time::Duration {
        let delay = self.policy().retry_delay(pass.status.operation_attempts);
        pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
        pass.set_ready(ConditionStatus::False, reason, message);
        delay
    }

    async fn binding_preparation_failed(
        &self,
        mut pass: BindingPass,
        failure: PreparationFailure<BindingReason>,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let expired = self.policy().is_expired(pass.operation_start(), pass.now);
        match preparation_disposition(
            self.config.parameters_error_policy,
            failure.parameters,
            expired,
        ) {
            Disposition::Retry => {
                warn!(
                    "Binding {} cannot be reconciled yet: {}",
                    pass.key, failure.message
                );
                let delay = self.schedule_binding_retry(&mut pass, failure.reason, failure.message);
                self.save_binding_then(&mut pass, ReconcileAction::retry(delay))
                    .await
            }
            Disposition::Fail => {
                let message = if expired && !failure.parameters {
                    format!("stopped retrying: {}", failure.message)
                } else {
                    failure.message
                };
                self.fail_binding(pass, failure.reason, message).await
            }
        }
    }

    /// Record that the binding waits for its instance; no operation is started
    async fn binding_waits(
        &self,
        mut pass: BindingPass,
        reason: BindingReason,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        info!("Binding {} waits: {}", pass.key, message);
        pass.set_ready(ConditionStatus::False, reason, message);
        self.save_binding_then(&mut pass, ReconcileAction::Done)
            .await
    }

    async fn bind(&self, mut pass: BindingPass) -> Result<ReconcileAction, ReconcilerError> {
        let instance_name = pass.binding.spec.instance_ref.name.clone();
        let Some(instance) = self.referenced_instance(&pass).await? else {
            return self
                .binding_waits(
                    pass,
                    BindingReason::ErrorNonexistentServiceInstance,
                    format!("instance {instance_name} does not exist"),
                )
                .await;
        };
        let instance_ready = instance
            .current_status()
            .condition_is_true(ConditionType::Ready.as_str());
        if !instance_ready || instance.metadata.deletion_timestamp.is_some() {
            return self
                .binding_waits(
                    pass,
                    BindingReason::ErrorInstanceNotReady,
                    format!("instance {instance_name} is not ready"),
                )
                .await;
        }

        if pass.status.current_operation != Some(BindingOperation::Bind)
            || pass.status.observed_generation != Some(pass.generation)
        {
            pass.begin_operation(BindingOperation::Bind);
            pass.set_ready(
                ConditionStatus::False,
                BindingReason::Binding,
                "Binding to the service instance",
            );
        }

        let bound = match self.bound_instance(&instance).await? {
            Ok(bound) => bound,
            Err(failure) => return self.binding_preparation_failed(pass, failure).await,
        };
        let bindable = match bound.broker.catalog.resolve_plan(
            &bound.properties.class_external_name,
            &bound.properties.plan_external_name,
        ) {
            Ok(plan) => plan.bindable,
            Err(e) => {
                let failure =
                    PreparationFailure::broker(BindingReason::ErrorFetchingCatalog, e.to_string());
                return self.binding_preparation_failed(pass, failure).await;
            }
        };
        if !bindable {
            return self
                .fail_binding(
                    pass,
                    BindingReason::ErrorNonbindableServiceClass,
                    format!(
                        "plan {} of class {} is not bindable",
                        bound.properties.plan_external_name, bound.properties.class_external_name
                    ),
                )
                .await;
        }

        let spec = &pass.binding.spec;
        let resolved = match resolve_parameters(
            &pass.key.namespace,
            spec.parameters.as_ref(),
            &spec.parameters_from,
            self.secrets.as_ref(),
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                let failure =
                    PreparationFailure::parameters(BindingReason::ErrorWithParameters, e.to_string());
                return self.binding_preparation_failed(pass, failure).await;
            }
        };
        let identity = OriginatingIdentity::from_user_info(spec.user_info.as_ref())?;

        pass.status.in_progress_properties = Some(BindingProperties {
            parameters: resolved.redacted,
            parameter_checksum: resolved.checksum,
            user_info: spec.user_info.clone(),
        });
        pass.status.unbind_status = Some(UnbindStatus::Required);
        if self.save_binding(&mut pass).await?.is_none() {
            return Ok(ReconcileAction::RequeueNow);
        }

        let request = BindRequest {
            instance_id: bound.instance_id.clone(),
            binding_id: pass.external_id()?,
            service_id: bound.properties.service_id.clone(),
            plan_id: bound.properties.plan_id.clone(),
            parameters: resolved.parameters,
            context: json!({
                "platform": ORIGINATING_IDENTITY_PLATFORM,
                "namespace": pass.key.namespace,
                "clusterid": self.config.cluster_id,
            }),
            originating_identity: identity,
        };
        info!(
            "Binding {} to instance {} (attempt {})",
            pass.key,
            instance_name,
            pass.status.operation_attempts + 1
        );

        match bound.broker.adapter.bind(&request).await {
            CallOutcome::Succeeded(response) => {
                self.inject_credentials(pass, response.credentials.unwrap_or_default())
                    .await
            }
            CallOutcome::InProgress(operation) => {
                info!("Broker accepted bind of {} asynchronously", pass.key);
                pass.status.async_op_in_progress = true;
                pass.status.last_operation = operation;
                pass.status.operation_attempts = 0;
                let delay = self.policy().poll_delay(0);
                self.save_binding_then(&mut pass, ReconcileAction::poll(delay))
                    .await
            }
            CallOutcome::FailedRetriable(failure) => self.bind_failed(pass, failure, true).await,
            CallOutcome::Failed(failure) => self.bind_failed(pass, failure, false).await,
        }
    }

    async fn bind_failed(
        &self,
        mut pass: BindingPass,
        failure: CallFailure,
        retriable: bool,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let expired = self.policy().is_expired(pass.operation_start(), pass.now);
        if retriable && !failure.orphan_risk {
            if expired {
                return self
                    .start_binding_orphan_mitigation(
                        pass,
                        false,
                        BindingReason::ErrorReconciliationRetryTimeout,
                        format!("stopped retrying bind: {}", failure.message),
                    )
                    .await;
            }
            let delay =
                self.schedule_binding_retry(&mut pass, BindingReason::BindCallFailed, failure.message);
            return self
                .save_binding_then(&mut pass, ReconcileAction::retry(delay))
                .await;
        }
        pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
        self.start_binding_orphan_mitigation(
            pass,
            retriable && !expired,
            BindingReason::BindCallFailed,
            failure.message,
        )
        .await
    }

    /// Transform the broker credentials and write them to the binding's secret
    async fn inject_credentials(
        &self,
        mut pass: BindingPass,
        credentials: Map<String, Value>,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let secret_name = pass.secret_name()?;
        let transformed = apply_transforms(
            credentials_from_broker(credentials),
            &pass.binding.spec.secret_transforms,
            &pass.key.namespace,
            self.secrets.as_ref(),
        )
        .await;
        let injected = match transformed {
            Ok(credentials) => {
                self.write_credentials(&pass, &secret_name, to_secret_data(credentials))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = injected {
            let retry = injection_retriable(&e)
                && !self.policy().is_expired(pass.operation_start(), pass.now);
            pass.status.async_op_in_progress = false;
            pass.status.last_operation = None;
            return self
                .start_binding_orphan_mitigation(
                    pass,
                    retry,
                    BindingReason::ErrorInjectingBindResult,
                    e.to_string(),
                )
                .await;
        }

        info!(
            "✅ Binding {} ready, credentials in secret {}",
            pass.key, secret_name
        );
        pass.status.external_properties = pass.status.in_progress_properties.take();
        pass.status.reconciled_generation = Some(pass.generation);
        pass.clear_operation();
        pass.set_ready(
            ConditionStatus::True,
            BindingReason::InjectedBindResult,
            "Injected bind result",
        );
        let action = pass.settled();
        self.save_binding_then(&mut pass, action).await
    }

    /// Write the credentials secret unless something else controls it
    async fn write_credentials(
        &self,
        pass: &BindingPass,
        secret_name: &str,
        data: SecretData,
    ) -> Result<(), TransformError> {
        let namespace = &pass.key.namespace;
        let uid = pass.binding.metadata.uid.as_deref().unwrap_or_default();
        let ownership = self.secrets.secret_ownership(namespace, secret_name).await?;
        if !ownership.writable_by(uid) {
            return Err(TransformError::SecretNotOwned {
                namespace: namespace.clone(),
                name: secret_name.to_string(),
            });
        }
        self.secrets
            .apply_secret(
                namespace,
                secret_name,
                data,
                pass.binding.controller_owner_ref(&()),
            )
            .await?;
        Ok(())
    }

    async fn fail_binding(
        &self,
        mut pass: BindingPass,
        reason: BindingReason,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        warn!("❌ Binding {} failed: {}", pass.key, message);
        pass.set_ready(ConditionStatus::False, reason, message.clone());
        pass.set_failed(reason, message);
        pass.status.reconciled_generation = Some(pass.generation);
        pass.clear_operation();
        let action = pass.settled();
        self.save_binding_then(&mut pass, action).await
    }

    fn last_operation_request(
        &self,
        pass: &BindingPass,
        bound: &BoundInstance,
    ) -> Result<LastOperationRequest, ReconcilerError> {
        Ok(LastOperationRequest {
            instance_id: bound.instance_id.clone(),
            binding_id: Some(pass.external_id()?),
            service_id: Some(bound.properties.service_id.clone()),
            plan_id: Some(bound.properties.plan_id.clone()),
            operation: pass.status.last_operation.clone(),
            originating_identity: OriginatingIdentity::from_user_info(
                pass.binding.spec.user_info.as_ref(),
            )?,
        })
    }

    async fn poll_binding_operation(
        &self,
        mut pass: BindingPass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let operation = match pass.status.current_operation {
            Some(operation) => operation,
            None => {
                warn!(
                    "Binding {} has an outstanding poll without an operation, clearing it",
                    pass.key
                );
                pass.status.async_op_in_progress = false;
                pass.status.last_operation = None;
                return self
                    .save_binding_then(&mut pass, ReconcileAction::RequeueNow)
                    .await;
            }
        };
        if operation == BindingOperation::Unbind {
            return self.unbind(pass).await;
        }

        let Some(instance) = self.referenced_instance(&pass).await? else {
            // Nothing left to poll against; the instance and its bindings are gone at the broker
            pass.clear_operation();
            pass.set_ready(
                ConditionStatus::False,
                BindingReason::ErrorNonexistentServiceInstance,
                "the instance was deleted during an asynchronous bind",
            );
            return self
                .save_binding_then(&mut pass, ReconcileAction::RequeueNow)
                .await;
        };
        let bound = match self.bound_instance(&instance).await? {
            Ok(bound) => bound,
            Err(failure) => {
                return self
                    .binding_poll_error(pass, failure.reason, failure.message)
                    .await;
            }
        };
        let request = self.last_operation_request(&pass, &bound)?;
        let outcome = bound
            .broker
            .adapter
            .poll_binding(OperationKind::Bind, &request)
            .await;
        debug!("Polled bind of {}: {}", pass.key, outcome.label());

        match outcome {
            PollOutcome::InProgress(description) => {
                pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
                if self.policy().is_expired(pass.operation_start(), pass.now) {
                    pass.status.async_op_in_progress = false;
                    pass.status.last_operation = None;
                    return self
                        .start_binding_orphan_mitigation(
                            pass,
                            false,
                            BindingReason::ErrorReconciliationRetryTimeout,
                            "bind did not finish in time".to_string(),
                        )
                        .await;
                }
                pass.set_ready(
                    ConditionStatus::False,
                    BindingReason::Binding,
                    description.unwrap_or_else(|| "The bind is in progress".to_string()),
                );
                let delay = self.policy().poll_delay(pass.status.operation_attempts);
                self.save_binding_then(&mut pass, ReconcileAction::poll(delay))
                    .await
            }
            PollOutcome::Succeeded => {
                if pass.deleting {
                    info!(
                        "Asynchronous bind of deleted binding {} finished, unbinding",
                        pass.key
                    );
                    pass.clear_operation();
                    return self
                        .save_binding_then(&mut pass, ReconcileAction::RequeueNow)
                        .await;
                }
                self.fetch_binding(pass, &bound).await
            }
            PollOutcome::Failed(message) => {
                pass.status.async_op_in_progress = false;
                pass.status.last_operation = None;
                let retry = !self.policy().is_expired(pass.operation_start(), pass.now);
                pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
                self.start_binding_orphan_mitigation(
                    pass,
                    retry,
                    BindingReason::BindCallFailed,
                    message,
                )
                .await
            }
            PollOutcome::Error(message) => {
                self.binding_poll_error(pass, BindingReason::ErrorPollingLastOperation, message)
                    .await
            }
        }
    }

    /// A bind poll could not be answered; keep polling within the budget
    async fn binding_poll_error(
        &self,
        mut pass: BindingPass,
        reason: BindingReason,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
        if self.policy().is_expired(pass.operation_start(), pass.now) {
            pass.status.async_op_in_progress = false;
            pass.status.last_operation = None;
            return self
                .start_binding_orphan_mitigation(
                    pass,
                    false,
                    BindingReason::ErrorReconciliationRetryTimeout,
                    message,
                )
                .await;
        }
        pass.set_ready(ConditionStatus::Unknown, reason, message);
        let delay = self.policy().poll_delay(pass.status.operation_attempts);
        self.save_binding_then(&mut pass, ReconcileAction::poll(delay))
            .await
    }

    /// Fetch the credentials of a finished asynchronous bind
    async fn fetch_binding(
        &self,
        mut pass: BindingPass,
        bound: &BoundInstance,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let request = GetBindingRequest {
            instance_id: bound.instance_id.clone(),
            binding_id: pass.external_id()?,
        };
        match bound.broker.adapter.get_binding(&request).await {
            CallOutcome::Succeeded(response) => {
                pass.status.async_op_in_progress = false;
                pass.status.last_operation = None;
                self.inject_credentials(pass, response.credentials.unwrap_or_default())
                    .await
            }
            // A broker answering 202 here still has the bind pending
            CallOutcome::InProgress(_) => {
                let delay = self.policy().poll_delay(pass.status.operation_attempts);
                Ok(ReconcileAction::poll(delay))
            }
            CallOutcome::FailedRetriable(failure) => {
                if self.policy().is_expired(pass.operation_start(), pass.now) {
                    pass.status.async_op_in_progress = false;
                    pass.status.last_operation = None;
                    return self
                        .start_binding_orphan_mitigation(
                            pass,
                            false,
                            BindingReason::ErrorReconciliationRetryTimeout,
                            failure.message,
                        )
                        .await;
                }
                // The bind stays marked in progress so the next pass fetches again
                let delay = self.schedule_binding_retry(
                    &mut pass,
                    BindingReason::ErrorPollingLastOperation,
                    failure.message,
                );
                self.save_binding_then(&mut pass, ReconcileAction::retry(delay))
                    .await
            }
            CallOutcome::Failed(failure) => {
                pass.status.async_op_in_progress = false;
                pass.status.last_operation = None;
                self.start_binding_orphan_mitigation(
                    pass,
                    false,
                    BindingReason::BindCallFailed,
                    failure.message,
                )
                .await
            }
        }
    }

    async fn start_binding_orphan_mitigation(
        &self,
        mut pass: BindingPass,
        retry: bool,
        reason: BindingReason,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        warn!(
            "Starting orphan mitigation for binding {} (retry afterwards: {}): {}",
            pass.key, retry, message
        );
        metrics::increment_orphan_mitigations("ServiceBinding");
        pass.set_ready(ConditionStatus::False, reason, message);
        set_condition(
            &mut pass.status.conditions,
            ConditionType::OrphanMitigation,
            ConditionStatus::True,
            BindingReason::StartingOrphanMitigation,
            "Unbinding credentials the broker may have issued",
            pass.now,
        );
        pass.status.orphan_mitigation_in_progress = true;
        pass.status.orphan_mitigation_start_time = Some(format_time(pass.now));
        pass.status.orphan_mitigation_attempts = 0;
        pass.status.retry_after_orphan_mitigation = retry;
        pass.status.async_op_in_progress = false;
        pass.status.last_operation = None;
        self.save_binding_then(&mut pass, ReconcileAction::RequeueNow)
            .await
    }

    async fn binding_orphan_mitigation(
        &self,
        mut pass: BindingPass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let Some(instance) = self.referenced_instance(&pass).await? else {
            // Deleting the instance removed every binding at the broker
            return self.finish_binding_orphan_mitigation(pass).await;
        };
        let bound = match self.bound_instance(&instance).await? {
            Ok(bound) => bound,
            Err(failure) => {
                return self
                    .retry_binding_orphan_mitigation(pass, failure.message)
                    .await;
            }
        };

        if pass.status.async_op_in_progress {
            let request = self.last_operation_request(&pass, &bound)?;
            return match bound
                .broker
                .adapter
                .poll_binding(OperationKind::Unbind, &request)
                .await
            {
                PollOutcome::Succeeded => self.finish_binding_orphan_mitigation(pass).await,
                PollOutcome::InProgress(_) => {
                    pass.status.orphan_mitigation_attempts =
                        pass.status.orphan_mitigation_attempts.saturating_add(1);
                    if self.binding_orphan_mitigation_expired(&pass) {
                        return self
                            .binding_orphan_mitigation_failed(
                                pass,
                                "orphan mitigation did not finish in time".to_string(),
                            )
                            .await;
                    }
                    let delay = self
                        .policy()
                        .poll_delay(pass.status.orphan_mitigation_attempts);
                    self.save_binding_then(&mut pass, ReconcileAction::poll(delay))
                        .await
                }
                PollOutcome::Failed(message) | PollOutcome::Error(message) => {
                    pass.status.async_op_in_progress = false;
                    pass.status.last_operation = None;
                    self.retry_binding_orphan_mitigation(pass, message).await
                }
            };
        }

        let request = UnbindRequest {
            instance_id: bound.instance_id.clone(),
            binding_id: pass.external_id()?,
            service_id: bound.properties.service_id.clone(),
            plan_id: bound.properties.plan_id.clone(),
            originating_identity: OriginatingIdentity::from_user_info(
                pass.binding.spec.user_info.as_ref(),
            )?,
        };
        info!("Orphan mitigation: unbinding {}", pass.key);
        match bound.broker.adapter.unbind(&request).await {
            CallOutcome::Succeeded(_) => self.finish_binding_orphan_mitigation(pass).await,
            CallOutcome::InProgress(operation) => {
                pass.status.async_op_in_progress = true;
                pass.status.last_operation = operation;
                pass.status.orphan_mitigation_attempts = 0;
                let delay = self.policy().poll_delay(0);
                self.save_binding_then(&mut pass, ReconcileAction::poll(delay))
                    .await
            }
            CallOutcome::Failed(failure) | CallOutcome::FailedRetriable(failure) => {
                self.retry_binding_orphan_mitigation(pass, failure.message)
                    .await
            }
        }
    }

    fn binding_orphan_mitigation_expired(&self, pass: &BindingPass) -> bool {
        let start = parse_time(pass.status.orphan_mitigation_start_time.as_deref())
            .unwrap_or(pass.now);
        self.policy().is_expired(start, pass.now)
    }

    async fn retry_binding_orphan_mitigation(
        &self,
        mut pass: BindingPass,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        if self.binding_orphan_mitigation_expired(&pass) {
            return self.binding_orphan_mitigation_failed(pass, message).await;
        }
        warn!(
            "Orphan mitigation of binding {} failed, retrying: {}",
            pass.key, message
        );
        let delay = self
            .policy()
            .retry_delay(pass.status.orphan_mitigation_attempts);
        pass.status.orphan_mitigation_attempts =
            pass.status.orphan_mitigation_attempts.saturating_add(1);
        set_condition(
            &mut pass.status.conditions,
            ConditionType::OrphanMitigation,
            ConditionStatus::True,
            BindingReason::StartingOrphanMitigation,
            message,
            pass.now,
        );
        self.save_binding_then(&mut pass, ReconcileAction::retry(delay))
            .await
    }

    async fn finish_binding_orphan_mitigation(
        &self,
        mut pass: BindingPass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        info!("Orphan mitigation of binding {} completed", pass.key);
        let retry = pass.status.retry_after_orphan_mitigation
            && !pass.deleting
            && !self.policy().is_expired(pass.operation_start(), pass.now);
        pass.clear_orphan_mitigation();
        set_condition(
            &mut pass.status.conditions,
            ConditionType::OrphanMitigation,
            ConditionStatus::False,
            BindingReason::OrphanMitigationSuccessful,
            "Orphan mitigation was completed successfully",
            pass.now,
        );
        pass.status.unbind_status = Some(UnbindStatus::Succeeded);

        if pass.deleting {
            pass.clear_operation();
            return self
                .save_binding_then(&mut pass, ReconcileAction::RequeueNow)
                .await;
        }
        if retry {
            let delay = self.policy().retry_delay(pass.status.operation_attempts);
            return self
                .save_binding_then(&mut pass, ReconcileAction::retry(delay))
                .await;
        }
        copy_condition(
            &mut pass.status.conditions,
            ConditionType::Ready,
            ConditionType::Failed,
            ConditionStatus::True,
            pass.now,
        );
        pass.status.reconciled_generation = Some(pass.generation);
        pass.clear_operation();
        self.save_binding_then(&mut pass, ReconcileAction::Done)
            .await
    }

    async fn binding_orphan_mitigation_failed(
        &self,
        mut pass: BindingPass,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        warn!(
            "❌ Orphan mitigation of binding {} failed: {}",
            pass.key, message
        );
        pass.clear_orphan_mitigation();
        let reason = BindingReason::OrphanMitigationFailed;
        set_condition(
            &mut pass.status.conditions,
            ConditionType::OrphanMitigation,
            ConditionStatus::False,
            reason,
            message.clone(),
            pass.now,
        );
        pass.set_ready(ConditionStatus::False, reason, message.clone());
        pass.set_failed(reason, message);
        pass.status.reconciled_generation = Some(pass.generation);
        pass.clear_operation();
        let action = pass.settled();
        self.save_binding_then(&mut pass, action).await
    }

    async fn unbind(&self, mut pass: BindingPass) -> Result<ReconcileAction, ReconcilerError> {
        match pass.status.unbind_status {
            None | Some(UnbindStatus::Succeeded) => return self.release_binding(pass).await,
            Some(UnbindStatus::FailedPermanently) => {
                debug!(
                    "Unbind of {} failed permanently, keeping the finalizer",
                    pass.key
                );
                return Ok(ReconcileAction::Done);
            }
            Some(UnbindStatus::Required | UnbindStatus::FailedRetriable) => {}
        }

        if pass.status.current_operation != Some(BindingOperation::Unbind) {
            pass.begin_operation(BindingOperation::Unbind);
            pass.set_ready(
                ConditionStatus::False,
                BindingReason::Unbinding,
                "Unbinding from the service instance",
            );
        }

        let Some(instance) = self.referenced_instance(&pass).await? else {
            info!(
                "Instance of binding {} is gone, nothing to unbind",
                pass.key
            );
            return self.finish_unbind(pass).await;
        };
        let bound = match self.bound_instance(&instance).await? {
            Ok(bound) => bound,
            Err(failure) => return self.unbind_retry(pass, failure.message).await,
        };

        if pass.status.async_op_in_progress {
            let request = self.last_operation_request(&pass, &bound)?;
            let outcome = bound
                .broker
                .adapter
                .poll_binding(OperationKind::Unbind, &request)
                .await;
            debug!("Polled unbind of {}: {}", pass.key, outcome.label());
            return match outcome {
                PollOutcome::Succeeded => self.finish_unbind(pass).await,
                PollOutcome::InProgress(description) => {
                    pass.status.operation_attempts =
                        pass.status.operation_attempts.saturating_add(1);
                    pass.set_ready(
                        ConditionStatus::False,
                        BindingReason::Unbinding,
                        description.unwrap_or_else(|| "The unbind is in progress".to_string()),
                    );
                    let delay = self.policy().poll_delay(pass.status.operation_attempts);
                    self.save_binding_then(&mut pass, ReconcileAction::poll(delay))
                        .await
                }
                PollOutcome::Failed(message) | PollOutcome::Error(message) => {
                    pass.status.async_op_in_progress = false;
                    pass.status.last_operation = None;
                    self.unbind_retry(pass, message).await
                }
            };
        }

        if self.save_binding(&mut pass).await?.is_none() {
            return Ok(ReconcileAction::RequeueNow);
        }
        let request = UnbindRequest {
            instance_id: bound.instance_id.clone(),
            binding_id: pass.external_id()?,
            service_id: bound.properties.service_id.clone(),
            plan_id: bound.properties.plan_id.clone(),
            originating_identity: OriginatingIdentity::from_user_info(
                pass.binding.spec.user_info.as_ref(),
            )?,
        };
        info!(
            "Unbinding {} (attempt {})",
            pass.key,
            pass.status.operation_attempts + 1
        );
        match bound.broker.adapter.unbind(&request).await {
            CallOutcome::Succeeded(_) => self.finish_unbind(pass).await,
            CallOutcome::InProgress(operation) => {
                info!("Broker accepted unbind of {} asynchronously", pass.key);
                pass.status.async_op_in_progress = true;
                pass.status.last_operation = operation;
                pass.status.operation_attempts = 0;
                let delay = self.policy().poll_delay(0);
                self.save_binding_then(&mut pass, ReconcileAction::poll(delay))
                    .await
            }
            CallOutcome::FailedRetriable(failure) => self.unbind_retry(pass, failure.message).await,
            CallOutcome::Failed(failure) => {
                warn!(
                    "❌ Unbind of {} failed permanently: {}",
                    pass.key, failure.message
                );
                pass.status.unbind_status = Some(UnbindStatus::FailedPermanently);
                pass.set_ready(
                    ConditionStatus::False,
                    BindingReason::UnbindCallFailed,
                    failure.message.clone(),
                );
                pass.set_failed(BindingReason::UnbindCallFailed, failure.message);
                pass.status.reconciled_generation = Some(pass.generation);
                pass.clear_operation();
                self.save_binding_then(&mut pass, ReconcileAction::Done)
                    .await
            }
        }
    }

    /// Unbind never gives up; past the budget it is only marked `FailedRetriable`
    async fn unbind_retry(
        &self,
        mut pass: BindingPass,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        if self.policy().is_expired(pass.operation_start(), pass.now)
            && pass.status.unbind_status != Some(UnbindStatus::FailedRetriable)
        {
            warn!(
                "Unbind of {} is past its retry budget, still retrying",
                pass.key
            );
            pass.status.unbind_status = Some(UnbindStatus::FailedRetriable);
        }
        let delay = self.policy().retry_delay(pass.status.operation_attempts);
        pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
        pass.set_ready(ConditionStatus::Unknown, BindingReason::UnbindCallFailed, message);
        self.save_binding_then(&mut pass, ReconcileAction::retry(delay))
            .await
    }

    async fn finish_unbind(&self, mut pass: BindingPass) -> Result<ReconcileAction, ReconcilerError> {
        info!("✅ Binding {} unbound", pass.key);
        pass.status.unbind_status = Some(UnbindStatus::Succeeded);
        pass.status.external_properties = None;
        pass.clear_operation();
        pass.set_ready(
            ConditionStatus::False,
            BindingReason::UnboundSuccessfully,
            "The binding was unbound successfully",
        );
        if self.save_binding(&mut pass).await?.is_none() {
            return Ok(ReconcileAction::RequeueNow);
        }
        self.release_binding(pass).await
    }

    /// Delete the credentials secret and drop the finalizer
    async fn release_binding(&self, pass: BindingPass) -> Result<ReconcileAction, ReconcilerError> {
        if let Some(secret_name) = pass.binding.secret_name() {
            let uid = pass.binding.metadata.uid.as_deref().unwrap_or_default();
            let ownership = self
                .secrets
                .secret_ownership(&pass.key.namespace, &secret_name)
                .await?;
            if ownership.is_controlled_by(uid) {
                self.secrets
                    .delete_secret(&pass.key.namespace, &secret_name)
                    .await?;
            } else if ownership != SecretOwnership::Absent {
                debug!(
                    "Leaving secret {}/{} in place, binding {} does not control it",
                    pass.key.namespace, secret_name, pass.key
                );
            }
        }
        info!("Releasing binding {}", pass.key);
        Ok(
            match remove_finalizer(self.bindings.as_ref(), &pass.binding).await? {
                Some(_) => ReconcileAction::Done,
                None => ReconcileAction::RequeueNow,
            },
        )
    }
}
