//! # Instance Reconciler
//!
//! Drives a ServiceInstance through provision, update and deprovision.
//!
//! Each pass reads the instance, issues at most one broker call and records
//! the result in status before returning a requeue decision. Everything needed
//! to resume (current operation, start time, attempts, broker operation token,
//! orphan mitigation state) lives in status, so a restarted controller picks up
//! exactly where the previous one stopped.
//!
//! ## Pass order
//!
//! 1. Orphan mitigation in progress: deprovision (or poll it)
//! 2. Asynchronous operation outstanding: poll it
//! 3. Deletion requested: deprovision, then release the finalizer
//! 4. Terminally failed at the current generation: nothing to do
//! 5. Not provisioned: provision
//! 6. Generation changed: update when plan, parameters or `updateRequests` changed

use crate::broker::adapter::OperationKind;
use crate::broker::{
    CallFailure, CallOutcome, CatalogLookupError, DeprovisionRequest, LastOperationRequest,
    OriginatingIdentity, PollOutcome, ProvisionRequest, RegistryError, ResolvedBroker,
    UpdateInstanceRequest,
};
use crate::constants::ORIGINATING_IDENTITY_PLATFORM;
use crate::controller::parameters::resolve_parameters;
use crate::controller::reconciler::conditions::{
    copy_condition, format_time, parse_time, remove_condition, set_condition,
};
use crate::controller::reconciler::reasons::{ConditionStatus, ConditionType, InstanceReason};
use crate::controller::reconciler::types::{
    Disposition, PreparationFailure, ReconcileAction, Reconciler, ReconcilerError, RequeueReason,
    ResourceKey, StatusResource, ensure_finalizer, preparation_disposition, remove_finalizer,
    write_status,
};
use crate::crd::{
    DeprovisionStatus, HasConditions, InstanceOperation, InstanceProperties, ProvisionStatus,
    ServiceInstance, ServiceInstanceStatus,
};
use crate::observability::metrics;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{Instrument, debug, info, info_span, warn};

/// State of one pass over one instance
struct InstancePass {
    key: ResourceKey,
    instance: ServiceInstance,
    status: ServiceInstanceStatus,
    generation: i64,
    now: DateTime<Utc>,
    deleting: bool,
}

impl InstancePass {
    fn new(key: ResourceKey, instance: ServiceInstance) -> Self {
        Self {
            key,
            status: instance.current_status(),
            generation: instance.metadata.generation.unwrap_or(0),
            now: Utc::now(),
            deleting: instance.metadata.deletion_timestamp.is_some(),
            instance,
        }
    }

    fn external_id(&self) -> Result<String, StoreError> {
        self.instance
            .external_id()
            .ok_or(StoreError::MissingMetadata("uid"))
    }

    fn set_ready(
        &mut self,
        status: ConditionStatus,
        reason: InstanceReason,
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

    fn set_failed(&mut self, reason: InstanceReason, message: impl Into<String>) {
        set_condition(
            &mut self.status.conditions,
            ConditionType::Failed,
            ConditionStatus::True,
            reason,
            message,
            self.now,
        );
    }

    /// Start of the current operation; a missing start counts as now
    fn operation_start(&self) -> DateTime<Utc> {
        parse_time(self.status.operation_start_time.as_deref()).unwrap_or(self.now)
    }

    fn begin_operation(&mut self, operation: InstanceOperation) {
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

    /// Catalog ids of the plan the broker knows this instance by
    fn known_properties(&self) -> Option<&InstanceProperties> {
        self.status
            .in_progress_properties
            .as_ref()
            .or(self.status.external_properties.as_ref())
    }

    /// Context object sent with provision and update requests
    fn context(&self, cluster_id: &str) -> Value {
        json!({
            "platform": ORIGINATING_IDENTITY_PLATFORM,
            "namespace": self.key.namespace,
            "clusterid": cluster_id,
            "instance_name": self.key.name,
        })
    }

    /// Action after a completed operation; a deleting instance moves on right away
    fn settled(&self) -> ReconcileAction {
        if self.deleting {
            ReconcileAction::RequeueNow
        } else {
            ReconcileAction::Done
        }
    }
}

/// Everything a provision or update call needs
struct PreparedInstance {
    broker: ResolvedBroker,
    properties: InstanceProperties,
    parameters: Option<Map<String, Value>>,
    identity: Option<OriginatingIdentity>,
}

fn registry_reason(error: &RegistryError) -> InstanceReason {
    match error {
        RegistryError::BrokerNotFound(_) | RegistryError::InvalidBroker { .. } => {
            InstanceReason::ReferencesNonexistentBroker
        }
        RegistryError::Catalog { .. } | RegistryError::Store(_) => {
            InstanceReason::ErrorFetchingCatalog
        }
    }
}

fn catalog_reason(error: &CatalogLookupError) -> InstanceReason {
    match error {
        CatalogLookupError::ClassNotFound(_) => InstanceReason::ReferencesNonexistentServiceClass,
        CatalogLookupError::PlanNotFound { .. } => {
            InstanceReason::ReferencesNonexistentServicePlan
        }
    }
}

fn operation_kind(operation: InstanceOperation) -> OperationKind {
    match operation {
        InstanceOperation::Provision => OperationKind::Provision,
        InstanceOperation::Update => OperationKind::Update,
        InstanceOperation::Deprovision => OperationKind::Deprovision,
    }
}

fn in_progress_reason(operation: InstanceOperation) -> InstanceReason {
    match operation {
        InstanceOperation::Provision => InstanceReason::Provisioning,
        InstanceOperation::Update => InstanceReason::UpdatingInstance,
        InstanceOperation::Deprovision => InstanceReason::Deprovisioning,
    }
}

/// Whether `desired` differs from what the broker last applied
fn needs_update(applied: &InstanceProperties, desired: &InstanceProperties) -> bool {
    applied.class_external_name != desired.class_external_name
        || applied.plan_external_name != desired.plan_external_name
        || applied.parameter_checksum != desired.parameter_checksum
        || applied.update_requests != desired.update_requests
}

impl Reconciler {
    /// Run one reconcile pass for the ServiceInstance at `key`
    pub async fn reconcile_instance(
        &self,
        key: &ResourceKey,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let Some(instance) = self.instances.get(&key.namespace, &key.name).await? else {
            debug!("ServiceInstance {} no longer exists", key);
            return Ok(ReconcileAction::Done);
        };
        let span = info_span!(
            "reconcile.instance",
            resource.namespace = %key.namespace,
            resource.name = %key.name,
            resource.generation = instance.metadata.generation.unwrap_or(0),
        );
        self.instance_pass(key.clone(), instance)
            .instrument(span)
            .await
    }

    async fn instance_pass(
        &self,
        key: ResourceKey,
        instance: ServiceInstance,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let instance = if instance.metadata.deletion_timestamp.is_some() {
            instance
        } else {
            match ensure_finalizer(self.instances.as_ref(), &instance).await? {
                Some(instance) => instance,
                None => return Ok(ReconcileAction::RequeueNow),
            }
        };
        let pass = InstancePass::new(key, instance);

        if pass.status.orphan_mitigation_in_progress {
            return self.instance_orphan_mitigation(pass).await;
        }
        if pass.status.async_op_in_progress {
            return self.poll_instance_operation(pass).await;
        }
        if pass.deleting {
            return self.deprovision_instance(pass).await;
        }
        if pass
            .status
            .condition_is_true(ConditionType::Failed.as_str())
            && pass.status.reconciled_generation == Some(pass.generation)
        {
            debug!(
                "Instance {} failed at generation {}, waiting for a spec change",
                pass.key, pass.generation
            );
            return Ok(ReconcileAction::Done);
        }
        if pass.status.provision_status == ProvisionStatus::NotProvisioned {
            return self.provision_instance(pass).await;
        }
        if pass.status.current_operation.is_none()
            && pass.status.reconciled_generation == Some(pass.generation)
        {
            debug!("Instance {} is up to date", pass.key);
            return Ok(ReconcileAction::Done);
        }
        self.update_instance(pass).await
    }

    /// Persist the pass status; `None` when the instance changed underneath
    async fn save_instance(
        &self,
        pass: &mut InstancePass,
    ) -> Result<Option<()>, ReconcilerError> {
        match write_status(self.instances.as_ref(), &pass.instance, pass.status.clone()).await? {
            Some(instance) => {
                pass.instance = instance;
                Ok(Some(()))
            }
            None => Ok(None),
        }
    }

    /// Persist and return `action`, or requeue at once on a conflict
    async fn save_instance_then(
        &self,
        pass: &mut InstancePass,
        action: ReconcileAction,
    ) -> Result<ReconcileAction, ReconcilerError> {
        Ok(match self.save_instance(pass).await? {
            Some(()) => action,
            None => ReconcileAction::RequeueNow,
        })
    }

    async fn prepare_instance(
        &self,
        pass: &InstancePass,
    ) -> Result<Result<PreparedInstance, PreparationFailure<InstanceReason>>, ReconcilerError> {
        let spec = &pass.instance.spec;
        let broker = match self.brokers.resolve(&spec.broker_name).await {
            Ok(broker) => broker,
            Err(e) => {
                return Ok(Err(PreparationFailure::broker(
                    registry_reason(&e),
                    e.to_string(),
                )));
            }
        };
        let plan = match broker
            .catalog
            .resolve_plan(&spec.class_external_name, &spec.plan_external_name)
        {
            Ok(plan) => plan,
            Err(e) => {
                return Ok(Err(PreparationFailure::broker(
                    catalog_reason(&e),
                    e.to_string(),
                )));
            }
        };
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
                return Ok(Err(PreparationFailure::parameters(
                    InstanceReason::ErrorWithParameters,
                    e.to_string(),
                )));
            }
        };
        let identity = OriginatingIdentity::from_user_info(spec.user_info.as_ref())?;

        Ok(Ok(PreparedInstance {
            broker,
            properties: InstanceProperties {
                class_external_name: spec.class_external_name.clone(),
                plan_external_name: spec.plan_external_name.clone(),
                service_id: plan.service_id,
                plan_id: plan.plan_id,
                parameters: resolved.redacted,
                parameter_checksum: resolved.checksum,
                update_requests: spec.update_requests,
                user_info: spec.user_info.clone(),
            },
            parameters: resolved.parameters,
            identity,
        }))
    }

    async fn instance_preparation_failed(
        &self,
        mut pass: InstancePass,
        failure: PreparationFailure<InstanceReason>,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let expired = self.policy().is_expired(pass.operation_start(), pass.now);
        match preparation_disposition(
            self.config.parameters_error_policy,
            failure.parameters,
            expired,
        ) {
            Disposition::Retry => {
                warn!(
                    "Instance {} cannot be reconciled yet: {}",
                    pass.key, failure.message
                );
                let delay = self.schedule_instance_retry(&mut pass, failure.reason, failure.message);
                self.save_instance_then(&mut pass, ReconcileAction::retry(delay))
                    .await
            }
            Disposition::Fail => {
                let message = if expired && !failure.parameters {
                    format!("stopped retrying: {}", failure.message)
                } else {
                    failure.message
                };
                self.fail_instance(pass, failure.reason, message).await
            }
        }
    }

    /// Count a failed attempt and return the delay before the next one
    fn schedule_instance_retry(
        &self,
        pass: &mut InstancePass,
        reason: InstanceReason,
        message: String,
    ) -> std::time::Duration {
        let delay = self.policy().retry_delay(pass.status.operation_attempts);
        pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
        pass.set_ready(ConditionStatus::False, reason, message);
        delay
    }

    async fn provision_instance(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        if pass.status.current_operation != Some(InstanceOperation::Provision)
            || pass.status.observed_generation != Some(pass.generation)
        {
            pass.begin_operation(InstanceOperation::Provision);
            pass.set_ready(
                ConditionStatus::False,
                InstanceReason::Provisioning,
                "Provisioning the service instance",
            );
        }

        let prepared = match self.prepare_instance(&pass).await? {
            Ok(prepared) => prepared,
            Err(failure) => return self.instance_preparation_failed(pass, failure).await,
        };

        pass.status.in_progress_properties = Some(prepared.properties.clone());
        pass.status.deprovision_status = DeprovisionStatus::Required;
        if self.save_instance(&mut pass).await?.is_none() {
            return Ok(ReconcileAction::RequeueNow);
        }

        let request = ProvisionRequest {
            instance_id: pass.external_id()?,
            service_id: prepared.properties.service_id.clone(),
            plan_id: prepared.properties.plan_id.clone(),
            organization_guid: self.config.cluster_id.clone(),
            space_guid: pass.key.namespace.clone(),
            parameters: prepared.parameters,
            context: pass.context(&self.config.cluster_id),
            originating_identity: prepared.identity,
        };
        info!(
            "Provisioning instance {} (plan {}, attempt {})",
            pass.key,
            prepared.properties.plan_external_name,
            pass.status.operation_attempts + 1
        );

        match prepared.broker.adapter.provision(&request).await {
            CallOutcome::Succeeded(response) => {
                if response.dashboard_url.is_some() {
                    pass.status.dashboard_url = response.dashboard_url;
                }
                self.finish_provision(pass).await
            }
            CallOutcome::InProgress(operation) => {
                self.begin_instance_polling(pass, operation).await
            }
            CallOutcome::FailedRetriable(failure) => {
                self.provision_failed(pass, failure, true).await
            }
            CallOutcome::Failed(failure) => self.provision_failed(pass, failure, false).await,
        }
    }

    async fn provision_failed(
        &self,
        mut pass: InstancePass,
        failure: CallFailure,
        retriable: bool,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let expired = self.policy().is_expired(pass.operation_start(), pass.now);
        if retriable && !failure.orphan_risk {
            if expired {
                return self
                    .start_instance_orphan_mitigation(
                        pass,
                        false,
                        InstanceReason::ErrorReconciliationRetryTimeout,
                        format!("stopped retrying provision: {}", failure.message),
                    )
                    .await;
            }
            let delay = self.schedule_instance_retry(
                &mut pass,
                InstanceReason::ProvisionCallFailed,
                failure.message,
            );
            return self
                .save_instance_then(&mut pass, ReconcileAction::retry(delay))
                .await;
        }
        pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
        self.start_instance_orphan_mitigation(
            pass,
            retriable && !expired,
            InstanceReason::ProvisionCallFailed,
            failure.message,
        )
        .await
    }

    async fn finish_provision(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        info!("✅ Instance {} provisioned", pass.key);
        pass.status.provision_status = ProvisionStatus::Provisioned;
        pass.status.external_properties = pass.status.in_progress_properties.take();
        pass.status.reconciled_generation = Some(pass.generation);
        pass.clear_operation();
        pass.set_ready(
            ConditionStatus::True,
            InstanceReason::ProvisionedSuccessfully,
            "The instance was provisioned successfully",
        );
        let action = pass.settled();
        self.save_instance_then(&mut pass, action).await
    }

    async fn begin_instance_polling(
        &self,
        mut pass: InstancePass,
        operation: Option<String>,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let Some(current) = pass.status.current_operation else {
            return Ok(ReconcileAction::RequeueNow);
        };
        info!(
            "Broker accepted {} of instance {} asynchronously",
            current.as_str(),
            pass.key
        );
        pass.status.async_op_in_progress = true;
        pass.status.last_operation = operation;
        pass.status.operation_attempts = 0;
        pass.set_ready(
            ConditionStatus::False,
            in_progress_reason(current),
            format!("The instance {} is in progress", current.as_str()),
        );
        let delay = self.policy().poll_delay(0);
        self.save_instance_then(&mut pass, ReconcileAction::poll(delay))
            .await
    }

    async fn update_instance(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let continuing = pass.status.current_operation == Some(InstanceOperation::Update)
            && pass.status.observed_generation == Some(pass.generation);

        let prepared = match self.prepare_instance(&pass).await? {
            Ok(prepared) => prepared,
            Err(failure) => {
                if !continuing {
                    pass.begin_operation(InstanceOperation::Update);
                }
                return self.instance_preparation_failed(pass, failure).await;
            }
        };

        let applied = pass.status.external_properties.clone().unwrap_or_default();
        if !continuing {
            if !needs_update(&applied, &prepared.properties) {
                debug!(
                    "Generation {} of instance {} changes nothing at the broker",
                    pass.generation, pass.key
                );
                pass.status.observed_generation = Some(pass.generation);
                pass.status.reconciled_generation = Some(pass.generation);
                return self
                    .save_instance_then(&mut pass, ReconcileAction::Done)
                    .await;
            }
            pass.begin_operation(InstanceOperation::Update);
        }
        pass.set_ready(
            ConditionStatus::False,
            InstanceReason::UpdatingInstance,
            "Updating the service instance",
        );
        pass.status.in_progress_properties = Some(prepared.properties.clone());
        if self.save_instance(&mut pass).await?.is_none() {
            return Ok(ReconcileAction::RequeueNow);
        }

        let parameters_changed = applied.parameter_checksum != prepared.properties.parameter_checksum;
        let request = UpdateInstanceRequest {
            instance_id: pass.external_id()?,
            service_id: prepared.properties.service_id.clone(),
            plan_id: (applied.plan_id != prepared.properties.plan_id)
                .then(|| prepared.properties.plan_id.clone()),
            parameters: if parameters_changed {
                Some(prepared.parameters.unwrap_or_default())
            } else {
                None
            },
            context: pass.context(&self.config.cluster_id),
            originating_identity: prepared.identity,
        };
        info!(
            "Updating instance {} (attempt {})",
            pass.key,
            pass.status.operation_attempts + 1
        );

        match prepared.broker.adapter.update(&request).await {
            CallOutcome::Succeeded(response) => {
                if response.dashboard_url.is_some() {
                    pass.status.dashboard_url = response.dashboard_url;
                }
                self.finish_update(pass).await
            }
            CallOutcome::InProgress(operation) => {
                self.begin_instance_polling(pass, operation).await
            }
            CallOutcome::FailedRetriable(failure) => {
                if self.policy().is_expired(pass.operation_start(), pass.now) {
                    return self
                        .fail_instance(
                            pass,
                            InstanceReason::ErrorReconciliationRetryTimeout,
                            format!("stopped retrying update: {}", failure.message),
                        )
                        .await;
                }
                let delay = self.schedule_instance_retry(
                    &mut pass,
                    InstanceReason::UpdateInstanceCallFailed,
                    failure.message,
                );
                self.save_instance_then(&mut pass, ReconcileAction::retry(delay))
                    .await
            }
            CallOutcome::Failed(failure) => {
                self.fail_instance(pass, InstanceReason::UpdateInstanceCallFailed, failure.message)
                    .await
            }
        }
    }

    async fn finish_update(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        info!("✅ Instance {} updated", pass.key);
        pass.status.external_properties = pass.status.in_progress_properties.take();
        pass.status.reconciled_generation = Some(pass.generation);
        pass.clear_operation();
        pass.set_ready(
            ConditionStatus::True,
            InstanceReason::InstanceUpdatedSuccessfully,
            "The instance was updated successfully",
        );
        let action = pass.settled();
        self.save_instance_then(&mut pass, action).await
    }

    /// Terminal failure of the current operation at this generation
    async fn fail_instance(
        &self,
        mut pass: InstancePass,
        reason: InstanceReason,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        warn!("❌ Instance {} failed: {}", pass.key, message);
        pass.set_ready(ConditionStatus::False, reason, message.clone());
        pass.set_failed(reason, message);
        pass.status.reconciled_generation = Some(pass.generation);
        pass.clear_operation();
        let action = pass.settled();
        self.save_instance_then(&mut pass, action).await
    }

    async fn poll_instance_operation(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let Some(operation) = pass.status.current_operation else {
            warn!(
                "Instance {} has an outstanding poll without an operation, clearing it",
                pass.key
            );
            pass.status.async_op_in_progress = false;
            pass.status.last_operation = None;
            return self
                .save_instance_then(&mut pass, ReconcileAction::RequeueNow)
                .await;
        };

        let outcome = match self.brokers.resolve(&pass.instance.spec.broker_name).await {
            Ok(broker) => {
                let request = LastOperationRequest {
                    instance_id: pass.external_id()?,
                    binding_id: None,
                    service_id: pass.known_properties().map(|p| p.service_id.clone()),
                    plan_id: pass.known_properties().map(|p| p.plan_id.clone()),
                    operation: pass.status.last_operation.clone(),
                    originating_identity: OriginatingIdentity::from_user_info(
                        pass.instance.spec.user_info.as_ref(),
                    )?,
                };
                broker
                    .adapter
                    .poll_instance(operation_kind(operation), &request)
                    .await
            }
            Err(e) => PollOutcome::Error(e.to_string()),
        };
        debug!(
            "Polled {} of instance {}: {}",
            operation.as_str(),
            pass.key,
            outcome.label()
        );

        match outcome {
            PollOutcome::Succeeded => match operation {
                InstanceOperation::Provision => self.finish_provision(pass).await,
                InstanceOperation::Update => self.finish_update(pass).await,
                InstanceOperation::Deprovision => self.finish_deprovision(pass).await,
            },
            PollOutcome::InProgress(description) => {
                pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
                if self.policy().is_expired(pass.operation_start(), pass.now) {
                    return self
                        .instance_retry_expired(
                            pass,
                            operation,
                            format!("{} did not finish in time", operation.as_str()),
                        )
                        .await;
                }
                pass.set_ready(
                    ConditionStatus::False,
                    in_progress_reason(operation),
                    description.unwrap_or_else(|| {
                        format!("The instance {} is in progress", operation.as_str())
                    }),
                );
                let delay = self.policy().poll_delay(pass.status.operation_attempts);
                self.save_instance_then(&mut pass, ReconcileAction::poll(delay))
                    .await
            }
            PollOutcome::Failed(message) => {
                pass.status.async_op_in_progress = false;
                pass.status.last_operation = None;
                match operation {
                    InstanceOperation::Provision => {
                        let retry = !self.policy().is_expired(pass.operation_start(), pass.now);
                        pass.status.operation_attempts =
                            pass.status.operation_attempts.saturating_add(1);
                        self.start_instance_orphan_mitigation(
                            pass,
                            retry,
                            InstanceReason::ProvisionCallFailed,
                            message,
                        )
                        .await
                    }
                    InstanceOperation::Update => {
                        self.fail_instance(pass, InstanceReason::UpdateInstanceCallFailed, message)
                            .await
                    }
                    InstanceOperation::Deprovision => {
                        self.deprovision_failed(pass, InstanceReason::DeprovisionCallFailed, message)
                            .await
                    }
                }
            }
            PollOutcome::Error(message) => {
                pass.status.operation_attempts = pass.status.operation_attempts.saturating_add(1);
                if self.policy().is_expired(pass.operation_start(), pass.now) {
                    return self.instance_retry_expired(pass, operation, message).await;
                }
                pass.set_ready(
                    ConditionStatus::Unknown,
                    InstanceReason::ErrorPollingLastOperation,
                    message,
                );
                let delay = self.policy().poll_delay(pass.status.operation_attempts);
                self.save_instance_then(&mut pass, ReconcileAction::poll(delay))
                    .await
            }
        }
    }

    /// The retry budget of `operation` ran out
    async fn instance_retry_expired(
        &self,
        mut pass: InstancePass,
        operation: InstanceOperation,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let reason = InstanceReason::ErrorReconciliationRetryTimeout;
        match operation {
            InstanceOperation::Provision => {
                pass.status.async_op_in_progress = false;
                pass.status.last_operation = None;
                self.start_instance_orphan_mitigation(pass, false, reason, message)
                    .await
            }
            InstanceOperation::Update => self.fail_instance(pass, reason, message).await,
            InstanceOperation::Deprovision => self.deprovision_failed(pass, reason, message).await,
        }
    }

    async fn start_instance_orphan_mitigation(
        &self,
        mut pass: InstancePass,
        retry: bool,
        reason: InstanceReason,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        warn!(
            "Starting orphan mitigation for instance {} (retry afterwards: {}): {}",
            pass.key, retry, message
        );
        metrics::increment_orphan_mitigations("ServiceInstance");
        pass.set_ready(ConditionStatus::False, reason, message);
        set_condition(
            &mut pass.status.conditions,
            ConditionType::OrphanMitigation,
            ConditionStatus::True,
            InstanceReason::StartingInstanceOrphanMitigation,
            "Deprovisioning an instance the broker may have created",
            pass.now,
        );
        pass.status.orphan_mitigation_in_progress = true;
        pass.status.orphan_mitigation_start_time = Some(format_time(pass.now));
        pass.status.orphan_mitigation_attempts = 0;
        pass.status.retry_after_orphan_mitigation = retry;
        pass.status.async_op_in_progress = false;
        pass.status.last_operation = None;
        self.save_instance_then(&mut pass, ReconcileAction::RequeueNow)
            .await
    }

    async fn instance_orphan_mitigation(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        let broker = match self.brokers.resolve(&pass.instance.spec.broker_name).await {
            Ok(broker) => broker,
            Err(e) => return self.retry_instance_orphan_mitigation(pass, e.to_string()).await,
        };
        let Some(properties) = pass.known_properties().cloned() else {
            // No provision request was built, so nothing can exist at the broker
            return self.finish_instance_orphan_mitigation(pass).await;
        };
        let identity = OriginatingIdentity::from_user_info(pass.instance.spec.user_info.as_ref())?;
        let instance_id = pass.external_id()?;

        if pass.status.async_op_in_progress {
            let request = LastOperationRequest {
                instance_id,
                binding_id: None,
                service_id: Some(properties.service_id),
                plan_id: Some(properties.plan_id),
                operation: pass.status.last_operation.clone(),
                originating_identity: identity,
            };
            return match broker
                .adapter
                .poll_instance(OperationKind::Deprovision, &request)
                .await
            {
                PollOutcome::Succeeded => self.finish_instance_orphan_mitigation(pass).await,
                PollOutcome::InProgress(_) => {
                    pass.status.orphan_mitigation_attempts =
                        pass.status.orphan_mitigation_attempts.saturating_add(1);
                    if self.orphan_mitigation_expired(&pass) {
                        return self
                            .instance_orphan_mitigation_failed(
                                pass,
                                "orphan mitigation did not finish in time".to_string(),
                            )
                            .await;
                    }
                    let delay = self
                        .policy()
                        .poll_delay(pass.status.orphan_mitigation_attempts);
                    self.save_instance_then(&mut pass, ReconcileAction::poll(delay))
                        .await
                }
                PollOutcome::Failed(message) | PollOutcome::Error(message) => {
                    pass.status.async_op_in_progress = false;
                    pass.status.last_operation = None;
                    self.retry_instance_orphan_mitigation(pass, message).await
                }
            };
        }

        let request = DeprovisionRequest {
            instance_id,
            service_id: properties.service_id,
            plan_id: properties.plan_id,
            originating_identity: identity,
        };
        info!("Orphan mitigation: deprovisioning instance {}", pass.key);
        match broker.adapter.deprovision(&request).await {
            CallOutcome::Succeeded(_) => self.finish_instance_orphan_mitigation(pass).await,
            CallOutcome::InProgress(operation) => {
                pass.status.async_op_in_progress = true;
                pass.status.last_operation = operation;
                pass.status.orphan_mitigation_attempts = 0;
                let delay = self.policy().poll_delay(0);
                self.save_instance_then(&mut pass, ReconcileAction::poll(delay))
                    .await
            }
            CallOutcome::Failed(failure) | CallOutcome::FailedRetriable(failure) => {
                self.retry_instance_orphan_mitigation(pass, failure.message)
                    .await
            }
        }
    }

    fn orphan_mitigation_expired(&self, pass: &InstancePass) -> bool {
        let start = parse_time(pass.status.orphan_mitigation_start_time.as_deref())
            .unwrap_or(pass.now);
        self.policy().is_expired(start, pass.now)
    }

    async fn retry_instance_orphan_mitigation(
        &self,
        mut pass: InstancePass,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        if self.orphan_mitigation_expired(&pass) {
            return self.instance_orphan_mitigation_failed(pass, message).await;
        }
        warn!(
            "Orphan mitigation of instance {} failed, retrying: {}",
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
            InstanceReason::StartingInstanceOrphanMitigation,
            message,
            pass.now,
        );
        self.save_instance_then(&mut pass, ReconcileAction::retry(delay))
            .await
    }

    async fn finish_instance_orphan_mitigation(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        info!("Orphan mitigation of instance {} completed", pass.key);
        let retry = pass.status.retry_after_orphan_mitigation
            && !pass.deleting
            && !self.policy().is_expired(pass.operation_start(), pass.now);
        pass.clear_orphan_mitigation();
        set_condition(
            &mut pass.status.conditions,
            ConditionType::OrphanMitigation,
            ConditionStatus::False,
            InstanceReason::OrphanMitigationSuccessful,
            "Orphan mitigation was completed successfully",
            pass.now,
        );
        pass.status.provision_status = ProvisionStatus::NotProvisioned;
        pass.status.deprovision_status = DeprovisionStatus::Succeeded;

        if pass.deleting {
            pass.clear_operation();
            return self
                .save_instance_then(&mut pass, ReconcileAction::RequeueNow)
                .await;
        }
        if retry {
            let delay = self.policy().retry_delay(pass.status.operation_attempts);
            return self
                .save_instance_then(&mut pass, ReconcileAction::retry(delay))
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
        self.save_instance_then(&mut pass, ReconcileAction::Done)
            .await
    }

    async fn instance_orphan_mitigation_failed(
        &self,
        mut pass: InstancePass,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        warn!(
            "❌ Orphan mitigation of instance {} failed: {}",
            pass.key, message
        );
        pass.clear_orphan_mitigation();
        let reason = InstanceReason::OrphanMitigationFailed;
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
        self.save_instance_then(&mut pass, action).await
    }

    async fn deprovision_instance(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        match pass.status.deprovision_status {
            DeprovisionStatus::NotRequired | DeprovisionStatus::Succeeded => {
                return self.release_instance(pass).await;
            }
            DeprovisionStatus::Failed => {
                debug!(
                    "Deprovision of instance {} failed, keeping the finalizer",
                    pass.key
                );
                return Ok(ReconcileAction::Done);
            }
            DeprovisionStatus::Required => {}
        }

        let bindings = self
            .bindings
            .list(Some(&pass.key.namespace))
            .await?
            .into_iter()
            .filter(|b| b.spec.instance_ref.name == pass.key.name)
            .count();
        if bindings > 0 {
            info!(
                "Deprovision of instance {} waits for {} binding(s)",
                pass.key, bindings
            );
            pass.set_ready(
                ConditionStatus::False,
                InstanceReason::DeprovisionBlockedByExistingCredentials,
                format!("{bindings} binding(s) to this instance must be removed first"),
            );
            let action = ReconcileAction::Requeue {
                after: self.config.retry_initial_backoff,
                reason: RequeueReason::Blocked,
            };
            return self.save_instance_then(&mut pass, action).await;
        }

        if pass.status.current_operation != Some(InstanceOperation::Deprovision) {
            pass.begin_operation(InstanceOperation::Deprovision);
            pass.set_ready(
                ConditionStatus::False,
                InstanceReason::Deprovisioning,
                "Deprovisioning the service instance",
            );
        }

        let broker = match self.brokers.resolve(&pass.instance.spec.broker_name).await {
            Ok(broker) => broker,
            Err(e) => {
                return self
                    .deprovision_retry(pass, registry_reason(&e), e.to_string())
                    .await;
            }
        };
        let (service_id, plan_id) = match pass.known_properties() {
            Some(p) => (p.service_id.clone(), p.plan_id.clone()),
            None => match broker.catalog.resolve_plan(
                &pass.instance.spec.class_external_name,
                &pass.instance.spec.plan_external_name,
            ) {
                Ok(plan) => (plan.service_id, plan.plan_id),
                Err(e) => {
                    return self
                        .deprovision_retry(pass, catalog_reason(&e), e.to_string())
                        .await;
                }
            },
        };
        if self.save_instance(&mut pass).await?.is_none() {
            return Ok(ReconcileAction::RequeueNow);
        }

        let request = DeprovisionRequest {
            instance_id: pass.external_id()?,
            service_id,
            plan_id,
            originating_identity: OriginatingIdentity::from_user_info(
                pass.instance.spec.user_info.as_ref(),
            )?,
        };
        info!(
            "Deprovisioning instance {} (attempt {})",
            pass.key,
            pass.status.operation_attempts + 1
        );
        match broker.adapter.deprovision(&request).await {
            CallOutcome::Succeeded(_) => self.finish_deprovision(pass).await,
            CallOutcome::InProgress(operation) => {
                self.begin_instance_polling(pass, operation).await
            }
            CallOutcome::FailedRetriable(failure) => {
                self.deprovision_retry(pass, InstanceReason::DeprovisionCallFailed, failure.message)
                    .await
            }
            CallOutcome::Failed(failure) => {
                self.deprovision_failed(pass, InstanceReason::DeprovisionCallFailed, failure.message)
                    .await
            }
        }
    }

    async fn deprovision_retry(
        &self,
        mut pass: InstancePass,
        reason: InstanceReason,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        if self.policy().is_expired(pass.operation_start(), pass.now) {
            return self
                .deprovision_failed(
                    pass,
                    InstanceReason::ErrorReconciliationRetryTimeout,
                    format!("stopped retrying deprovision: {message}"),
                )
                .await;
        }
        let delay = self.schedule_instance_retry(&mut pass, reason, message);
        self.save_instance_then(&mut pass, ReconcileAction::retry(delay))
            .await
    }

    async fn deprovision_failed(
        &self,
        mut pass: InstancePass,
        reason: InstanceReason,
        message: String,
    ) -> Result<ReconcileAction, ReconcilerError> {
        warn!(
            "❌ Deprovision of instance {} failed, the finalizer stays: {}",
            pass.key, message
        );
        pass.status.deprovision_status = DeprovisionStatus::Failed;
        pass.set_ready(ConditionStatus::False, reason, message.clone());
        pass.set_failed(reason, message);
        pass.status.reconciled_generation = Some(pass.generation);
        pass.clear_operation();
        self.save_instance_then(&mut pass, ReconcileAction::Done)
            .await
    }

    async fn finish_deprovision(
        &self,
        mut pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        info!("✅ Instance {} deprovisioned", pass.key);
        pass.status.deprovision_status = DeprovisionStatus::Succeeded;
        pass.status.provision_status = ProvisionStatus::NotProvisioned;
        pass.status.external_properties = None;
        pass.status.dashboard_url = None;
        pass.clear_operation();
        pass.set_ready(
            ConditionStatus::False,
            InstanceReason::DeprovisionedSuccessfully,
            "The instance was deprovisioned successfully",
        );
        if self.save_instance(&mut pass).await?.is_none() {
            return Ok(ReconcileAction::RequeueNow);
        }
        if pass.deleting {
            return self.release_instance(pass).await;
        }
        Ok(ReconcileAction::Done)
    }

    async fn release_instance(
        &self,
        pass: InstancePass,
    ) -> Result<ReconcileAction, ReconcilerError> {
        info!("Releasing instance {}", pass.key);
        Ok(
            match remove_finalizer(self.instances.as_ref(), &pass.instance).await? {
                Some(_) => ReconcileAction::Done,
                None => ReconcileAction::RequeueNow,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(plan: &str, checksum: Option<&str>, update_requests: i64) -> InstanceProperties {
        InstanceProperties {
            class_external_name: "database".to_string(),
            plan_external_name: plan.to_string(),
            service_id: "svc".to_string(),
            plan_id: format!("plan-{plan}"),
            parameters: None,
            parameter_checksum: checksum.map(str::to_string),
            update_requests,
            user_info: None,
        }
    }

    #[test]
    fn test_needs_update() {
        let applied = properties("small", Some("abc"), 0);
        assert!(!needs_update(&applied, &properties("small", Some("abc"), 0)));
        assert!(needs_update(&applied, &properties("large", Some("abc"), 0)));
        assert!(needs_update(&applied, &properties("small", Some("def"), 0)));
        assert!(needs_update(&applied, &properties("small", None, 0)));
        assert!(needs_update(&applied, &properties("small", Some("abc"), 1)));
    }

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            registry_reason(&RegistryError::BrokerNotFound("b".to_string())),
            InstanceReason::ReferencesNonexistentBroker
        );
        assert_eq!(
            catalog_reason(&CatalogLookupError::PlanNotFound {
                class: "c".to_string(),
                plan: "p".to_string()
            }),
            InstanceReason::ReferencesNonexistentServicePlan
        );
        assert_eq!(
            in_progress_reason(InstanceOperation::Deprovision),
            InstanceReason::Deprovisioning
        );
    }
}
