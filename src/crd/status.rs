//! # Status Types
//!
//! Conditions and operation bookkeeping shared by ServiceInstance and
//! ServiceBinding status.

use crate::crd::UserInfo;
use serde::{Deserialize, Serialize};

/// A condition represents an observation of the resource's state
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, Failed, OrphanMitigation)
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Operation currently being driven against the broker for an instance
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
pub enum InstanceOperation {
    Provision,
    Update,
    Deprovision,
}

impl InstanceOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceOperation::Provision => "provision",
            InstanceOperation::Update => "update",
            InstanceOperation::Deprovision => "deprovision",
        }
    }
}

/// Operation currently being driven against the broker for a binding
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
pub enum BindingOperation {
    Bind,
    Unbind,
}

impl BindingOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingOperation::Bind => "bind",
            BindingOperation::Unbind => "unbind",
        }
    }
}

/// Whether the broker-side instance exists
#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default, schemars::JsonSchema,
)]
pub enum ProvisionStatus {
    #[default]
    NotProvisioned,
    Provisioned,
}

/// Whether the broker-side instance must be deprovisioned before release
#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default, schemars::JsonSchema,
)]
pub enum DeprovisionStatus {
    /// No provision request was ever sent
    #[default]
    NotRequired,
    /// A provision request was sent, deprovision must happen before release
    Required,
    Succeeded,
    /// Deprovision failed terminally; the finalizer is kept
    Failed,
}

/// Whether the broker-side binding must be unbound before release
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
pub enum UnbindStatus {
    Required,
    /// Unbind kept failing past the retry budget; retries continue
    FailedRetriable,
    /// Broker rejected the unbind; an operator must intervene
    FailedPermanently,
    Succeeded,
}

/// Snapshot of what was (or is being) applied for an instance
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProperties {
    pub class_external_name: String,
    pub plan_external_name: String,
    /// Broker-side service id resolved from the catalog
    #[serde(default)]
    pub service_id: String,
    /// Broker-side plan id resolved from the catalog
    #[serde(default)]
    pub plan_id: String,
    /// Parameters with secret-sourced values replaced by a placeholder
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::free_form_object_schema")]
    pub parameters: Option<serde_json::Value>,
    /// SHA-256 of the full resolved parameters
    #[serde(default)]
    pub parameter_checksum: Option<String>,
    #[serde(default)]
    pub update_requests: i64,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

/// Snapshot of what was (or is being) applied for a binding
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingProperties {
    /// Parameters with secret-sourced values replaced by a placeholder
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::free_form_object_schema")]
    pub parameters: Option<serde_json::Value>,
    /// SHA-256 of the full resolved parameters
    #[serde(default)]
    pub parameter_checksum: Option<String>,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

/// Status of a ServiceInstance
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Generation the controller last started acting on
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Generation whose desired state was last reached (or terminally failed)
    #[serde(default)]
    pub reconciled_generation: Option<i64>,
    #[serde(default)]
    pub current_operation: Option<InstanceOperation>,
    /// True only while a broker last-operation poll is outstanding
    #[serde(default)]
    pub async_op_in_progress: bool,
    /// Operation token returned by the broker for the running async operation
    #[serde(default)]
    pub last_operation: Option<String>,
    /// Start of the current operation (RFC3339); the retry budget runs from here
    #[serde(default)]
    pub operation_start_time: Option<String>,
    /// Attempts (or polls, while async) of the current operation
    #[serde(default)]
    pub operation_attempts: u32,
    #[serde(default)]
    pub in_progress_properties: Option<InstanceProperties>,
    #[serde(default)]
    pub external_properties: Option<InstanceProperties>,
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default)]
    pub orphan_mitigation_start_time: Option<String>,
    #[serde(default)]
    pub orphan_mitigation_attempts: u32,
    /// Retry the provision once orphan mitigation completes
    #[serde(default)]
    pub retry_after_orphan_mitigation: bool,
    #[serde(default)]
    pub provision_status: ProvisionStatus,
    #[serde(default)]
    pub deprovision_status: DeprovisionStatus,
    #[serde(default)]
    pub dashboard_url: Option<String>,
}

/// Status of a ServiceBinding
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub reconciled_generation: Option<i64>,
    #[serde(default)]
    pub current_operation: Option<BindingOperation>,
    #[serde(default)]
    pub async_op_in_progress: bool,
    #[serde(default)]
    pub last_operation: Option<String>,
    #[serde(default)]
    pub operation_start_time: Option<String>,
    #[serde(default)]
    pub operation_attempts: u32,
    #[serde(default)]
    pub in_progress_properties: Option<BindingProperties>,
    #[serde(default)]
    pub external_properties: Option<BindingProperties>,
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default)]
    pub orphan_mitigation_start_time: Option<String>,
    #[serde(default)]
    pub orphan_mitigation_attempts: u32,
    #[serde(default)]
    pub retry_after_orphan_mitigation: bool,
    /// Absent means no bind request was ever sent
    #[serde(default)]
    pub unbind_status: Option<UnbindStatus>,
}

/// Read access to the condition list of either status kind
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];

    /// Find a condition by type
    fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.r#type == condition_type)
    }

    /// True when the condition exists with status "True"
    fn condition_is_true(&self, condition_type: &str) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == "True")
    }
}

impl HasConditions for ServiceInstanceStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

impl HasConditions for ServiceBindingStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_status_deserializes_with_defaults() {
        let status: ServiceInstanceStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status.provision_status, ProvisionStatus::NotProvisioned);
        assert_eq!(status.deprovision_status, DeprovisionStatus::NotRequired);
        assert!(!status.async_op_in_progress);
        assert!(status.current_operation.is_none());
    }

    #[test]
    fn test_status_serializes_camel_case_and_enum_text() {
        let status = ServiceBindingStatus {
            current_operation: Some(BindingOperation::Bind),
            unbind_status: Some(UnbindStatus::FailedRetriable),
            async_op_in_progress: true,
            ..ServiceBindingStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["currentOperation"], "Bind");
        assert_eq!(json["unbindStatus"], "FailedRetriable");
        assert_eq!(json["asyncOpInProgress"], true);
    }

    #[test]
    fn test_condition_lookup() {
        let status = ServiceInstanceStatus {
            conditions: vec![Condition {
                r#type: "Ready".to_string(),
                status: "True".to_string(),
                last_transition_time: None,
                reason: Some("ProvisionedSuccessfully".to_string()),
                message: None,
            }],
            ..ServiceInstanceStatus::default()
        };
        assert!(status.condition_is_true("Ready"));
        assert!(!status.condition_is_true("Failed"));
    }
}
