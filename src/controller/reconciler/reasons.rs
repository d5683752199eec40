//! # Condition Reasons
//!
//! Closed sets of condition types and reasons. The text returned by
//! `as_str` is written to resource status and must stay stable.

/// Condition types set on instances and bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Ready,
    /// The resource reached a terminal failure at its current generation
    Failed,
    OrphanMitigation,
}

impl ConditionType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Failed => "Failed",
            ConditionType::OrphanMitigation => "OrphanMitigation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// Anything that can be written as a condition reason
pub trait Reason: Copy {
    fn as_str(&self) -> &'static str;
}

/// Condition reasons of ServiceInstance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceReason {
    Provisioning,
    ProvisionedSuccessfully,
    ProvisionCallFailed,
    UpdatingInstance,
    InstanceUpdatedSuccessfully,
    UpdateInstanceCallFailed,
    Deprovisioning,
    DeprovisionedSuccessfully,
    DeprovisionCallFailed,
    DeprovisionBlockedByExistingCredentials,
    ReferencesNonexistentServiceClass,
    ReferencesNonexistentServicePlan,
    ReferencesNonexistentBroker,
    ErrorFetchingCatalog,
    ErrorWithParameters,
    ErrorPollingLastOperation,
    StartingInstanceOrphanMitigation,
    OrphanMitigationSuccessful,
    OrphanMitigationFailed,
    ErrorReconciliationRetryTimeout,
}

impl Reason for InstanceReason {
    fn as_str(&self) -> &'static str {
        match self {
            InstanceReason::Provisioning => "Provisioning",
            InstanceReason::ProvisionedSuccessfully => "ProvisionedSuccessfully",
            InstanceReason::ProvisionCallFailed => "ProvisionCallFailed",
            InstanceReason::UpdatingInstance => "UpdatingInstance",
            InstanceReason::InstanceUpdatedSuccessfully => "InstanceUpdatedSuccessfully",
            InstanceReason::UpdateInstanceCallFailed => "UpdateInstanceCallFailed",
            InstanceReason::Deprovisioning => "Deprovisioning",
            InstanceReason::DeprovisionedSuccessfully => "DeprovisionedSuccessfully",
            InstanceReason::DeprovisionCallFailed => "DeprovisionCallFailed",
            InstanceReason::DeprovisionBlockedByExistingCredentials => {
                "DeprovisionBlockedByExistingCredentials"
            }
            InstanceReason::ReferencesNonexistentServiceClass => {
                "ReferencesNonexistentServiceClass"
            }
            InstanceReason::ReferencesNonexistentServicePlan => "ReferencesNonexistentServicePlan",
            InstanceReason::ReferencesNonexistentBroker => "ReferencesNonexistentBroker",
            InstanceReason::ErrorFetchingCatalog => "ErrorFetchingCatalog",
            InstanceReason::ErrorWithParameters => "ErrorWithParameters",
            InstanceReason::ErrorPollingLastOperation => "ErrorPollingLastOperation",
            InstanceReason::StartingInstanceOrphanMitigation => "StartingInstanceOrphanMitigation",
            InstanceReason::OrphanMitigationSuccessful => "OrphanMitigationSuccessful",
            InstanceReason::OrphanMitigationFailed => "OrphanMitigationFailed",
            InstanceReason::ErrorReconciliationRetryTimeout => "ErrorReconciliationRetryTimeout",
        }
    }
}

/// Condition reasons of ServiceBinding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingReason {
    ErrorInstanceNotReady,
    ErrorNonexistentServiceInstance,
    ErrorNonbindableServiceClass,
    ErrorWithParameters,
    Binding,
    InjectedBindResult,
    ErrorInjectingBindResult,
    BindCallFailed,
    Unbinding,
    UnboundSuccessfully,
    UnbindCallFailed,
    ErrorPollingLastOperation,
    StartingOrphanMitigation,
    OrphanMitigationSuccessful,
    OrphanMitigationFailed,
    ReferencesNonexistentBroker,
    ErrorFetchingCatalog,
    ErrorReconciliationRetryTimeout,
}

impl Reason for BindingReason {
    fn as_str(&self) -> &'static str {
        match self {
            BindingReason::ErrorInstanceNotReady => "ErrorInstanceNotReady",
            BindingReason::ErrorNonexistentServiceInstance => "ErrorNonexistentServiceInstance",
            BindingReason::ErrorNonbindableServiceClass => "ErrorNonbindableServiceClass",
            BindingReason::ErrorWithParameters => "ErrorWithParameters",
            BindingReason::Binding => "Binding",
            BindingReason::InjectedBindResult => "InjectedBindResult",
            BindingReason::ErrorInjectingBindResult => "ErrorInjectingBindResult",
            BindingReason::BindCallFailed => "BindCallFailed",
            BindingReason::Unbinding => "Unbinding",
            BindingReason::UnboundSuccessfully => "UnboundSuccessfully",
            BindingReason::UnbindCallFailed => "UnbindCallFailed",
            BindingReason::ErrorPollingLastOperation => "ErrorPollingLastOperation",
            BindingReason::StartingOrphanMitigation => "StartingOrphanMitigation",
            BindingReason::OrphanMitigationSuccessful => "OrphanMitigationSuccessful",
            BindingReason::OrphanMitigationFailed => "OrphanMitigationFailed",
            BindingReason::ReferencesNonexistentBroker => "ReferencesNonexistentBroker",
            BindingReason::ErrorFetchingCatalog => "ErrorFetchingCatalog",
            BindingReason::ErrorReconciliationRetryTimeout => "ErrorReconciliationRetryTimeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_text_matches_variant_name() {
        assert_eq!(
            InstanceReason::DeprovisionBlockedByExistingCredentials.as_str(),
            format!("{:?}", InstanceReason::DeprovisionBlockedByExistingCredentials)
        );
        assert_eq!(
            BindingReason::ErrorNonbindableServiceClass.as_str(),
            "ErrorNonbindableServiceClass"
        );
        assert_eq!(ConditionType::OrphanMitigation.as_str(), "OrphanMitigation");
    }
}
