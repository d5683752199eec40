//! # Custom Resource Definitions
//!
//! CRD types reconciled by the Service Catalog Controller.
//!
//! ## Module Structure
//!
//! - `instance.rs` - ServiceInstance spec
//! - `binding.rs` - ServiceBinding spec
//! - `broker.rs` - ClusterServiceBroker spec
//! - `transform.rs` - Credential secret transforms
//! - `status.rs` - Status, conditions and operation bookkeeping
//! - `common.rs` - References and parameter sources shared by the specs

mod binding;
mod broker;
mod common;
mod instance;
mod status;
mod transform;

// Re-export all public types
pub use binding::{ServiceBinding, ServiceBindingSpec};
pub use broker::{ClusterServiceBroker, ClusterServiceBrokerSpec};
pub use common::{
    LocalObjectReference, ObjectReference, ParametersFromSource, SecretKeyReference, UserInfo,
    free_form_object_schema,
};
pub use instance::{ServiceInstance, ServiceInstanceSpec};
pub use status::{
    BindingOperation, BindingProperties, Condition, DeprovisionStatus, HasConditions,
    InstanceOperation, InstanceProperties, ProvisionStatus, ServiceBindingStatus,
    ServiceInstanceStatus, UnbindStatus,
};
pub use transform::{
    AddKeyTransform, AddKeysFromTransform, RemoveKeyTransform, RenameKeyTransform,
    SecretTransform,
};
