//! # Reconciler
//!
//! Reconciliation logic for `ServiceInstance` and `ServiceBinding` resources.
//!
//! The reconciler:
//! - Provisions, updates and deprovisions instances at their broker
//! - Binds and unbinds, writing credentials into the binding's secret
//! - Polls asynchronous broker operations without blocking other passes
//! - Cleans up after calls that may have left orphans at the broker
//! - Records every outcome as conditions on the resource status
//!
//! ## Reconciliation Flow
//!
//! 1. Read the resource and make sure it carries the controller finalizer
//! 2. Resume whatever the status says is in flight (orphan mitigation, polling)
//! 3. Otherwise compare the spec against what the broker last applied
//! 4. Issue at most one broker call and persist the result
//! 5. Return how soon the resource should be looked at again

pub mod binding;
pub mod conditions;
pub mod instance;
pub mod reasons;
pub mod types;

pub use reasons::{BindingReason, ConditionStatus, ConditionType, InstanceReason, Reason};
pub use types::{
    BackoffState, ReconcileAction, Reconciler, ReconcilerError, RequeueReason, ResourceKey,
    StatusResource,
};
