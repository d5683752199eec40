//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use service_catalog_controller::prelude::*;
//! ```
//!
//! This brings into scope:
//! - All CRD types (ServiceInstance, ServiceBinding, ClusterServiceBroker, etc.)
//! - Broker traits (BrokerClient, BrokerRegistry)
//! - Store traits (ResourceStore, SecretStore)
//! - Reconciler types (Reconciler, ReconcileAction, etc.)
//! - Config types (ControllerConfig, SharedControllerConfig)

pub use crate::crd::*;

pub use crate::broker::{BrokerClient, BrokerError, BrokerRegistry, Catalog};

pub use crate::store::{ResourceStore, SecretStore, StoreError};

pub use crate::controller::reconciler::{
    BindingReason, InstanceReason, ReconcileAction, Reconciler, ReconcilerError, ResourceKey,
};

pub use crate::config::{ControllerConfig, ParametersErrorPolicy, SharedControllerConfig};
