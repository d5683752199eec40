//! Service Catalog Controller Library
//!
//! Reconciles `ServiceInstance` and `ServiceBinding` resources against Open
//! Service Broker API brokers registered as `ClusterServiceBroker` resources.
//!
//! ## Quick Start
//!
//! ```rust
//! use service_catalog_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod broker;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod store;
