//! # Controller
//!
//! Core controller modules for the Service Catalog Controller.
//!
//! - `backoff`: Poll and retry backoff, Fibonacci backoff for unexpected errors
//! - `jsonpath`: JSONPath subset used by secret transforms
//! - `parameters`: Resolution of inline and secret-sourced parameters
//! - `reconciler`: Core reconciliation logic
//! - `server`: HTTP server for metrics and health checks
//! - `transform`: Credential transforms applied before secret injection

pub mod backoff;
pub mod jsonpath;
pub mod parameters;
pub mod reconciler;
pub mod server;
pub mod transform;
