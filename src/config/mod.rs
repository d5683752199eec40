//! # Configuration
//!
//! Controller configuration loaded from environment variables.

pub mod controller;
pub mod duration;

pub use controller::{ControllerConfig, ParametersErrorPolicy};
pub use duration::{DurationParseError, parse_kubernetes_duration};

use std::sync::Arc;

/// Configuration shared between the controllers and server
pub type SharedControllerConfig = Arc<ControllerConfig>;
