//! # Runtime
//!
//! Controller runtime: initialization, watches and error policy.

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
