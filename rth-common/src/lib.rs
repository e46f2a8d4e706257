//! Shared types and utilities for the Remote Test Harness.
//!
//! This crate holds everything the harness binaries have in common: the
//! test resource and device models, the invocation listener protocol,
//! the error taxonomy, configuration loading, logging setup, and small
//! filesystem helpers.

#![forbid(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod errors;
pub mod fsutil;
pub mod logging;
pub mod protocol;
pub mod types;

pub use cancel::{CancelToken, Cancellation};
pub use errors::{ConfigError, HarnessError, LaunchError, RetrievalError};
pub use logging::{LogConfig, init_logging};
pub use types::{DeviceDescriptor, HostState, PlayMode, TestResource};
