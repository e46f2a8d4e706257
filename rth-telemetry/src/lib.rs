//! Device resource metric collection for the Remote Test Harness.
//!
//! Pluggable collectors poll lab devices for runtime health signals
//! (battery, storage wear) by running shell commands through a
//! [`collect::DeviceShell`] and parsing their fixed-format output into
//! typed metric snapshots. Collectors never error: a failing device
//! yields an empty result so one bad device cannot abort a polling
//! cycle.

#![forbid(unsafe_code)]

pub mod collect;
pub mod shell;

pub use collect::{DeviceShell, Metric, ResourceMetricCollector, ResourceMetrics};
pub use shell::AdbShell;
