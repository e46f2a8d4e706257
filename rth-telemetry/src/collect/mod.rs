//! Collector trait, metric types, and value helpers.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use rth_common::cancel::CancelToken;
use rth_common::types::DeviceDescriptor;

pub mod battery;
pub mod storage;

pub use battery::BatteryCollector;
pub use storage::StorageAgeCollector;

/// Default bound on one collector invocation. The polling scheduler
/// abandons results that arrive later.
pub const DEFAULT_METRICIZE_TIMEOUT: Duration = Duration::from_millis(1000);

/// One tagged sample inside a resource snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub tag: String,
    pub value: f32,
}

impl Metric {
    pub fn new(tag: impl Into<String>, value: f32) -> Self {
        Self {
            tag: tag.into(),
            value,
        }
    }
}

/// A resource snapshot, entirely recomputed on every poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMetrics {
    pub resource_name: String,
    pub timestamp: i64,
    #[serde(rename = "metric")]
    pub metrics: Vec<Metric>,
}

impl ResourceMetrics {
    pub fn new(resource_name: impl Into<String>, metrics: Vec<Metric>) -> Self {
        Self {
            resource_name: resource_name.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            metrics,
        }
    }
}

/// Executes shell commands on a lab device.
///
/// Returns stdout on success and `None` on any failure (device gone,
/// non-zero exit, timeout); collectors treat `None` as "no data".
#[async_trait]
pub trait DeviceShell: Send + Sync {
    async fn command_response(
        &self,
        serial: &str,
        command: &str,
        timeout: Duration,
    ) -> Option<String>;
}

/// A pluggable resource metric collector.
///
/// Implementations must check the cancel token before expensive steps
/// and must return an empty collection instead of erroring, so one
/// failing collector cannot abort the cycle for others.
#[async_trait]
pub trait ResourceMetricCollector: Send + Sync {
    /// Collect metrics for one device. Must return within
    /// [`ResourceMetricCollector::device_timeout`].
    async fn device_metrics(
        &self,
        _device: &DeviceDescriptor,
        _shell: &dyn DeviceShell,
        _cancel: &CancelToken,
    ) -> Vec<ResourceMetrics> {
        Vec::new()
    }

    /// Collect metrics for the harness host itself. Must return within
    /// [`ResourceMetricCollector::host_timeout`].
    async fn host_metrics(&self, _cancel: &CancelToken) -> Vec<ResourceMetrics> {
        Vec::new()
    }

    fn device_timeout(&self) -> Duration {
        DEFAULT_METRICIZE_TIMEOUT
    }

    fn host_timeout(&self) -> Duration {
        DEFAULT_METRICIZE_TIMEOUT
    }
}

/// Parse a metric value string, rounded to 2 decimal places.
pub fn rounded_value(original: &str) -> Option<f32> {
    converted_value(original, 0.0)
}

/// Parse a metric value string with a unit conversion divisor, rounded
/// to 2 decimal places. A divisor of 0 means no conversion.
pub fn converted_value(original: &str, divisor: f32) -> Option<f32> {
    let mut value: f32 = original.trim().parse().ok()?;
    if divisor != 0.0 {
        value /= divisor;
    }
    Some((value * 100.0).round() / 100.0)
}
