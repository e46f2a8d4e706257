//! Battery state collection via `dumpsys battery`.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use rth_common::cancel::CancelToken;
use rth_common::types::DeviceDescriptor;

use super::{DeviceShell, Metric, ResourceMetricCollector, ResourceMetrics, converted_value,
            rounded_value};

pub const BATTERY_RESOURCE_NAME: &str = "battery";
pub const BATTERY_CMD: &str = "dumpsys battery";

/* The example command output:
Current Battery Service state:
  AC powered: true
  USB powered: false
  Wireless powered: false
  Max charging current: 3000000
  Max charging voltage: 5000000
  Charge counter: 3333000
  status: 5
  health: 2
  present: true
  level: 100
  scale: 100
  voltage: 4451
  temperature: 286
  technology: Unknown
*/
fn battery_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?P<field>status|health|level|scale|temperature):\s(?P<value>[0-9]+)")
            .expect("battery pattern is valid")
    })
}

const TEMPERATURE_FIELD: &str = "temperature";
/// Temperature is reported in tenths of a degree Celsius.
const BATTERY_TEMP_DENOMINATOR: f32 = 10.0;
const CMD_TIMEOUT: Duration = Duration::from_millis(500);

/// Collects device battery status, health, level, scale, and
/// temperature. An unreachable device or unrecognized output yields an
/// empty result.
#[derive(Debug, Default)]
pub struct BatteryCollector;

impl BatteryCollector {
    pub fn new() -> Self {
        Self
    }

    /// Parse a `dumpsys battery` response into one snapshot, or `None`
    /// when no battery fields are present.
    pub(crate) fn parse_response(response: &str) -> Option<ResourceMetrics> {
        let mut metrics = Vec::new();
        for captures in battery_pattern().captures_iter(response) {
            let field = &captures["field"];
            let value = if field == TEMPERATURE_FIELD {
                converted_value(&captures["value"], BATTERY_TEMP_DENOMINATOR)
            } else {
                rounded_value(&captures["value"])
            };
            if let Some(value) = value {
                metrics.push(Metric::new(field, value));
            }
        }
        if metrics.is_empty() {
            return None;
        }
        Some(ResourceMetrics::new(BATTERY_RESOURCE_NAME, metrics))
    }
}

#[async_trait]
impl ResourceMetricCollector for BatteryCollector {
    async fn device_metrics(
        &self,
        device: &DeviceDescriptor,
        shell: &dyn DeviceShell,
        cancel: &CancelToken,
    ) -> Vec<ResourceMetrics> {
        if cancel.is_cancelled() {
            return Vec::new();
        }
        let Some(response) = shell
            .command_response(&device.serial, BATTERY_CMD, CMD_TIMEOUT)
            .await
        else {
            return Vec::new();
        };
        Self::parse_response(&response).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedShell {
        responses: HashMap<String, String>,
    }

    #[async_trait]
    impl DeviceShell for FixedShell {
        async fn command_response(
            &self,
            _serial: &str,
            command: &str,
            _timeout: Duration,
        ) -> Option<String> {
            self.responses.get(command).cloned()
        }
    }

    fn shell_with(response: &str) -> FixedShell {
        FixedShell {
            responses: HashMap::from([(BATTERY_CMD.to_string(), response.to_string())]),
        }
    }

    #[tokio::test]
    async fn parses_battery_fields_with_temperature_conversion() {
        let shell =
            shell_with("status: 5\nhealth: 2\nlevel: 100\nscale: 100\ntemperature: 286");
        let collector = BatteryCollector::new();
        let resources = collector
            .device_metrics(
                &DeviceDescriptor::new("SER1"),
                &shell,
                &CancelToken::never(),
            )
            .await;

        assert_eq!(resources.len(), 1);
        let snapshot = &resources[0];
        assert_eq!(snapshot.resource_name, BATTERY_RESOURCE_NAME);
        let by_tag: HashMap<_, _> = snapshot
            .metrics
            .iter()
            .map(|m| (m.tag.as_str(), m.value))
            .collect();
        assert_eq!(by_tag["status"], 5.0);
        assert_eq!(by_tag["health"], 2.0);
        assert_eq!(by_tag["level"], 100.0);
        assert_eq!(by_tag["scale"], 100.0);
        assert_eq!(by_tag["temperature"], 28.6);
    }

    #[tokio::test]
    async fn unrecognized_output_yields_empty() {
        let shell = shell_with("Battery service not running");
        let resources = BatteryCollector::new()
            .device_metrics(
                &DeviceDescriptor::new("SER1"),
                &shell,
                &CancelToken::never(),
            )
            .await;
        assert!(resources.is_empty());
    }

    #[tokio::test]
    async fn missing_response_yields_empty() {
        let shell = FixedShell {
            responses: HashMap::new(),
        };
        let resources = BatteryCollector::new()
            .device_metrics(
                &DeviceDescriptor::new("SER1"),
                &shell,
                &CancelToken::never(),
            )
            .await;
        assert!(resources.is_empty());
    }

    #[tokio::test]
    async fn cancelled_collection_short_circuits() {
        let (cancellation, token) = rth_common::cancel::Cancellation::new();
        cancellation.cancel();
        let shell = shell_with("status: 5");
        let resources = BatteryCollector::new()
            .device_metrics(&DeviceDescriptor::new("SER1"), &shell, &token)
            .await;
        assert!(resources.is_empty());
    }

    #[test]
    fn default_timeout_is_one_second() {
        let collector = BatteryCollector::new();
        assert_eq!(collector.device_timeout(), Duration::from_millis(1000));
    }
}
