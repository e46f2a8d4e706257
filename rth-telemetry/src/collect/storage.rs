//! Storage wear collection from storaged event logs.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use rth_common::cancel::CancelToken;
use rth_common::types::DeviceDescriptor;

use super::{DeviceShell, Metric, ResourceMetricCollector, ResourceMetrics, rounded_value};

pub const STORAGE_AGE_RESOURCE_NAME: &str = "storage_age";

// storaged exports the line on boot, and storage tests generally reboot
// the device, so only the last hour of the events log is searched.
fn storage_age_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"storaged_emmc_info:\s\[.*,(?P<life_a>[0-9]{1,2}),(?P<life_b>[0-9]{1,2})\]")
            .expect("storage age pattern is valid")
    })
}

const AGE_TAG: &str = "age";
const CMD_TIMEOUT: Duration = Duration::from_millis(500);

/// Collects the device's eMMC lifetime estimate from storaged logs.
/// Devices without storaged yield an empty result.
#[derive(Debug, Default)]
pub struct StorageAgeCollector;

impl StorageAgeCollector {
    pub fn new() -> Self {
        Self
    }

    /// Query for the newest storaged_emmc_info line since `since`.
    fn build_command(since: DateTime<Utc>) -> String {
        format!(
            "logcat -b events -d -t \"{}\" | grep storaged_emmc_info | tail -1",
            since.format("%Y-%m-%d %H:%M:00.000")
        )
    }

    /// The reported age is the worse of the two eMMC lifetime fields.
    pub(crate) fn parse_response(response: &str) -> Option<ResourceMetrics> {
        let captures = storage_age_pattern().captures(response)?;
        let life_a = rounded_value(&captures["life_a"])?;
        let life_b = rounded_value(&captures["life_b"])?;
        Some(ResourceMetrics::new(
            STORAGE_AGE_RESOURCE_NAME,
            vec![Metric::new(AGE_TAG, life_a.max(life_b))],
        ))
    }
}

#[async_trait]
impl ResourceMetricCollector for StorageAgeCollector {
    async fn device_metrics(
        &self,
        device: &DeviceDescriptor,
        shell: &dyn DeviceShell,
        cancel: &CancelToken,
    ) -> Vec<ResourceMetrics> {
        if cancel.is_cancelled() {
            return Vec::new();
        }
        let command = Self::build_command(Utc::now() - chrono::Duration::hours(1));
        let response = shell
            .command_response(&device.serial, &command, CMD_TIMEOUT)
            .await;
        let Some(response) = response.filter(|r| !r.is_empty()) else {
            debug!("Failed to find the storaged logs.");
            return Vec::new();
        };
        Self::parse_response(&response).into_iter().collect()
    }
}
