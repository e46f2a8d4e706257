//! adb-backed device shell.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::collect::DeviceShell;

/// Runs commands on a device through the local `adb` binary.
#[derive(Debug, Clone)]
pub struct AdbShell {
    adb_path: String,
}

impl AdbShell {
    pub fn new() -> Self {
        Self {
            adb_path: "adb".to_string(),
        }
    }

    pub fn with_adb_path(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }
}

impl Default for AdbShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceShell for AdbShell {
    async fn command_response(
        &self,
        serial: &str,
        command: &str,
        timeout: Duration,
    ) -> Option<String> {
        let mut cmd = tokio::process::Command::new(&self.adb_path);
        cmd.arg("-s")
            .arg(serial)
            .arg("shell")
            .arg(command)
            .kill_on_drop(true);

        let waited = tokio::time::timeout(timeout, cmd.output()).await;
        match waited {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                debug!(
                    "Failed to execute command {command} on device {serial}: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                None
            }
            Ok(Err(err)) => {
                debug!("Failed to launch adb for device {serial}: {err}");
                None
            }
            Err(_) => {
                debug!("Command {command} on device {serial} timed out after {timeout:?}");
                None
            }
        }
    }
}
