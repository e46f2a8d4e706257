//! Core value types shared across RTH components.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A named build artifact needed by a test run.
///
/// Mirrors the descriptor handed down by the fleet backend: the resource is
/// downloaded from `url`, materialized under the invocation root directory
/// as `name`, and optionally decompressed into `decompress_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub decompress: bool,
    /// Directory to decompress into, relative to the invocation root.
    /// Empty means the root itself.
    #[serde(default)]
    pub decompress_dir: String,
}

impl TestResource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        decompress: bool,
        decompress_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            decompress,
            decompress_dir: decompress_dir.into(),
        }
    }

    /// Destination file for this resource under `root`.
    pub fn file_in(&self, root: &Path) -> PathBuf {
        root.join(&self.name)
    }

    /// Decompression target directory under `root`.
    pub fn decompress_dir_in(&self, root: &Path) -> PathBuf {
        root.join(&self.decompress_dir)
    }

    /// Parse a JSON array of resource descriptors.
    pub fn from_json_array(value: &serde_json::Value) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Playback mode passed to the player CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayMode {
    #[default]
    Single,
    Multidevice,
    Playall,
}

impl std::fmt::Display for PlayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "SINGLE"),
            Self::Multidevice => write!(f, "MULTIDEVICE"),
            Self::Playall => write!(f, "PLAYALL"),
        }
    }
}

impl std::str::FromStr for PlayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SINGLE" => Ok(Self::Single),
            "MULTIDEVICE" => Ok(Self::Multidevice),
            "PLAYALL" => Ok(Self::Playall),
            other => Err(format!("unknown play mode: {other}")),
        }
    }
}

/// Serial prefix used by emulator devices. Their serials are only unique
/// per host, so fleet reporting prefixes them with the hostname.
pub const EMULATOR_SERIAL_PREFIX: &str = "emulator-";

const NULL_DEVICE_SERIAL_PLACEHOLDER: &str = "(no device serial)";

/// What the harness knows about one lab device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub serial: String,
    /// Target the device runs tests for (e.g. a build flavor).
    #[serde(default)]
    pub run_target: String,
    /// Allocation state as reported to the fleet backend.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub battery_level: Option<u32>,
    /// Placeholder devices that do not map to real hardware.
    #[serde(default)]
    pub is_stub: bool,
}

impl DeviceDescriptor {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            run_target: String::new(),
            state: String::new(),
            battery_level: None,
            is_stub: false,
        }
    }

    /// Returns a fleet-unique serial for this device.
    ///
    /// Emulators and stub devices have pseudo serials that repeat across
    /// hosts; those get a `hostname:` prefix.
    pub fn unique_serial(&self, hostname: &str) -> String {
        let mut serial = self.serial.clone();
        if serial.is_empty() || self.is_stub || serial.starts_with(EMULATOR_SERIAL_PREFIX) {
            if serial.is_empty() {
                serial = NULL_DEVICE_SERIAL_PLACEHOLDER.to_string();
            }
            return format!("{hostname}:{serial}");
        }
        serial
    }
}

/// Lifecycle state of the harness host, reported with every host event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostState {
    #[default]
    Unknown,
    Running,
    Quitting,
    Killed,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Running => write!(f, "RUNNING"),
            Self::Quitting => write!(f, "QUITTING"),
            Self::Killed => write!(f, "KILLED"),
        }
    }
}
