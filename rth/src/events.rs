//! Host and device events reported to the fleet backend.
//!
//! Events are immutable snapshots built through a builder and serialized
//! to a JSON document. Optional fields are omitted entirely rather than
//! emitted as null, keeping the wire payload minimal.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::warn;

use rth_common::types::{DeviceDescriptor, HostState};

/// Name this harness reports itself as.
pub const TEST_HARNESS: &str = "RTH";

const HOST_IP_KEY: &str = "host_ip";
const START_TIME_KEY: &str = "test_harness_start_time_ms";
const LOCALHOST_IP: &str = "127.0.0.1";

/// Process-wide host identity. Injectable so tests can fabricate one;
/// detect it once at startup and share it.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub hostname: String,
    pub host_ip: String,
    pub version: String,
    pub start_time_ms: i64,
}

impl HostInfo {
    /// Detect the local host identity. Hostname resolution falls back to
    /// the `HOSTNAME` env var, then a generated `unknown-<uuid>` name.
    pub fn detect() -> Self {
        Self {
            hostname: detect_hostname(),
            host_ip: detect_host_ip(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[cfg(test)]
    pub(crate) fn fake() -> Self {
        Self {
            hostname: "host1.lab.example.com".into(),
            host_ip: "192.0.2.10".into(),
            version: "0.4.2".into(),
            start_time_ms: 1_700_000_000_000,
        }
    }
}

fn detect_hostname() -> String {
    if let Ok(hostname) = whoami::hostname() {
        return hostname;
    }
    match std::env::var("HOSTNAME") {
        Ok(hostname) if !hostname.is_empty() => hostname,
        _ => {
            let generated = format!("unknown-{}", uuid::Uuid::new_v4());
            warn!("No hostname available, generated {generated}");
            generated
        }
    }
}

/// Best-effort local IP: the address a UDP socket would route out of.
/// No packets are sent.
fn detect_host_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| LOCALHOST_IP.to_string())
}

/// Kinds of host events the harness uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEventType {
    DeviceSnapshot,
    HostStateChanged,
}

impl std::fmt::Display for HostEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceSnapshot => write!(f, "DeviceSnapshot"),
            Self::HostStateChanged => write!(f, "HostStateChanged"),
        }
    }
}

/// One device's state as embedded in a host event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub serial: String,
    pub run_target: String,
    pub state: String,
    pub battery_level: Option<u32>,
}

impl DeviceSnapshot {
    /// Snapshot a descriptor, uniquifying pseudo serials with the
    /// reporting host's name.
    pub fn of(device: &DeviceDescriptor, hostname: &str) -> Self {
        Self {
            serial: device.unique_serial(hostname),
            run_target: device.run_target.clone(),
            state: device.state.clone(),
            battery_level: device.battery_level,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut doc = json!({
            "device_serial": self.serial,
            "run_target": self.run_target,
            "state": self.state,
        });
        if let Some(level) = self.battery_level {
            doc["battery_level"] = json!(level);
        }
        doc
    }
}

/// An immutable host event. Construct through [`HostEvent::builder`].
#[derive(Debug, Clone)]
pub struct HostEvent {
    event_type: HostEventType,
    timestamp_ms: i64,
    hostname: String,
    version: String,
    cluster_id: String,
    next_cluster_ids: Option<Vec<String>>,
    device_snapshots: Vec<DeviceSnapshot>,
    data: BTreeMap<String, String>,
    host_state: HostState,
    lab_name: Option<String>,
}

impl HostEvent {
    pub fn builder(host: &HostInfo, event_type: HostEventType) -> HostEventBuilder {
        // Every event self-reports where and when the harness started.
        let mut data = BTreeMap::new();
        data.insert(HOST_IP_KEY.to_string(), host.host_ip.clone());
        data.insert(START_TIME_KEY.to_string(), host.start_time_ms.to_string());
        HostEventBuilder {
            event_type,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            hostname: host.hostname.clone(),
            version: host.version.clone(),
            cluster_id: String::new(),
            next_cluster_ids: None,
            device_snapshots: Vec::new(),
            data,
            host_state: HostState::Unknown,
            lab_name: None,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Render the canonical wire document. `time` is in POSIX seconds.
    pub fn to_json(&self) -> Value {
        let mut doc = json!({
            "time": self.timestamp_ms / 1000,
            "type": self.event_type.to_string(),
            "hostname": self.hostname,
            "test_harness_version": self.version,
            "test_harness": TEST_HARNESS,
            "cluster": self.cluster_id,
            "device_infos": self
                .device_snapshots
                .iter()
                .map(DeviceSnapshot::to_json)
                .collect::<Vec<_>>(),
            "data": self.data,
            "state": self.host_state.to_string(),
        });
        if let Some(next) = &self.next_cluster_ids {
            doc["next_cluster_ids"] = json!(next);
        }
        if let Some(lab) = &self.lab_name {
            doc["lab_name"] = json!(lab);
        }
        doc
    }
}

/// Accumulates host event fields; `build()` snapshots them.
pub struct HostEventBuilder {
    event_type: HostEventType,
    timestamp_ms: i64,
    hostname: String,
    version: String,
    cluster_id: String,
    next_cluster_ids: Option<Vec<String>>,
    device_snapshots: Vec<DeviceSnapshot>,
    data: BTreeMap<String, String>,
    host_state: HostState,
    lab_name: Option<String>,
}

impl HostEventBuilder {
    pub fn timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self
    }

    pub fn next_cluster_ids(mut self, ids: Vec<String>) -> Self {
        self.next_cluster_ids = Some(ids);
        self
    }

    pub fn add_device(mut self, snapshot: DeviceSnapshot) -> Self {
        self.device_snapshots.push(snapshot);
        self
    }

    pub fn add_devices(mut self, snapshots: impl IntoIterator<Item = DeviceSnapshot>) -> Self {
        self.device_snapshots.extend(snapshots);
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn host_state(mut self, state: HostState) -> Self {
        self.host_state = state;
        self
    }

    pub fn lab_name(mut self, lab_name: impl Into<String>) -> Self {
        self.lab_name = Some(lab_name.into());
        self
    }

    /// Snapshot the accumulated fields. The builder stays usable and
    /// further mutation cannot affect the built event.
    pub fn build(&self) -> HostEvent {
        HostEvent {
            event_type: self.event_type,
            timestamp_ms: self.timestamp_ms,
            hostname: self.hostname.clone(),
            version: self.version.clone(),
            cluster_id: self.cluster_id.clone(),
            next_cluster_ids: self.next_cluster_ids.clone(),
            device_snapshots: self.device_snapshots.clone(),
            data: self.data.clone(),
            host_state: self.host_state,
            lab_name: self.lab_name.clone(),
        }
    }
}
