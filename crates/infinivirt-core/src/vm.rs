use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// VM lifecycle status as recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Building,
    Running,
    Off,
    Suspended,
    Paused,
    UpdatingHardware,
    PoweringOffUpdate,
    Error,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Building => "building",
            Self::Running => "running",
            Self::Off => "off",
            Self::Suspended => "suspended",
            Self::Paused => "paused",
            Self::UpdatingHardware => "updating_hardware",
            Self::PoweringOffUpdate => "powering_off_update",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// One virtual disk, ordered within the VM's disk list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub size_gb: u32,
}

/// Display protocol exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayProtocol {
    Spice,
    Vnc,
}

impl std::fmt::Display for DisplayProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spice => write!(f, "spice"),
            Self::Vnc => write!(f, "vnc"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub protocol: DisplayProtocol,
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Explicit hardware choices made at create time, persisted with the record.
/// Anything left unset resolves through the OS preset, then the hard
/// default, on every start, so a reboot lands on the same effective
/// options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareOverrides {
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub cpu_model: Option<String>,
    #[serde(default)]
    pub disk_bus: Option<String>,
    #[serde(default)]
    pub cache_mode: Option<String>,
    #[serde(default)]
    pub network_model: Option<String>,
    #[serde(default)]
    pub queue_count: Option<u32>,
    #[serde(default)]
    pub memory_balloon: Option<bool>,
    #[serde(default)]
    pub firmware_path: Option<PathBuf>,
    #[serde(default)]
    pub hugepages: Option<bool>,
    #[serde(default)]
    pub pin_cores: Option<Vec<usize>>,
}

/// Volatile runtime configuration, written when a VM starts and cleared when
/// it stops. If `VmRecord::status` is `Running`, every field here is
/// populated; the health monitor reconciles violations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub pid: Option<u32>,
    pub control_socket_path: PathBuf,
    pub pid_file_path: PathBuf,
    pub tap_device: String,
    pub mac_address: String,
    pub bridge: String,
    pub display: DisplayConfig,
    pub machine_type: String,
    pub cpu_model: String,
    pub disk_bus: String,
    pub cache_mode: String,
    pub network_model: String,
    pub queue_count: u32,
    pub memory_balloon: bool,
    /// None means BIOS.
    pub firmware_path: Option<PathBuf>,
    pub uefi_vars_path: Option<PathBuf>,
    pub hugepages: bool,
    pub disk_paths: Vec<PathBuf>,
    #[serde(default)]
    pub pinned_cores: Option<Vec<usize>>,
}

/// Persistent VM record.
///
/// `internal_name` is the filesystem-safe identifier every host artifact is
/// derived from (disk path, control socket, pid file). `version` is the
/// optimistic-concurrency counter bumped by the store on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub internal_name: String,
    pub os: String,
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub disks: Vec<DiskSpec>,
    /// Stable disk-image paths, written at create. Records predating
    /// multi-disk support have an empty list; Start migrates them.
    #[serde(default)]
    pub disk_paths: Vec<PathBuf>,
    #[serde(default)]
    pub bridge: String,
    /// Display endpoint chosen at create. Absent only on legacy records,
    /// which cannot be started until re-created.
    #[serde(default)]
    pub display: Option<DisplayConfig>,
    #[serde(default)]
    pub hardware: HardwareOverrides,
    pub status: VmStatus,
    pub version: u64,
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
    /// Last TAP device name, kept when volatile config is cleared after a
    /// crash so the next start can reuse the device.
    #[serde(default)]
    pub last_tap_device: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&VmStatus::PoweringOffUpdate).unwrap(),
            "\"powering_off_update\""
        );
        let s: VmStatus = serde_json::from_str("\"updating_hardware\"").unwrap();
        assert_eq!(s, VmStatus::UpdatingHardware);
    }

    #[test]
    fn test_record_roundtrip_without_runtime() {
        let json = r#"{
            "id": "a3f7b2c1",
            "name": "test-vm",
            "internal_name": "vm-abc123",
            "os": "ubuntu",
            "cpu_cores": 4,
            "ram_gb": 8.0,
            "disks": [{"size_gb": 50}],
            "status": "off",
            "version": 3
        }"#;
        let rec: VmRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.status, VmStatus::Off);
        assert!(rec.runtime.is_none());
        assert!(rec.disk_paths.is_empty());
    }

    #[test]
    fn test_display_protocol_display() {
        assert_eq!(DisplayProtocol::Spice.to_string(), "spice");
        assert_eq!(DisplayProtocol::Vnc.to_string(), "vnc");
    }
}
