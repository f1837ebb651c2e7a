use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::time;
use crate::vm::VmStatus;

/// Caller-visible outcome of a lifecycle operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    pub vm_id: String,
    pub timestamp: String,
    /// Present on Stop: whether the hypervisor had to be force-killed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced: Option<bool>,
}

impl OperationResult {
    pub fn ok(vm_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            vm_id: vm_id.into(),
            timestamp: time::utc_now(),
            forced: None,
        }
    }

    pub fn forced(mut self, forced: bool) -> Self {
        self.forced = Some(forced);
        self
    }
}

/// Extended outcome of Create: everything a caller needs to reach the new VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResult {
    #[serde(flatten)]
    pub result: OperationResult,
    pub tap_device: String,
    pub control_socket_path: PathBuf,
    pub display_port: u16,
    pub pid: u32,
    pub disk_paths: Vec<PathBuf>,
    pub pid_file_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_iso_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installing_os: Option<bool>,
}

/// Snapshot of a VM's recorded vs. observed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub vm_id: String,
    pub db_status: VmStatus,
    /// Status string reported over the control protocol, if reachable.
    pub control_status: Option<String>,
    pub pid: Option<u32>,
    pub process_alive: bool,
    /// DB says running ⇔ process alive.
    pub consistent: bool,
    pub tap_device: Option<String>,
    pub control_socket_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_result_serializes_camel_case() {
        let r = OperationResult::ok("vm-1", "started").forced(true);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"vmId\":\"vm-1\""));
        assert!(json.contains("\"forced\":true"));
    }

    #[test]
    fn test_forced_omitted_when_none() {
        let r = OperationResult::ok("vm-1", "created");
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("forced"));
    }
}
