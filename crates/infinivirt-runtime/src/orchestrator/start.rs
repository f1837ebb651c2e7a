//! VM start: rebuild the launch plan from the persisted record.

use std::path::PathBuf;

use tracing::{info, warn};

use infinivirt_core::error::VmError;
use infinivirt_core::result::OperationResult;
use infinivirt_core::vm::VmStatus;

use crate::process;
use crate::store::ConfigPatch;

use super::{BringUpArgs, Orchestrator};

impl Orchestrator {
    pub async fn start(&self, vm_id: &str) -> Result<OperationResult, VmError> {
        let record = self.store.find_machine_with_config(vm_id)?;

        // Double-start guard: a live recorded PID is simply success; a dead
        // one means a stale record, reset and proceed.
        if record.status == VmStatus::Running {
            let pid = record.runtime.as_ref().and_then(|r| r.pid);
            match pid {
                Some(pid) if process::is_pid_alive(pid) => {
                    return Ok(OperationResult::ok(vm_id, "VM is already running"));
                }
                _ => {
                    warn!(vm_id, "record says running but process is gone, resetting to off");
                    self.store.update_machine_status(vm_id, VmStatus::Off)?;
                    self.store.clear_volatile_machine_configuration(vm_id)?;
                }
            }
        }

        let record = self.store.find_machine_with_config(vm_id)?;

        // Single-writer gate: exactly one concurrent starter wins this CAS.
        // Any state other than off (a start already in flight included)
        // loses here too and surfaces as a concurrent modification.
        let outcome = self
            .store
            .transition_vm_status(vm_id, VmStatus::Off, VmStatus::Building, record.version)
            .map_err(|e| match e {
                VmError::VersionConflict(msg) => VmError::ConcurrentModification(msg),
                other => other,
            })?;
        let record = outcome.record;

        // Required hardware fields must still be on the record.
        if let Err(e) = self.validate_startable(&record) {
            self.store.update_machine_status(vm_id, VmStatus::Off)?;
            return Err(e);
        }
        let display = record.display.clone().expect("validated above");

        let disk_paths = self.resolve_disk_paths(&record);

        let bring_up = self
            .bring_up(BringUpArgs {
                vm_id: &record.id,
                internal_name: &record.internal_name,
                os: &record.os,
                cpu_cores: record.cpu_cores,
                ram_gb: record.ram_gb,
                bridge: &record.bridge,
                display,
                hardware: &record.hardware,
                disk_paths,
                install_iso: None,
                passthrough: None,
                mac_override: None,
                unattended: false,
            })
            .await;

        match bring_up {
            Ok(_) => {
                info!(vm_id, "VM started");
                Ok(OperationResult::ok(vm_id, "VM started"))
            }
            Err(e) => Err(VmError::StartFailed(e.to_string())),
        }
    }

    /// Stored disk-path list when present; otherwise infer from the internal
    /// name and migrate the record. Migration failures only warn.
    fn resolve_disk_paths(&self, record: &infinivirt_core::vm::VmRecord) -> Vec<PathBuf> {
        if !record.disk_paths.is_empty() {
            return record.disk_paths.clone();
        }

        let inferred: Vec<PathBuf> = (0..record.disks.len())
            .map(|i| self.paths.disk_path(&record.internal_name, i))
            .collect();
        warn!(
            vm_id = %record.id,
            "record predates stored disk paths, migrating inferred paths"
        );
        if let Err(e) = self.store.update_machine_configuration(
            &record.id,
            ConfigPatch {
                runtime: None,
                disk_paths: Some(inferred.clone()),
            },
        ) {
            warn!(vm_id = %record.id, error = %e, "disk-path migration write failed");
        }
        inferred
    }

    fn validate_startable(&self, record: &infinivirt_core::vm::VmRecord) -> Result<(), VmError> {
        if record.disks.is_empty() {
            return Err(VmError::InvalidConfig(
                "record has no disks, cannot start".into(),
            ));
        }
        if record.bridge.is_empty() {
            return Err(VmError::InvalidConfig(
                "record has no bridge, cannot start".into(),
            ));
        }
        if record.display.is_none() {
            return Err(VmError::InvalidConfig(
                "record has no display endpoint, cannot start".into(),
            ));
        }
        Ok(())
    }
}
