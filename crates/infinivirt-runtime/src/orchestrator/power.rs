//! Suspend, resume, reset, and status: control-protocol verbs against a
//! running VM. The client is disconnected on every exit path, and the store
//! is only touched after the protocol verb succeeded.

use tracing::info;

use infinivirt_core::error::VmError;
use infinivirt_core::result::{OperationResult, StatusReport};
use infinivirt_core::vm::{VmStatus, VmRecord};

use crate::process;

use super::Orchestrator;

impl Orchestrator {
    pub async fn suspend(&self, vm_id: &str) -> Result<OperationResult, VmError> {
        let record = self.require_status(vm_id, &[VmStatus::Running])?;
        let socket = control_socket(&record)?;

        let client = self.control.connect(&socket).await?;
        let result = client.pause().await;
        client.disconnect();
        result?;

        self.store.update_machine_status(vm_id, VmStatus::Suspended)?;
        info!(vm_id, "VM suspended");
        Ok(OperationResult::ok(vm_id, "VM suspended"))
    }

    pub async fn resume(&self, vm_id: &str) -> Result<OperationResult, VmError> {
        let record =
            self.require_status(vm_id, &[VmStatus::Suspended, VmStatus::Paused])?;
        let socket = control_socket(&record)?;

        let client = self.control.connect(&socket).await?;
        let result = client.resume().await;
        client.disconnect();
        result?;

        self.store.update_machine_status(vm_id, VmStatus::Running)?;
        info!(vm_id, "VM resumed");
        Ok(OperationResult::ok(vm_id, "VM resumed"))
    }

    pub async fn reset(&self, vm_id: &str) -> Result<OperationResult, VmError> {
        let record = self.require_status(vm_id, &[VmStatus::Running])?;
        let socket = control_socket(&record)?;

        let client = self.control.connect(&socket).await?;
        let result = client.system_reset().await;
        client.disconnect();
        result?;

        info!(vm_id, "VM reset");
        Ok(OperationResult::ok(vm_id, "VM reset"))
    }

    /// Recorded vs. observed state, including a consistency verdict the
    /// health monitor would act on.
    pub async fn status(&self, vm_id: &str) -> Result<StatusReport, VmError> {
        let record = self.store.find_machine_with_config(vm_id)?;
        let runtime = record.runtime.as_ref();
        let pid = runtime.and_then(|r| r.pid);
        let process_alive = pid.is_some_and(process::is_pid_alive);

        let socket = runtime.map(|r| r.control_socket_path.clone());
        let control_status = match socket.as_ref().filter(|s| s.exists()) {
            Some(socket) => match self.control.connect(socket).await {
                Ok(client) => {
                    let status = client.query_status().await.ok();
                    client.disconnect();
                    status
                }
                Err(_) => None,
            },
            None => None,
        };

        Ok(StatusReport {
            vm_id: vm_id.to_string(),
            db_status: record.status,
            control_status,
            pid,
            process_alive,
            consistent: (record.status == VmStatus::Running) == process_alive,
            tap_device: runtime.map(|r| r.tap_device.clone()),
            control_socket_path: socket,
        })
    }

    fn require_status(
        &self,
        vm_id: &str,
        allowed: &[VmStatus],
    ) -> Result<VmRecord, VmError> {
        let record = self.store.find_machine_with_config(vm_id)?;
        if !allowed.contains(&record.status) {
            return Err(VmError::InvalidState(format!(
                "VM {} is {}, expected one of {:?}",
                vm_id,
                record.status,
                allowed.iter().map(|s| s.to_string()).collect::<Vec<_>>()
            )));
        }
        Ok(record)
    }
}

fn control_socket(record: &VmRecord) -> Result<std::path::PathBuf, VmError> {
    record
        .runtime
        .as_ref()
        .map(|r| r.control_socket_path.clone())
        .ok_or_else(|| {
            VmError::InvalidState(format!("VM {} has no control socket recorded", record.id))
        })
}
