//! VM stop: graceful powerdown with bounded wait, force-kill fallback, and
//! host-resource teardown.
//!
//! Teardown failures past the kill are logged and swallowed; an operator
//! stopping a VM must end with the record off even if the host needs a
//! later sweep.

use std::time::Duration;

use tracing::{info, warn};

use infinivirt_core::error::VmError;
use infinivirt_core::result::OperationResult;
use infinivirt_core::vm::VmStatus;
use infinivirt_host::tap;

use crate::events::OrchestratorEvent;
use crate::pin;
use crate::process;

use super::Orchestrator;

/// Grace period after a force-kill before giving up on the PID.
const KILL_WAIT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct StopOptions {
    pub graceful: bool,
    pub timeout: Duration,
    pub force: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            graceful: true,
            timeout: Duration::from_secs(30),
            force: true,
        }
    }
}

impl Orchestrator {
    pub async fn stop(&self, vm_id: &str, opts: StopOptions) -> Result<OperationResult, VmError> {
        let record = self.store.find_machine_with_config(vm_id)?;
        let runtime = record.runtime.clone();
        let pid = runtime.as_ref().and_then(|r| r.pid);
        let pid_alive = pid.is_some_and(process::is_pid_alive);

        if record.status == VmStatus::Off && !pid_alive {
            return Ok(OperationResult::ok(vm_id, "VM is already stopped"));
        }

        let mut forced = false;
        let socket = runtime.as_ref().map(|r| r.control_socket_path.clone());

        let mut exited = !pid_alive;
        if opts.graceful
            && pid_alive
            && let Some(socket) = socket.as_ref().filter(|s| s.exists())
        {
            match self.control.connect(socket).await {
                Ok(client) => {
                    let powerdown = client.system_powerdown().await;
                    client.disconnect();
                    match powerdown {
                        Ok(()) => {
                            let pid = pid.expect("pid_alive implies pid");
                            exited = process::wait_for_exit(pid, opts.timeout, EXIT_POLL).await;
                        }
                        Err(e) => {
                            warn!(vm_id, error = %e, "graceful powerdown request failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(vm_id, error = %e, "control connect failed during stop");
                }
            }
        }

        if !exited {
            if !opts.force {
                return Err(VmError::StopFailed(format!(
                    "VM {} did not exit within {:?} and force is disabled",
                    vm_id, opts.timeout
                )));
            }
            let pid = pid.expect("unexited VM has a pid");
            info!(vm_id, pid, "force-killing hypervisor");
            forced = true;
            match process::force_kill(pid).await {
                Ok(()) => {
                    if !process::wait_for_exit(pid, KILL_WAIT, EXIT_POLL).await {
                        warn!(vm_id, pid, "process survived SIGKILL wait, continuing");
                    }
                }
                // Warn-only: the sweep will catch anything left.
                Err(e) => warn!(vm_id, pid, error = %e, "force-kill failed"),
            }
        }

        // Handler detach strictly precedes DB writes, so a late SHUTDOWN
        // event cannot race the operator's state change.
        self.detach_handler(vm_id);
        self.release_client(vm_id);

        self.store.update_machine_status(vm_id, VmStatus::Off)?;
        self.store.clear_machine_configuration(vm_id)?;

        if let Some(runtime) = &runtime {
            if let Err(e) = tap::destroy(&runtime.tap_device).await {
                warn!(vm_id, error = %e, "TAP teardown failed during stop");
            }
            // The chain survives for the next start; only the jumps go.
            if let Err(e) = self.filter.detach_jump_rules(vm_id).await {
                warn!(vm_id, error = %e, "jump detach failed during stop");
            }
            for path in [&runtime.control_socket_path, &runtime.pid_file_path] {
                if let Err(e) = std::fs::remove_file(path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(vm_id, path = %path.display(), error = %e, "stale file not removed");
                }
            }
            if runtime.pinned_cores.is_some() {
                pin::reap_scope(&self.cgroup_root, &record.internal_name);
            }
        }

        self.sink.emit(OrchestratorEvent::PowerOff {
            vm_id: vm_id.to_string(),
        });
        info!(vm_id, forced, "VM stopped");
        Ok(OperationResult::ok(vm_id, "VM stopped").forced(forced))
    }
}
