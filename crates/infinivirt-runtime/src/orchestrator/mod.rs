//! Lifecycle orchestrator: the single logical writer for each VM.
//!
//! Every operation reads the persisted record, drives host resources
//! bottom-up (disks → TAP → filter → process → control socket → handler →
//! store), and on failure unwinds top-down through the shared cleanup
//! executor. Collaborators arrive as traits; the orchestrator holds no
//! back-references.

mod create;
mod power;
mod start;
mod stop;

pub use create::CreateConfig;
pub use stop::StopOptions;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use infinivirt_core::cleanup::ResourceKind;
use infinivirt_core::error::VmError;
use infinivirt_core::mac::derive_mac;
use infinivirt_core::paths::HostPaths;
use infinivirt_core::result::OperationResult;
use infinivirt_core::vm::{DisplayConfig, HardwareOverrides, RuntimeConfig, VmStatus};
use infinivirt_host::filter::FilterService;
use infinivirt_host::numa::{NumaTopology, PinPlan};
use infinivirt_host::tap;

use crate::cleanup::{CLEANUP_RETRY, CleanupStep, execute_cleanup};
use crate::control::{ControlClient, ControlConnector};
use crate::disks::DiskImageService;
use crate::events::{EventSink, spawn_event_handler};
use crate::launch::{self, LaunchSpec, PassthroughDevice};
use crate::options;
use crate::pin;
use crate::process::{self, HypervisorProcess};
use crate::store::{ConfigPatch, VmStore};
use crate::unattended::{
    DEFAULT_INSTALL_TIMEOUT, InstallMediaService, spawn_install_monitor,
};

/// How long to wait for the control socket to appear after launch.
const SOCKET_WAIT: Duration = Duration::from_secs(5);
const SOCKET_POLL: Duration = Duration::from_millis(100);

/// Pause between the stop and start halves of a restart.
const RESTART_SETTLE: Duration = Duration::from_secs(2);

pub struct Orchestrator {
    pub(crate) store: Arc<dyn VmStore>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) control: Arc<dyn ControlConnector>,
    pub(crate) disks: Arc<dyn DiskImageService>,
    pub(crate) install_media: Option<Arc<dyn InstallMediaService>>,
    pub(crate) filter: Arc<FilterService>,
    pub(crate) paths: HostPaths,
    pub(crate) cgroup_root: PathBuf,
    /// Attached per-VM event-handler tasks.
    handlers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Live control clients, held so their reader tasks outlive the attach.
    clients: Mutex<HashMap<String, Arc<dyn ControlClient>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn VmStore>,
        sink: Arc<dyn EventSink>,
        control: Arc<dyn ControlConnector>,
        disks: Arc<dyn DiskImageService>,
        filter: Arc<FilterService>,
        paths: HostPaths,
    ) -> Self {
        Self {
            store,
            sink,
            control,
            disks,
            install_media: None,
            filter,
            paths,
            cgroup_root: PathBuf::from(pin::DEFAULT_CGROUP_ROOT),
            handlers: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_install_media(mut self, service: Arc<dyn InstallMediaService>) -> Self {
        self.install_media = Some(service);
        self
    }

    pub fn with_cgroup_root(mut self, root: PathBuf) -> Self {
        self.cgroup_root = root;
        self
    }

    /// Restart: graceful stop with force fallback, settle, fresh start.
    /// Either half's failure surfaces unchanged.
    pub async fn restart(&self, vm_id: &str) -> Result<OperationResult, VmError> {
        self.stop(vm_id, StopOptions::default()).await?;
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start(vm_id).await?;
        Ok(OperationResult::ok(vm_id, "VM restarted"))
    }

    /// Detach every event handler and release every control client. Called
    /// at process teardown.
    pub fn shutdown(&self) {
        for (vm_id, handle) in self.handlers.lock().unwrap().drain() {
            debug!(vm_id, "detaching event handler at shutdown");
            handle.abort();
        }
        for (_, client) in self.clients.lock().unwrap().drain() {
            client.disconnect();
        }
    }

    // ── shared plumbing ────────────────────────────────────────────────

    pub(crate) fn attach_handler(&self, vm_id: &str, handle: JoinHandle<()>) {
        if let Some(old) = self.handlers.lock().unwrap().insert(vm_id.to_string(), handle) {
            old.abort();
        }
    }

    /// Abort the VM's handler task. Must precede any Stop-side DB mutation
    /// so a late guest event cannot overwrite the operator's intent.
    pub(crate) fn detach_handler(&self, vm_id: &str) {
        if let Some(handle) = self.handlers.lock().unwrap().remove(vm_id) {
            handle.abort();
        }
    }

    pub(crate) fn register_client(&self, vm_id: &str, client: Arc<dyn ControlClient>) {
        if let Some(old) = self
            .clients
            .lock()
            .unwrap()
            .insert(vm_id.to_string(), client)
        {
            old.disconnect();
        }
    }

    pub(crate) fn release_client(&self, vm_id: &str) {
        if let Some(client) = self.clients.lock().unwrap().remove(vm_id) {
            client.disconnect();
        }
    }

    pub(crate) async fn wait_for_socket(&self, socket: &Path) -> Result<(), VmError> {
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        loop {
            if socket.exists() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::Timeout(format!(
                    "control socket {} did not appear within {:?}",
                    socket.display(),
                    SOCKET_WAIT
                )));
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }
    }

    /// Build the pin plan for an explicit core selection, validating every
    /// index against the host topology.
    pub(crate) fn explicit_pin_plan(
        &self,
        vm_cpu_cores: u32,
        cores: &[usize],
    ) -> Result<PinPlan, VmError> {
        if cores.is_empty() {
            return Err(VmError::InvalidConfig("empty CPU-pin core list".into()));
        }
        let topology = NumaTopology::discover()
            .map_err(|e| VmError::InvalidConfig(format!("NUMA discovery failed: {:#}", e)))?;

        let mut plan = PinPlan {
            selected_cores: Vec::new(),
            numa_nodes: Vec::new(),
            vcpu_to_core: Vec::new(),
            node_vcpus: Default::default(),
        };
        for core in cores {
            let node = topology
                .nodes
                .iter()
                .find(|n| n.cpus.contains(core))
                .ok_or_else(|| {
                    VmError::InvalidConfig(format!("CPU core {} not present on host", core))
                })?;
            plan.selected_cores.push(*core);
            if !plan.numa_nodes.contains(&node.id) {
                plan.numa_nodes.push(node.id);
            }
        }
        plan.selected_cores.sort_unstable();
        plan.selected_cores.dedup();
        plan.numa_nodes.sort_unstable();

        for vcpu in 0..vm_cpu_cores {
            let core = plan.selected_cores[vcpu as usize % plan.selected_cores.len()];
            plan.vcpu_to_core.push((vcpu, core));
            let node = topology
                .nodes
                .iter()
                .find(|n| n.cpus.contains(&core))
                .map(|n| n.id)
                .unwrap_or(0);
            plan.node_vcpus.entry(node).or_default().push(vcpu);
        }
        Ok(plan)
    }

    /// Everything Create and Start share once disks exist: TAP, filter,
    /// launch, socket wait, control attach, persisted runtime config.
    ///
    /// Unwinds its own tracked resources on failure and returns the original
    /// error for the caller to re-wrap.
    pub(crate) async fn bring_up(&self, args: BringUpArgs<'_>) -> Result<RuntimeConfig, VmError> {
        let mut tracker = BringUpTracker::default();
        match self.bring_up_inner(&args, &mut tracker).await {
            Ok(runtime) => Ok(runtime),
            Err(e) => {
                warn!(vm_id = args.vm_id, error = %e, "bring-up failed, unwinding");
                self.unwind(args.vm_id, args.internal_name, tracker).await;
                Err(e)
            }
        }
    }

    async fn bring_up_inner(
        &self,
        args: &BringUpArgs<'_>,
        tracker: &mut BringUpTracker,
    ) -> Result<RuntimeConfig, VmError> {
        let vm_id = args.vm_id;
        let mac = args
            .mac_override
            .clone()
            .unwrap_or_else(|| derive_mac(vm_id));

        let tap_device = tap::create(vm_id, Some(args.bridge))
            .await
            .map_err(|e| VmError::Network(format!("{:#}", e)))?;
        tracker.tap = Some(tap_device.clone());

        self.filter
            .initialize()
            .await
            .map_err(|e| VmError::Firewall(format!("{:#}", e)))?;
        self.filter
            .create_vm_chain(vm_id, &tap_device)
            .await
            .map_err(|e| VmError::Firewall(format!("{:#}", e)))?;
        tracker.chain = true;

        let rules = self.store.get_firewall_rules(vm_id)?;
        let outcome = self
            .filter
            .apply_rules_if_changed(vm_id, &tap_device, &rules.dept, &rules.vm)
            .await
            .map_err(|e| VmError::Firewall(format!("{:#}", e)))?;
        if outcome.failed > 0 {
            warn!(
                vm_id,
                failed = outcome.failed,
                "some firewall rules were not applied"
            );
        }

        let effective = options::resolve(args.os, args.cpu_cores, args.hardware);
        let uefi_vars = match &effective.firmware_path {
            Some(_) => match options::ensure_uefi_vars(&self.paths, args.internal_name) {
                Ok(vars) => Some(vars),
                Err(e) => {
                    warn!(vm_id, error = %e, "UEFI vars unavailable, falling back to BIOS");
                    None
                }
            },
            None => None,
        };
        // Firmware without vars cannot boot; both or neither.
        let mut effective = effective;
        if uefi_vars.is_none() {
            effective.firmware_path = None;
        }

        let pin_plan = match &args.hardware.pin_cores {
            Some(cores) => Some(self.explicit_pin_plan(args.cpu_cores, cores)?),
            None => None,
        };

        let control_socket = self.paths.control_socket_path(args.internal_name);
        let pid_file = self.paths.pid_file_path(args.internal_name);

        let spec = LaunchSpec {
            internal_name: args.internal_name.to_string(),
            cpu_cores: args.cpu_cores,
            ram_gb: args.ram_gb,
            options: effective.clone(),
            disk_paths: args.disk_paths.clone(),
            install_iso: args.install_iso.clone(),
            tap_device: tap_device.clone(),
            mac_address: mac.clone(),
            display: args.display.clone(),
            control_socket: control_socket.clone(),
            pid_file: pid_file.clone(),
            uefi_vars: uefi_vars.clone(),
            passthrough: args.passthrough.clone(),
            pin_plan: pin_plan.clone(),
        };
        let numactl = launch::find_numactl();
        let command = launch::build_command(&spec, numactl.as_deref());

        let hypervisor =
            HypervisorProcess::launch(&command.program, &command.args, &pid_file).await?;
        let pid = hypervisor.pid();
        tracker.pid = Some(pid);

        if let Some(plan) = &pin_plan
            && !command.numa_wrapped
            && let Err(e) = pin::apply_cpu_pinning(&self.cgroup_root, args.internal_name, pid, plan)
        {
            warn!(vm_id, error = %e, "CPU pinning failed, continuing unpinned");
        }

        self.wait_for_socket(&control_socket).await?;

        let client = self.control.connect(&control_socket).await?;
        tracker.client = Some(client.clone());
        match client.query_status().await {
            Ok(status) => debug!(vm_id, %status, "hypervisor reports status"),
            Err(e) => warn!(vm_id, error = %e, "status query after connect failed"),
        }

        let runtime = RuntimeConfig {
            pid: Some(pid),
            control_socket_path: control_socket,
            pid_file_path: pid_file,
            tap_device,
            mac_address: mac,
            bridge: args.bridge.to_string(),
            display: args.display.clone(),
            machine_type: effective.machine_type,
            cpu_model: effective.cpu_model,
            disk_bus: effective.disk_bus,
            cache_mode: effective.cache_mode,
            network_model: effective.network_model,
            queue_count: effective.queue_count,
            memory_balloon: effective.memory_balloon,
            firmware_path: effective.firmware_path,
            uefi_vars_path: uefi_vars,
            hugepages: effective.hugepages,
            disk_paths: args.disk_paths.clone(),
            pinned_cores: pin_plan.as_ref().map(|p| p.selected_cores.clone()),
        };

        self.store.update_machine_configuration(
            vm_id,
            ConfigPatch {
                runtime: Some(runtime.clone()),
                disk_paths: Some(args.disk_paths.clone()),
            },
        )?;
        self.store.update_machine_status(vm_id, VmStatus::Running)?;

        if let Some(events) = client.take_events() {
            let handle = if args.unattended {
                spawn_install_monitor(
                    vm_id.to_string(),
                    events,
                    self.store.clone(),
                    self.sink.clone(),
                    DEFAULT_INSTALL_TIMEOUT,
                )
            } else {
                spawn_event_handler(
                    vm_id.to_string(),
                    events,
                    self.store.clone(),
                    self.sink.clone(),
                )
            };
            self.attach_handler(vm_id, handle);
        }
        self.register_client(vm_id, client);
        tracker.client = None;

        info!(vm_id, pid, "VM is up");
        Ok(runtime)
    }

    /// Undo a partial bring-up in reverse order: client, process, then the
    /// tagged resource ladder. Disk images are never touched.
    pub(crate) async fn unwind(
        &self,
        vm_id: &str,
        internal_name: &str,
        tracker: BringUpTracker,
    ) {
        self.detach_handler(vm_id);
        self.release_client(vm_id);
        if let Some(client) = tracker.client {
            client.disconnect();
        }

        if let Some(pid) = tracker.pid
            && let Err(e) = process::force_kill(pid).await
        {
            warn!(vm_id, pid, error = %e, "failed to kill hypervisor during unwind");
        }

        let mut steps: Vec<CleanupStep<'_>> = Vec::new();
        if let Some(tap_device) = &tracker.tap {
            let tap_device = tap_device.clone();
            steps.push(CleanupStep::new(
                ResourceKind::Tap,
                tap_device.clone(),
                Box::new(move || {
                    let tap_device = tap_device.clone();
                    Box::pin(async move { tap::destroy(&tap_device).await })
                }),
            ));
        }
        if tracker.chain {
            let filter = self.filter.clone();
            let chain_vm = vm_id.to_string();
            steps.push(CleanupStep::new(
                ResourceKind::FilterChain,
                infinivirt_core::naming::chain_name(vm_id),
                Box::new(move || {
                    let filter = filter.clone();
                    let chain_vm = chain_vm.clone();
                    Box::pin(async move { filter.remove_vm_chain(&chain_vm).await })
                }),
            ));
        }
        let socket = self.paths.control_socket_path(internal_name);
        steps.push(CleanupStep::new(
            ResourceKind::ControlSocket,
            socket.display().to_string(),
            Box::new(move || {
                let socket = socket.clone();
                Box::pin(async move {
                    match std::fs::remove_file(&socket) {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(anyhow::anyhow!("{}", e)),
                    }
                })
            }),
        ));
        let pid_file = self.paths.pid_file_path(internal_name);
        steps.push(CleanupStep::new(
            ResourceKind::PidFile,
            pid_file.display().to_string(),
            Box::new(move || {
                let pid_file = pid_file.clone();
                Box::pin(async move {
                    match std::fs::remove_file(&pid_file) {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(anyhow::anyhow!("{}", e)),
                    }
                })
            }),
        ));
        let store = self.store.clone();
        let db_vm = vm_id.to_string();
        steps.push(CleanupStep::new(
            ResourceKind::DbConfig,
            vm_id,
            Box::new(move || {
                let store = store.clone();
                let db_vm = db_vm.clone();
                Box::pin(async move {
                    store
                        .update_machine_status(&db_vm, VmStatus::Error)
                        .map_err(|e| anyhow::anyhow!("{}", e))?;
                    store
                        .clear_machine_configuration(&db_vm)
                        .map_err(|e| anyhow::anyhow!("{}", e))
                })
            }),
        ));

        let report = execute_cleanup(vm_id, steps, CLEANUP_RETRY).await;
        if report.failed_count() > 0 {
            warn!(vm_id, failed = report.failed_count(), "unwind left resources behind");
        }
    }
}

/// Inputs shared by the Create and Start bring-up path.
pub(crate) struct BringUpArgs<'a> {
    pub vm_id: &'a str,
    pub internal_name: &'a str,
    pub os: &'a str,
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub bridge: &'a str,
    pub display: DisplayConfig,
    pub hardware: &'a HardwareOverrides,
    pub disk_paths: Vec<PathBuf>,
    pub install_iso: Option<PathBuf>,
    pub passthrough: Option<PassthroughDevice>,
    pub mac_override: Option<String>,
    pub unattended: bool,
}

#[derive(Default)]
pub(crate) struct BringUpTracker {
    tap: Option<String>,
    chain: bool,
    pid: Option<u32>,
    client: Option<Arc<dyn ControlClient>>,
}
