//! Health monitor: periodic liveness sweep over every VM the store believes
//! is running, with transactional crash cleanup.
//!
//! One cycle at a time: a re-entrancy flag skips a tick that fires while the
//! previous cycle is still walking cleanup ladders.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use infinivirt_core::cleanup::CleanupReport;
use infinivirt_core::error::VmError;
use infinivirt_core::paths::HostPaths;
use infinivirt_core::vm::VmStatus;
use infinivirt_host::filter::FilterService;

use crate::cleanup::{CLEANUP_RETRY, CleanupContext, crash_cleanup_steps, execute_cleanup};
use crate::events::{AlertSeverity, EventSink, OrchestratorEvent};
use crate::process;
use crate::store::VmStore;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Failures at or above this count escalate the cleanup alert to error.
const ALERT_ERROR_THRESHOLD: usize = 3;

pub type CrashHook = Arc<dyn Fn(&str, &CleanupReport) + Send + Sync>;

pub struct HealthMonitor {
    store: Arc<dyn VmStore>,
    filter: Arc<FilterService>,
    paths: HostPaths,
    sink: Arc<dyn EventSink>,
    interval: Duration,
    checking: AtomicBool,
    crash_hook: Option<CrashHook>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn VmStore>,
        filter: Arc<FilterService>,
        paths: HostPaths,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            filter,
            paths,
            sink,
            interval: DEFAULT_CHECK_INTERVAL,
            checking: AtomicBool::new(false),
            crash_hook: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Callback invoked after crash cleanup, before the crash event fires.
    pub fn with_crash_hook(mut self, hook: CrashHook) -> Self {
        self.crash_hook = Some(hook);
        self
    }

    /// Run the sweep loop until the returned handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.check_cycle().await;
            }
        })
    }

    /// One sweep. Returns the cleanup reports of any crashes handled; an
    /// overlapping call returns empty immediately.
    pub async fn check_cycle(&self) -> Vec<CleanupReport> {
        if self.checking.swap(true, Ordering::SeqCst) {
            debug!("health check still running, skipping cycle");
            return Vec::new();
        }
        let reports = self.cycle_inner().await;
        self.checking.store(false, Ordering::SeqCst);
        reports
    }

    async fn cycle_inner(&self) -> Vec<CleanupReport> {
        let running = match self.store.find_running_vms() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "health check could not query running VMs");
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        for record in running {
            let Some(runtime) = &record.runtime else {
                warn!(vm_id = %record.id, "running VM has no runtime config, skipping");
                continue;
            };
            let Some(pid) = runtime.pid else {
                // No PID recorded: cannot distinguish crash from a start in
                // flight, so assume alive.
                debug!(vm_id = %record.id, "no PID recorded, assuming alive");
                continue;
            };
            if process::is_pid_alive(pid) {
                continue;
            }

            info!(vm_id = %record.id, pid, "hypervisor process is gone, running crash cleanup");
            if let Err(e) = self.store.update_machine_status(&record.id, VmStatus::Off) {
                warn!(vm_id = %record.id, error = %e, "failed to mark crashed VM off");
            }

            let ctx = CleanupContext {
                vm_id: &record.id,
                internal_name: &record.internal_name,
                tap_device: Some(runtime.tap_device.as_str()),
                paths: &self.paths,
                filter: &self.filter,
                store: self.store.as_ref(),
            };
            let report = execute_cleanup(&record.id, crash_cleanup_steps(&ctx), CLEANUP_RETRY).await;

            if let Some(hook) = &self.crash_hook {
                hook(&record.id, &report);
            }

            let failed = report.failed_count();
            if failed > 0 {
                let severity = if failed >= ALERT_ERROR_THRESHOLD {
                    AlertSeverity::Error
                } else {
                    AlertSeverity::Warning
                };
                self.sink.emit(OrchestratorEvent::CleanupAlert {
                    vm_id: record.id.clone(),
                    severity,
                    report: report.clone(),
                });
            }
            self.sink.emit(OrchestratorEvent::Crash {
                vm_id: record.id.clone(),
                report: report.clone(),
            });
            reports.push(report);
        }
        reports
    }

    /// Operator-driven re-run of the cleanup ladder for one VM, after a
    /// partial failure left host resources behind.
    pub async fn retry_cleanup(&self, vm_id: &str) -> Result<CleanupReport, VmError> {
        let record = self.store.find_machine_with_config(vm_id)?;
        let tap = record
            .runtime
            .as_ref()
            .map(|r| r.tap_device.clone())
            .or(record.last_tap_device.clone());

        let ctx = CleanupContext {
            vm_id: &record.id,
            internal_name: &record.internal_name,
            tap_device: tap.as_deref(),
            paths: &self.paths,
            filter: &self.filter,
            store: self.store.as_ref(),
        };
        Ok(execute_cleanup(&record.id, crash_cleanup_steps(&ctx), CLEANUP_RETRY).await)
    }

    #[cfg(test)]
    fn force_checking(&self, value: bool) {
        self.checking.store(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::store::MemoryStore;
    use infinivirt_core::cleanup::{ResourceKind, ResourceStatus};
    use infinivirt_core::vm::{
        DiskSpec, DisplayConfig, DisplayProtocol, RuntimeConfig, VmRecord,
    };
    use infinivirt_host::exec_mock::mock;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn runtime(pid: Option<u32>, paths: &HostPaths, internal: &str) -> RuntimeConfig {
        RuntimeConfig {
            pid,
            control_socket_path: paths.control_socket_path(internal),
            pid_file_path: paths.pid_file_path(internal),
            tap_device: format!("vnet-{}", internal),
            mac_address: "52:54:00:aa:bb:cc".to_string(),
            bridge: "virbr0".to_string(),
            display: DisplayConfig {
                protocol: DisplayProtocol::Spice,
                port: 5901,
                host: None,
                password: None,
            },
            machine_type: "q35".to_string(),
            cpu_model: "host".to_string(),
            disk_bus: "virtio".to_string(),
            cache_mode: "writeback".to_string(),
            network_model: "virtio-net-pci".to_string(),
            queue_count: 2,
            memory_balloon: true,
            firmware_path: None,
            uefi_vars_path: None,
            hugepages: false,
            disk_paths: Vec::new(),
            pinned_cores: None,
        }
    }

    fn running_record(id: &str, pid: Option<u32>, paths: &HostPaths) -> VmRecord {
        let internal = format!("vm-{}", id);
        VmRecord {
            id: id.to_string(),
            name: id.to_string(),
            internal_name: internal.clone(),
            os: "ubuntu".to_string(),
            cpu_cores: 2,
            ram_gb: 4.0,
            disks: vec![DiskSpec { size_gb: 20 }],
            disk_paths: Vec::new(),
            bridge: "virbr0".to_string(),
            display: None,
            hardware: Default::default(),
            status: VmStatus::Running,
            version: 0,
            runtime: Some(runtime(pid, paths, &internal)),
            last_tap_device: None,
        }
    }

    struct Fixture {
        monitor: HealthMonitor,
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        paths: HostPaths,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = HostPaths::default();
        paths.socket_dir = dir.path().to_path_buf();
        paths.pid_dir = dir.path().to_path_buf();
        paths.persist_dir = dir.path().to_path_buf();

        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let filter = Arc::new(FilterService::new(paths.filter_persist_path()));
        let monitor = HealthMonitor::new(
            store.clone(),
            filter,
            paths.clone(),
            sink.clone(),
        );
        Fixture {
            monitor,
            store,
            sink,
            paths,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_crash_detected_and_cleaned() {
        let fx = fixture();
        let pid = dead_pid();
        let record = running_record("a", Some(pid), &fx.paths);
        std::fs::write(&record.runtime.as_ref().unwrap().control_socket_path, "").unwrap();
        std::fs::write(
            &record.runtime.as_ref().unwrap().pid_file_path,
            pid.to_string(),
        )
        .unwrap();
        fx.store.create_machine(record).unwrap();

        let (_guard, _calls) = mock().install();
        let reports = fx.monitor.check_cycle().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].all_succeeded(), "{:?}", reports[0]);
        assert_eq!(
            reports[0].status_of(ResourceKind::Tap),
            Some(ResourceStatus::Success)
        );
        assert_eq!(
            reports[0].status_of(ResourceKind::DbConfig),
            Some(ResourceStatus::Success)
        );

        let rec = fx.store.find_machine_with_config("a").unwrap();
        assert_eq!(rec.status, VmStatus::Off);
        assert!(rec.runtime.is_none());
        assert_eq!(rec.last_tap_device.as_deref(), Some("vnet-vm-a"));
        assert!(!fx.paths.control_socket_path("vm-a").exists());
        assert!(!fx.paths.pid_file_path("vm-a").exists());

        let events = fx.sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::Crash { vm_id, .. } if vm_id == "a")));
        // Clean run: no alert.
        assert!(!events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::CleanupAlert { .. })));
    }

    #[tokio::test]
    async fn test_live_vm_left_alone() {
        let fx = fixture();
        fx.store
            .create_machine(running_record("a", Some(std::process::id()), &fx.paths))
            .unwrap();

        let (_guard, _calls) = mock().install();
        let reports = fx.monitor.check_cycle().await;
        assert!(reports.is_empty());
        let rec = fx.store.find_machine_with_config("a").unwrap();
        assert_eq!(rec.status, VmStatus::Running);
        assert!(rec.runtime.is_some());
    }

    #[tokio::test]
    async fn test_missing_pid_assumed_alive() {
        let fx = fixture();
        fx.store
            .create_machine(running_record("a", None, &fx.paths))
            .unwrap();

        let (_guard, _calls) = mock().install();
        let reports = fx.monitor.check_cycle().await;
        assert!(reports.is_empty());
        assert_eq!(
            fx.store.find_machine_with_config("a").unwrap().status,
            VmStatus::Running
        );
    }

    #[tokio::test]
    async fn test_reentrancy_guard_skips_overlapping_cycle() {
        let fx = fixture();
        fx.store
            .create_machine(running_record("a", Some(dead_pid()), &fx.paths))
            .unwrap();

        fx.monitor.force_checking(true);
        let (_guard, _calls) = mock().install();
        assert!(fx.monitor.check_cycle().await.is_empty());

        fx.monitor.force_checking(false);
        assert_eq!(fx.monitor.check_cycle().await.len(), 1);
    }

    #[tokio::test]
    async fn test_crash_hook_runs_before_event() {
        let fx = fixture();
        fx.store
            .create_machine(running_record("a", Some(dead_pid()), &fx.paths))
            .unwrap();

        let hook_seen = Arc::new(AtomicBool::new(false));
        let seen = hook_seen.clone();
        let monitor = fx
            .monitor
            .with_crash_hook(Arc::new(move |vm_id, report| {
                assert_eq!(vm_id, "a");
                assert!(report.finished_at.is_some());
                seen.store(true, Ordering::SeqCst);
            }));

        let (_guard, _calls) = mock().install();
        monitor.check_cycle().await;
        assert!(hook_seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_retry_cleanup_uses_tap_hint() {
        let fx = fixture();
        let mut record = running_record("a", Some(dead_pid()), &fx.paths);
        record.status = VmStatus::Off;
        record.runtime = None;
        record.last_tap_device = Some("vnet-vm-a".to_string());
        fx.store.create_machine(record).unwrap();

        let (_guard, calls) = mock().install();
        let report = fx.monitor.retry_cleanup("a").await.unwrap();
        assert!(report.all_succeeded());
        assert!(calls
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.contains("ip link set vnet-vm-a down")));
    }
}
