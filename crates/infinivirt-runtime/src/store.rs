//! Persistence adapter interface.
//!
//! The orchestrator owns no database; it consumes this trait. The relational
//! adapter lives outside this crate. `MemoryStore` is the in-process
//! reference implementation used by tests and by the diagnostics binary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use infinivirt_core::error::VmError;
use infinivirt_core::firewall::FirewallRule;
use infinivirt_core::vm::{RuntimeConfig, VmRecord, VmStatus};

pub type StoreResult<T> = Result<T, VmError>;

/// Partial update applied to a VM record. Absent fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub runtime: Option<RuntimeConfig>,
    pub disk_paths: Option<Vec<PathBuf>>,
}

/// Department and per-VM rule sets for one machine.
#[derive(Debug, Clone, Default)]
pub struct FirewallRuleSets {
    pub dept: Vec<FirewallRule>,
    pub vm: Vec<FirewallRule>,
}

/// Result of a successful optimistic status transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub new_version: u64,
    pub record: VmRecord,
}

/// Operations the orchestrator and health monitor need from the store.
///
/// Implementations serialize writes per VM and bump `version` on every
/// mutation; `transition_vm_status` is the only compare-and-swap.
pub trait VmStore: Send + Sync {
    fn create_machine(&self, record: VmRecord) -> StoreResult<()>;
    fn find_machine_with_config(&self, id: &str) -> StoreResult<VmRecord>;
    fn update_machine_configuration(&self, id: &str, patch: ConfigPatch) -> StoreResult<()>;
    fn update_machine_status(&self, id: &str, status: VmStatus) -> StoreResult<()>;
    /// Clear all volatile configuration.
    fn clear_machine_configuration(&self, id: &str) -> StoreResult<()>;
    /// Clear volatile configuration but keep fields that must survive crash
    /// cleanup (the tap-device name hint).
    fn clear_volatile_machine_configuration(&self, id: &str) -> StoreResult<()>;
    /// CAS: move `id` from `from` to `to` iff the stored version equals
    /// `expected_version`. Raises `VmError::VersionConflict` otherwise.
    fn transition_vm_status(
        &self,
        id: &str,
        from: VmStatus,
        to: VmStatus,
        expected_version: u64,
    ) -> StoreResult<TransitionOutcome>;
    fn get_firewall_rules(&self, id: &str) -> StoreResult<FirewallRuleSets>;
    fn get_machine_internal_name(&self, id: &str) -> StoreResult<String>;
    fn find_running_vms(&self) -> StoreResult<Vec<VmRecord>>;
}

/// In-memory store: reference adapter and test double.
#[derive(Default)]
pub struct MemoryStore {
    machines: Mutex<HashMap<String, VmRecord>>,
    rules: Mutex<HashMap<String, FirewallRuleSets>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_firewall_rules(&self, id: &str, sets: FirewallRuleSets) {
        self.rules.lock().unwrap().insert(id.to_string(), sets);
    }

    fn with_machine<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut VmRecord) -> T,
    ) -> StoreResult<T> {
        let mut machines = self.machines.lock().unwrap();
        let record = machines
            .get_mut(id)
            .ok_or_else(|| VmError::VmNotFound(id.to_string()))?;
        let out = f(record);
        record.version += 1;
        Ok(out)
    }
}

impl VmStore for MemoryStore {
    fn create_machine(&self, record: VmRecord) -> StoreResult<()> {
        let mut machines = self.machines.lock().unwrap();
        if machines.contains_key(&record.id) {
            return Err(VmError::Database(format!(
                "machine {} already exists",
                record.id
            )));
        }
        machines.insert(record.id.clone(), record);
        Ok(())
    }

    fn find_machine_with_config(&self, id: &str) -> StoreResult<VmRecord> {
        self.machines
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| VmError::VmNotFound(id.to_string()))
    }

    fn update_machine_configuration(&self, id: &str, patch: ConfigPatch) -> StoreResult<()> {
        self.with_machine(id, |record| {
            if let Some(runtime) = patch.runtime {
                record.runtime = Some(runtime);
            }
            if let Some(disk_paths) = patch.disk_paths {
                record.disk_paths = disk_paths;
            }
        })
    }

    fn update_machine_status(&self, id: &str, status: VmStatus) -> StoreResult<()> {
        self.with_machine(id, |record| {
            record.status = status;
        })
    }

    fn clear_machine_configuration(&self, id: &str) -> StoreResult<()> {
        self.with_machine(id, |record| {
            record.runtime = None;
            record.last_tap_device = None;
        })
    }

    fn clear_volatile_machine_configuration(&self, id: &str) -> StoreResult<()> {
        self.with_machine(id, |record| {
            if let Some(runtime) = record.runtime.take() {
                record.last_tap_device = Some(runtime.tap_device);
            }
        })
    }

    fn transition_vm_status(
        &self,
        id: &str,
        from: VmStatus,
        to: VmStatus,
        expected_version: u64,
    ) -> StoreResult<TransitionOutcome> {
        let mut machines = self.machines.lock().unwrap();
        let record = machines
            .get_mut(id)
            .ok_or_else(|| VmError::VmNotFound(id.to_string()))?;

        if record.status != from || record.version != expected_version {
            return Err(VmError::VersionConflict(format!(
                "{}: expected {}@v{}, found {}@v{}",
                id, from, expected_version, record.status, record.version
            )));
        }

        record.status = to;
        record.version += 1;
        Ok(TransitionOutcome {
            new_version: record.version,
            record: record.clone(),
        })
    }

    fn get_firewall_rules(&self, id: &str) -> StoreResult<FirewallRuleSets> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_machine_internal_name(&self, id: &str) -> StoreResult<String> {
        Ok(self.find_machine_with_config(id)?.internal_name)
    }

    fn find_running_vms(&self) -> StoreResult<Vec<VmRecord>> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == VmStatus::Running)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infinivirt_core::vm::DiskSpec;

    pub(crate) fn record(id: &str, status: VmStatus) -> VmRecord {
        VmRecord {
            id: id.to_string(),
            name: format!("{}-name", id),
            internal_name: format!("vm-{}", id),
            os: "ubuntu".to_string(),
            cpu_cores: 2,
            ram_gb: 4.0,
            disks: vec![DiskSpec { size_gb: 20 }],
            disk_paths: Vec::new(),
            bridge: "virbr0".to_string(),
            display: None,
            hardware: Default::default(),
            status,
            version: 0,
            runtime: None,
            last_tap_device: None,
        }
    }

    #[test]
    fn test_create_and_find() {
        let store = MemoryStore::new();
        store.create_machine(record("a", VmStatus::Off)).unwrap();
        let found = store.find_machine_with_config("a").unwrap();
        assert_eq!(found.internal_name, "vm-a");
        assert!(matches!(
            store.find_machine_with_config("missing"),
            Err(VmError::VmNotFound(_))
        ));
    }

    #[test]
    fn test_updates_bump_version() {
        let store = MemoryStore::new();
        store.create_machine(record("a", VmStatus::Off)).unwrap();
        store
            .update_machine_status("a", VmStatus::Running)
            .unwrap();
        let rec = store.find_machine_with_config("a").unwrap();
        assert_eq!(rec.version, 1);
        assert_eq!(rec.status, VmStatus::Running);
    }

    #[test]
    fn test_transition_cas_succeeds_once() {
        let store = MemoryStore::new();
        store.create_machine(record("a", VmStatus::Off)).unwrap();

        let outcome = store
            .transition_vm_status("a", VmStatus::Off, VmStatus::Building, 0)
            .unwrap();
        assert_eq!(outcome.new_version, 1);
        assert_eq!(outcome.record.status, VmStatus::Building);

        // Second caller with the stale version loses.
        let err = store
            .transition_vm_status("a", VmStatus::Off, VmStatus::Building, 0)
            .unwrap_err();
        assert!(matches!(err, VmError::VersionConflict(_)));
    }

    #[test]
    fn test_clear_volatile_keeps_tap_hint() {
        use infinivirt_core::vm::{DisplayConfig, DisplayProtocol};
        let store = MemoryStore::new();
        let mut rec = record("a", VmStatus::Running);
        rec.runtime = Some(RuntimeConfig {
            pid: Some(4242),
            control_socket_path: "/run/a.sock".into(),
            pid_file_path: "/run/a.pid".into(),
            tap_device: "vnet-a".to_string(),
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
            disk_paths: vec!["/var/lib/x.qcow2".into()],
            pinned_cores: None,
        });
        store.create_machine(rec).unwrap();

        store.clear_volatile_machine_configuration("a").unwrap();
        let rec = store.find_machine_with_config("a").unwrap();
        assert!(rec.runtime.is_none());
        assert_eq!(rec.last_tap_device.as_deref(), Some("vnet-a"));

        store.clear_machine_configuration("a").unwrap();
        let rec = store.find_machine_with_config("a").unwrap();
        assert!(rec.last_tap_device.is_none());
    }

    #[test]
    fn test_find_running_vms() {
        let store = MemoryStore::new();
        store.create_machine(record("a", VmStatus::Running)).unwrap();
        store.create_machine(record("b", VmStatus::Off)).unwrap();
        store.create_machine(record("c", VmStatus::Running)).unwrap();

        let mut running: Vec<String> = store
            .find_running_vms()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        running.sort();
        assert_eq!(running, ["a", "c"]);
    }
}
