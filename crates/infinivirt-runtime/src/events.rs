//! Event plumbing: the sink the orchestrator emits into, and the per-VM
//! handler task that turns control-protocol events into store updates.
//!
//! The handler is detached (aborted) before Stop mutates the store, so a
//! late guest event can never undo an operator-driven status change.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use infinivirt_core::cleanup::CleanupReport;
use infinivirt_core::vm::VmStatus;

use crate::qmp::{QmpEvent, QmpEventKind};
use crate::store::VmStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Error,
}

/// Events the control plane emits to its host application.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    PowerOff {
        vm_id: String,
    },
    Crash {
        vm_id: String,
        report: CleanupReport,
    },
    CleanupAlert {
        vm_id: String,
        severity: AlertSeverity,
        report: CleanupReport,
    },
    InstallationCompleted {
        vm_id: String,
    },
    InstallationFailed {
        vm_id: String,
        message: String,
    },
    GuestStateChanged {
        vm_id: String,
        status: VmStatus,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Sink that records events in memory, for tests and diagnostics.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<OrchestratorEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestratorEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: OrchestratorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Attach a handler task consuming one VM's control events and reconciling
/// store status. Returns the task handle; aborting it is the detach.
pub fn spawn_event_handler(
    vm_id: String,
    mut events: mpsc::UnboundedReceiver<QmpEvent>,
    store: Arc<dyn VmStore>,
    sink: Arc<dyn EventSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            handle_event(&vm_id, &event, store.as_ref(), sink.as_ref());
        }
        debug!(vm_id, "control event stream closed");
    })
}

pub(crate) fn handle_event(
    vm_id: &str,
    event: &QmpEvent,
    store: &dyn VmStore,
    sink: &dyn EventSink,
) {
    match event.kind {
        QmpEventKind::Shutdown | QmpEventKind::Powerdown => {
            info!(vm_id, kind = ?event.kind, "guest powered down");
            if let Err(e) = store.update_machine_status(vm_id, VmStatus::Off) {
                warn!(vm_id, error = %e, "failed to record guest power-off");
                return;
            }
            if let Err(e) = store.clear_machine_configuration(vm_id) {
                warn!(vm_id, error = %e, "failed to clear config after power-off");
            }
            sink.emit(OrchestratorEvent::PowerOff {
                vm_id: vm_id.to_string(),
            });
        }
        QmpEventKind::Stop => {
            update_status(vm_id, VmStatus::Paused, store, sink);
        }
        QmpEventKind::Suspend => {
            update_status(vm_id, VmStatus::Suspended, store, sink);
        }
        QmpEventKind::Resume | QmpEventKind::Wakeup => {
            update_status(vm_id, VmStatus::Running, store, sink);
        }
        QmpEventKind::Reset => {
            info!(vm_id, "guest reset");
        }
        QmpEventKind::DeviceDeleted | QmpEventKind::BlockJobCompleted => {
            debug!(vm_id, kind = ?event.kind, "device event");
        }
        QmpEventKind::Other(ref name) => {
            debug!(vm_id, event = %name, "unhandled control event");
        }
    }
}

fn update_status(vm_id: &str, status: VmStatus, store: &dyn VmStore, sink: &dyn EventSink) {
    match store.update_machine_status(vm_id, status) {
        Ok(()) => sink.emit(OrchestratorEvent::GuestStateChanged {
            vm_id: vm_id.to_string(),
            status,
        }),
        Err(e) => warn!(vm_id, %status, error = %e, "failed to record guest state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use infinivirt_core::vm::{DiskSpec, VmRecord};

    fn record(id: &str, status: VmStatus) -> VmRecord {
        VmRecord {
            id: id.to_string(),
            name: id.to_string(),
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

    fn event(kind: QmpEventKind) -> QmpEvent {
        QmpEvent {
            kind,
            timestamp: None,
            data: None,
        }
    }

    #[tokio::test]
    async fn test_shutdown_event_clears_record() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        store.create_machine(record("a", VmStatus::Running)).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_event_handler("a".to_string(), rx, store.clone(), sink.clone());

        tx.send(event(QmpEventKind::Shutdown)).unwrap();
        drop(tx);
        handle.await.unwrap();

        let rec = store.find_machine_with_config("a").unwrap();
        assert_eq!(rec.status, VmStatus::Off);
        assert!(rec.runtime.is_none());
        assert!(matches!(
            sink.events().as_slice(),
            [OrchestratorEvent::PowerOff { vm_id }] if vm_id == "a"
        ));
    }

    #[tokio::test]
    async fn test_pause_resume_events_track_status() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        store.create_machine(record("a", VmStatus::Running)).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_event_handler("a".to_string(), rx, store.clone(), sink.clone());

        tx.send(event(QmpEventKind::Stop)).unwrap();
        tx.send(event(QmpEventKind::Resume)).unwrap();
        drop(tx);
        handle.await.unwrap();

        let rec = store.find_machine_with_config("a").unwrap();
        assert_eq!(rec.status, VmStatus::Running);
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn test_detach_stops_processing() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        store.create_machine(record("a", VmStatus::Running)).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_event_handler("a".to_string(), rx, store.clone(), sink.clone());
        handle.abort();
        let _ = handle.await;

        // Events sent after detach never reach the store.
        let _ = tx.send(event(QmpEventKind::Shutdown));
        tokio::task::yield_now().await;
        let rec = store.find_machine_with_config("a").unwrap();
        assert_eq!(rec.status, VmStatus::Running);
    }
}
