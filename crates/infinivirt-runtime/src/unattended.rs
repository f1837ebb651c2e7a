//! Unattended OS installation support.
//!
//! ISO authoring is an external collaborator behind a trait; this module
//! carries the configuration shape and the background monitor that follows
//! the installation through control events until the guest powers itself
//! off (install finished) or the watchdog lapses.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::BoxFuture;
use crate::events::{self, EventSink, OrchestratorEvent};
use crate::qmp::{QmpEvent, QmpEventKind};
use crate::store::VmStore;

/// Watchdog: an installation that has not concluded by now is failed.
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnattendedInstallConfig {
    /// OS variant tag the authoring backend understands.
    pub os_variant: String,
    pub admin_username: String,
    pub admin_password: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub product_key: Option<String>,
}

/// External installation-media authoring.
pub trait InstallMediaService: Send + Sync {
    fn author_iso<'a>(
        &'a self,
        internal_name: &'a str,
        config: &'a UnattendedInstallConfig,
        output: &'a Path,
    ) -> BoxFuture<'a, anyhow::Result<PathBuf>>;
}

/// Event-handler task for an installing VM: reconciles store status like the
/// regular handler and additionally watches for the end of installation.
pub fn spawn_install_monitor(
    vm_id: String,
    mut events_rx: mpsc::UnboundedReceiver<QmpEvent>,
    store: Arc<dyn VmStore>,
    sink: Arc<dyn EventSink>,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::select! {
                event = events_rx.recv() => event,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(vm_id, "installation watchdog expired");
                    sink.emit(OrchestratorEvent::InstallationFailed {
                        vm_id: vm_id.clone(),
                        message: format!("installation did not conclude within {:?}", timeout),
                    });
                    return;
                }
            };

            let Some(event) = event else {
                sink.emit(OrchestratorEvent::InstallationFailed {
                    vm_id: vm_id.clone(),
                    message: "control connection lost during installation".to_string(),
                });
                return;
            };

            let concluded = matches!(
                event.kind,
                QmpEventKind::Shutdown | QmpEventKind::Powerdown
            );
            events::handle_event(&vm_id, &event, store.as_ref(), sink.as_ref());

            if concluded {
                info!(vm_id, "guest powered down, installation concluded");
                sink.emit(OrchestratorEvent::InstallationCompleted {
                    vm_id: vm_id.clone(),
                });
                return;
            }
        }
    })
}
