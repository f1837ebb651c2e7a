//! VM creation: validate, carve out host resources bottom-up, launch, and
//! persist the effective configuration.

use std::path::PathBuf;

use tracing::{info, warn};

use infinivirt_core::error::VmError;
use infinivirt_core::naming;
use infinivirt_core::result::{CreateResult, OperationResult};
use infinivirt_core::vm::{
    DiskSpec, DisplayConfig, DisplayProtocol, HardwareOverrides, VmRecord, VmStatus,
};

use crate::launch::PassthroughDevice;
use crate::unattended::UnattendedInstallConfig;

use super::{BringUpArgs, Orchestrator};

/// Minimum guest memory in GB.
const MIN_RAM_GB: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct CreateConfig {
    /// Stable database id. Defaults to the internal name.
    pub id: Option<String>,
    pub name: String,
    pub internal_name: String,
    pub os: String,
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub disks: Vec<DiskSpec>,
    pub bridge: String,
    pub display: DisplayProtocol,
    pub display_port: u16,
    pub display_host: Option<String>,
    pub display_password: Option<String>,
    pub passthrough: Option<PassthroughDevice>,
    pub hardware: HardwareOverrides,
    pub mac_address: Option<String>,
    pub unattended: Option<UnattendedInstallConfig>,
}

impl Orchestrator {
    pub async fn create(&self, config: CreateConfig) -> Result<CreateResult, VmError> {
        self.validate_create(&config)?;
        let vm_id = config
            .id
            .clone()
            .unwrap_or_else(|| config.internal_name.clone());

        // Record first: every later failure can then be pinned on it.
        let disk_paths: Vec<PathBuf> = (0..config.disks.len())
            .map(|i| self.paths.disk_path(&config.internal_name, i))
            .collect();
        let display = DisplayConfig {
            protocol: config.display,
            port: config.display_port,
            host: config.display_host.clone(),
            password: config.display_password.clone(),
        };
        self.store.create_machine(VmRecord {
            id: vm_id.clone(),
            name: config.name.clone(),
            internal_name: config.internal_name.clone(),
            os: config.os.clone(),
            cpu_cores: config.cpu_cores,
            ram_gb: config.ram_gb,
            disks: config.disks.clone(),
            disk_paths: disk_paths.clone(),
            bridge: config.bridge.clone(),
            display: Some(display.clone()),
            hardware: config.hardware.clone(),
            status: VmStatus::Building,
            version: 0,
            runtime: None,
            last_tap_device: None,
        })?;

        for dir in [&self.paths.disk_dir, &self.paths.socket_dir, &self.paths.pid_dir] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                let msg = format!("cannot create {}: {}", dir.display(), e);
                self.mark_create_error(&vm_id);
                return Err(VmError::CreateFailed(msg));
            }
        }

        // Disk images are created up front and never rolled back.
        for (path, disk) in disk_paths.iter().zip(&config.disks) {
            if let Err(e) = self.disks.create_image(path, disk.size_gb).await {
                self.mark_create_error(&vm_id);
                return Err(VmError::CreateFailed(format!(
                    "disk image {}: {:#}",
                    path.display(),
                    e
                )));
            }
        }

        let install_iso = match &config.unattended {
            Some(unattended) => match self.author_install_iso(&config, unattended).await {
                Ok(iso) => Some(iso),
                Err(e) => {
                    self.mark_create_error(&vm_id);
                    return Err(VmError::CreateFailed(format!(
                        "installation media: {}",
                        e
                    )));
                }
            },
            None => None,
        };

        let bring_up = self
            .bring_up(BringUpArgs {
                vm_id: &vm_id,
                internal_name: &config.internal_name,
                os: &config.os,
                cpu_cores: config.cpu_cores,
                ram_gb: config.ram_gb,
                bridge: &config.bridge,
                display,
                hardware: &config.hardware,
                disk_paths: disk_paths.clone(),
                install_iso: install_iso.clone(),
                passthrough: config.passthrough.clone(),
                mac_override: config.mac_address.clone(),
                unattended: config.unattended.is_some(),
            })
            .await;

        let runtime = match bring_up {
            Ok(runtime) => runtime,
            Err(e) => {
                // bring_up already unwound host resources and marked the
                // record; the ISO is ours to drop.
                if let Some(iso) = &install_iso
                    && let Err(rm) = std::fs::remove_file(iso)
                {
                    warn!(vm_id, error = %rm, "failed to remove installation ISO");
                }
                return Err(VmError::CreateFailed(e.to_string()));
            }
        };

        info!(vm_id, name = %config.name, "VM created");
        Ok(CreateResult {
            result: OperationResult::ok(&vm_id, "VM created and started"),
            tap_device: runtime.tap_device.clone(),
            control_socket_path: runtime.control_socket_path.clone(),
            display_port: config.display_port,
            pid: runtime.pid.unwrap_or_default(),
            disk_paths,
            pid_file_path: runtime.pid_file_path.clone(),
            installation_iso_path: install_iso,
            installing_os: config.unattended.as_ref().map(|_| true),
        })
    }

    fn validate_create(&self, config: &CreateConfig) -> Result<(), VmError> {
        naming::validate_internal_name(&config.internal_name)
            .map_err(|e| VmError::InvalidConfig(e.to_string()))?;
        if config.name.is_empty() {
            return Err(VmError::InvalidConfig("display name must not be empty".into()));
        }
        if config.cpu_cores < 1 {
            return Err(VmError::InvalidConfig(
                "cpuCores must be at least 1".into(),
            ));
        }
        if config.ram_gb < MIN_RAM_GB {
            return Err(VmError::InvalidConfig(format!(
                "ramGB must be at least {}",
                MIN_RAM_GB
            )));
        }
        if config.disks.is_empty() {
            return Err(VmError::InvalidConfig("at least one disk is required".into()));
        }
        if let Some(disk) = config.disks.iter().find(|d| d.size_gb < 1) {
            return Err(VmError::InvalidConfig(format!(
                "disk size {}GB is below the 1GB minimum",
                disk.size_gb
            )));
        }
        if config.bridge.is_empty() {
            return Err(VmError::InvalidConfig("bridge name must not be empty".into()));
        }
        if let Some(device) = &config.passthrough
            && let Some(rom) = &device.rom_file
        {
            self.paths
                .validate_rom_path(rom)
                .map_err(|e| VmError::InvalidConfig(e.to_string()))?;
        }
        if let Some(cores) = &config.hardware.pin_cores {
            // Full plan construction validates every index against the
            // topology; discard the plan, keep the verdict.
            self.explicit_pin_plan(config.cpu_cores, cores)?;
        }
        if config.unattended.is_some() && self.install_media.is_none() {
            return Err(VmError::InvalidConfig(
                "unattended installation requested but no media service is configured".into(),
            ));
        }
        Ok(())
    }

    async fn author_install_iso(
        &self,
        config: &CreateConfig,
        unattended: &UnattendedInstallConfig,
    ) -> Result<PathBuf, String> {
        let service = self
            .install_media
            .as_ref()
            .expect("validated: media service present");
        let output = self.paths.install_iso_path(&config.internal_name);
        service
            .author_iso(&config.internal_name, unattended, &output)
            .await
            .map_err(|e| format!("{:#}", e))
    }

    fn mark_create_error(&self, vm_id: &str) {
        if let Err(e) = self.store.update_machine_status(vm_id, VmStatus::Error) {
            warn!(vm_id, error = %e, "failed to mark create error");
        }
    }
}
