use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

/// Host filesystem layout for every artifact the control plane derives from a
/// VM's internal name. Defaults match the production install; tests override
/// the directories wholesale.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub disk_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub persist_dir: PathBuf,
    pub nvram_dir: PathBuf,
    /// Only ROM files under this directory may be attached to passthrough
    /// devices.
    pub rom_allow_dir: PathBuf,
    /// Searched in order for a UEFI vars template to seed per-VM copies.
    pub uefi_var_templates: Vec<PathBuf>,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            disk_dir: PathBuf::from("/var/lib/infinization/disks"),
            socket_dir: PathBuf::from("/var/run/infinization"),
            pid_dir: PathBuf::from("/var/run/infinization/pids"),
            persist_dir: PathBuf::from("/etc/infinization"),
            nvram_dir: PathBuf::from("/var/lib/infinization/nvram"),
            rom_allow_dir: PathBuf::from("/var/lib/infinization/roms"),
            uefi_var_templates: vec![
                PathBuf::from("/usr/share/OVMF/OVMF_VARS.fd"),
                PathBuf::from("/usr/share/edk2/x64/OVMF_VARS.fd"),
                PathBuf::from("/usr/share/qemu/OVMF_VARS.fd"),
            ],
        }
    }
}

impl HostPaths {
    /// Disk image path for disk `index` of a VM. The first disk is bare,
    /// later ones get a `-disk{n}` suffix.
    pub fn disk_path(&self, internal_name: &str, index: usize) -> PathBuf {
        if index == 0 {
            self.disk_dir.join(format!("{}.qcow2", internal_name))
        } else {
            self.disk_dir
                .join(format!("{}-disk{}.qcow2", internal_name, index))
        }
    }

    pub fn control_socket_path(&self, internal_name: &str) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", internal_name))
    }

    pub fn agent_socket_path(&self, internal_name: &str) -> PathBuf {
        self.socket_dir.join(format!("{}-agent.sock", internal_name))
    }

    pub fn service_socket_path(&self, internal_name: &str) -> PathBuf {
        self.socket_dir
            .join(format!("{}-infiniservice.sock", internal_name))
    }

    pub fn pid_file_path(&self, internal_name: &str) -> PathBuf {
        self.pid_dir.join(format!("{}.pid", internal_name))
    }

    pub fn uefi_vars_path(&self, internal_name: &str) -> PathBuf {
        self.nvram_dir.join(format!("{}_VARS.fd", internal_name))
    }

    pub fn install_iso_path(&self, internal_name: &str) -> PathBuf {
        self.disk_dir.join(format!("{}-install.iso", internal_name))
    }

    /// Persisted nftables ruleset mirror.
    pub fn filter_persist_path(&self) -> PathBuf {
        self.persist_dir.join("infinivirt.nft")
    }

    /// Reject ROM paths outside the allow-listed directory, including
    /// traversal via `..` components.
    pub fn validate_rom_path(&self, rom: &Path) -> Result<()> {
        if rom.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            bail!("ROM path must not contain '..': {}", rom.display());
        }
        if !rom.starts_with(&self.rom_allow_dir) {
            bail!(
                "ROM path {} is outside the allowed directory {}",
                rom.display(),
                self.rom_allow_dir.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_path_numbering() {
        let paths = HostPaths::default();
        assert_eq!(
            paths.disk_path("vm-abc123", 0),
            PathBuf::from("/var/lib/infinization/disks/vm-abc123.qcow2")
        );
        assert_eq!(
            paths.disk_path("vm-abc123", 1),
            PathBuf::from("/var/lib/infinization/disks/vm-abc123-disk1.qcow2")
        );
        assert_eq!(
            paths.disk_path("vm-abc123", 2),
            PathBuf::from("/var/lib/infinization/disks/vm-abc123-disk2.qcow2")
        );
    }

    #[test]
    fn test_socket_and_pid_paths() {
        let paths = HostPaths::default();
        assert_eq!(
            paths.control_socket_path("vm-abc123"),
            PathBuf::from("/var/run/infinization/vm-abc123.sock")
        );
        assert_eq!(
            paths.pid_file_path("vm-abc123"),
            PathBuf::from("/var/run/infinization/pids/vm-abc123.pid")
        );
    }

    #[test]
    fn test_rom_allowlist() {
        let paths = HostPaths::default();
        assert!(paths
            .validate_rom_path(Path::new("/var/lib/infinization/roms/gpu.rom"))
            .is_ok());
        assert!(paths
            .validate_rom_path(Path::new("/tmp/evil.rom"))
            .is_err());
        assert!(paths
            .validate_rom_path(Path::new("/var/lib/infinization/roms/../../../etc/shadow"))
            .is_err());
    }

    #[test]
    fn test_filter_persist_path() {
        let paths = HostPaths::default();
        assert_eq!(
            paths.filter_persist_path(),
            PathBuf::from("/etc/infinization/infinivirt.nft")
        );
    }
}
