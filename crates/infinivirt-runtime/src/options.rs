//! Effective hypervisor options: explicit → OS preset → hard default.
//!
//! Whatever survives validation here is persisted, so a reboot launches the
//! VM with exactly the settings it last ran with.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use infinivirt_core::paths::HostPaths;
use infinivirt_core::policy::{
    CACHE_MODES, DEFAULT_CPU_MODEL, DEFAULT_MACHINE_TYPE, DISK_BUSES, MACHINE_TYPES,
    NETWORK_MODELS, detect_os_family, effective_queue_count, validate_option,
};
pub use infinivirt_core::vm::HardwareOverrides;

const PROC_MOUNTS: &str = "/proc/mounts";

/// Fully resolved, validated option set.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveOptions {
    pub machine_type: String,
    pub cpu_model: String,
    pub disk_bus: String,
    pub cache_mode: String,
    pub network_model: String,
    pub queue_count: u32,
    pub memory_balloon: bool,
    /// None means BIOS.
    pub firmware_path: Option<PathBuf>,
    pub hugepages: bool,
}

/// Resolve against the live host (`/proc/mounts` for hugetlbfs).
pub fn resolve(os: &str, cpu_cores: u32, overrides: &HardwareOverrides) -> EffectiveOptions {
    resolve_with(os, cpu_cores, overrides, Path::new(PROC_MOUNTS))
}

/// Resolution with an explicit mounts file, for tests.
pub fn resolve_with(
    os: &str,
    cpu_cores: u32,
    overrides: &HardwareOverrides,
    mounts: &Path,
) -> EffectiveOptions {
    let preset = detect_os_family(os).preset();

    let disk_bus = validate_option(
        "diskBus",
        overrides.disk_bus.as_deref().unwrap_or(preset.disk_bus),
        DISK_BUSES,
        preset.disk_bus,
    );
    let cache_mode = validate_option(
        "diskCacheMode",
        overrides.cache_mode.as_deref().unwrap_or(preset.cache_mode),
        CACHE_MODES,
        preset.cache_mode,
    );
    let network_model = validate_option(
        "networkModel",
        overrides
            .network_model
            .as_deref()
            .unwrap_or(preset.network_model),
        NETWORK_MODELS,
        preset.network_model,
    );
    let machine_type = validate_option(
        "machineType",
        overrides
            .machine_type
            .as_deref()
            .unwrap_or(DEFAULT_MACHINE_TYPE),
        MACHINE_TYPES,
        DEFAULT_MACHINE_TYPE,
    );
    let cpu_model = overrides
        .cpu_model
        .clone()
        .unwrap_or_else(|| DEFAULT_CPU_MODEL.to_string());

    let firmware_path = overrides
        .firmware_path
        .as_deref()
        .and_then(validated_firmware);

    let hugepages = overrides.hugepages.unwrap_or(false) && hugetlbfs_mounted(mounts);
    if overrides.hugepages.unwrap_or(false) && !hugepages {
        warn!("hugepages requested but hugetlbfs is not mounted, using standard memory");
    }

    EffectiveOptions {
        machine_type,
        cpu_model,
        disk_bus,
        cache_mode,
        network_model,
        queue_count: effective_queue_count(overrides.queue_count, cpu_cores),
        memory_balloon: overrides.memory_balloon.unwrap_or(true),
        firmware_path,
        hugepages,
    }
}

/// A firmware image that does not exist or cannot be opened falls back to
/// BIOS (None), stored as such.
fn validated_firmware(path: &Path) -> Option<PathBuf> {
    match fs::File::open(path) {
        Ok(_) => Some(path.to_path_buf()),
        Err(e) => {
            warn!(
                firmware = %path.display(),
                error = %e,
                "firmware unreadable, falling back to BIOS"
            );
            None
        }
    }
}

fn hugetlbfs_mounted(mounts: &Path) -> bool {
    fs::read_to_string(mounts)
        .map(|content| {
            content
                .lines()
                .any(|l| l.split_whitespace().nth(2) == Some("hugetlbfs"))
        })
        .unwrap_or(false)
}

/// Ensure a per-VM UEFI vars file exists, seeding it from the first
/// available template. Returns the vars path for a validated firmware.
pub fn ensure_uefi_vars(paths: &HostPaths, internal_name: &str) -> Result<PathBuf> {
    let vars = paths.uefi_vars_path(internal_name);
    if vars.exists() {
        return Ok(vars);
    }

    let template = paths
        .uefi_var_templates
        .iter()
        .find(|t| t.exists())
        .with_context(|| {
            format!(
                "no UEFI vars template found in {:?}",
                paths.uefi_var_templates
            )
        })?;

    if let Some(parent) = vars.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(template, &vars).with_context(|| {
        format!(
            "Failed to seed UEFI vars {} from {}",
            vars.display(),
            template.display()
        )
    })?;
    Ok(vars)
}
