use tracing::warn;

use crate::vm::DisplayProtocol;

/// Closed sets of hypervisor option values accepted by the launch builder.
/// Anything else warns and falls back to the effective default.
pub const MACHINE_TYPES: &[&str] = &["q35", "pc"];
pub const DISK_BUSES: &[&str] = &["virtio", "scsi", "ide", "sata"];
pub const CACHE_MODES: &[&str] = &["writeback", "writethrough", "none", "unsafe"];
pub const NETWORK_MODELS: &[&str] = &["virtio-net-pci", "e1000"];

pub const DEFAULT_MACHINE_TYPE: &str = "q35";
pub const DEFAULT_CPU_MODEL: &str = "host";

/// OS family a guest tag resolves to. Drives the hardware preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Linux,
    Legacy,
    Default,
}

/// Hardware defaults per OS family. Queue count and display are advisory
/// only: queues are always computed from the core count, display is a
/// required explicit field.
#[derive(Debug, Clone, Copy)]
pub struct HardwarePreset {
    pub disk_bus: &'static str,
    pub cache_mode: &'static str,
    pub network_model: &'static str,
    pub advisory_queues: u32,
    pub advisory_display: DisplayProtocol,
}

const WINDOWS_PRESET: HardwarePreset = HardwarePreset {
    disk_bus: "virtio",
    cache_mode: "none",
    network_model: "virtio-net-pci",
    advisory_queues: 4,
    advisory_display: DisplayProtocol::Spice,
};

const LINUX_PRESET: HardwarePreset = HardwarePreset {
    disk_bus: "virtio",
    cache_mode: "writeback",
    network_model: "virtio-net-pci",
    advisory_queues: 2,
    advisory_display: DisplayProtocol::Spice,
};

const LEGACY_PRESET: HardwarePreset = HardwarePreset {
    disk_bus: "ide",
    cache_mode: "writethrough",
    network_model: "e1000",
    advisory_queues: 1,
    advisory_display: DisplayProtocol::Vnc,
};

const DEFAULT_PRESET: HardwarePreset = LINUX_PRESET;

impl OsFamily {
    pub fn preset(&self) -> &'static HardwarePreset {
        match self {
            Self::Windows => &WINDOWS_PRESET,
            Self::Linux => &LINUX_PRESET,
            Self::Legacy => &LEGACY_PRESET,
            Self::Default => &DEFAULT_PRESET,
        }
    }
}

const LEGACY_WINDOWS_TOKENS: &[&str] = &[
    "win95",
    "win98",
    "winme",
    "windows 95",
    "windows 98",
    "windows me",
];

const LEGACY_TOKENS: &[&str] = &["dos", "bsd", "macos", "darwin", "osx"];

const LINUX_TOKENS: &[&str] = &[
    "ubuntu",
    "debian",
    "fedora",
    "centos",
    "rhel",
    "rocky",
    "alma",
    "arch",
    "manjaro",
    "opensuse",
    "suse",
    "gentoo",
    "slackware",
    "mint",
    "pop_os",
    "elementary",
    "kali",
    "parrot",
    "nixos",
    "void",
    "alpine",
    "linux",
];

/// Case-insensitive pattern match from an OS tag to a hardware family.
///
/// Legacy Windows tokens are checked before the generic `win*` prefix so
/// `win98` does not resolve to the modern Windows preset. `dos` also covers
/// `freedos`.
pub fn detect_os_family(os: &str) -> OsFamily {
    let s = os.to_lowercase();

    if LEGACY_WINDOWS_TOKENS.iter().any(|t| s.contains(t)) {
        return OsFamily::Legacy;
    }
    if LEGACY_TOKENS.iter().any(|t| s.contains(t)) {
        return OsFamily::Legacy;
    }
    if s.starts_with("win") || s.contains("windows") {
        return OsFamily::Windows;
    }
    if LINUX_TOKENS.iter().any(|t| s.contains(t)) {
        return OsFamily::Linux;
    }
    OsFamily::Default
}

/// Validate `value` against a closed option set, warning and coercing to
/// `fallback` on anything unknown.
pub fn validate_option(kind: &str, value: &str, allowed: &[&str], fallback: &str) -> String {
    if allowed.contains(&value) {
        value.to_string()
    } else {
        warn!(
            option = kind,
            value, fallback, "unknown option value, using fallback"
        );
        fallback.to_string()
    }
}

/// Effective virtio queue count: `clamp(explicit ?? min(cores, 4), 1, 4)`.
/// Presets never set this; they are advisory only.
pub fn effective_queue_count(explicit: Option<u32>, cpu_cores: u32) -> u32 {
    explicit.unwrap_or_else(|| cpu_cores.min(4)).clamp(1, 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_detection() {
        assert_eq!(detect_os_family("Windows 10"), OsFamily::Windows);
        assert_eq!(detect_os_family("windows11"), OsFamily::Windows);
        assert_eq!(detect_os_family("win2019"), OsFamily::Windows);
        assert_eq!(detect_os_family("Windows 7"), OsFamily::Windows);
    }

    #[test]
    fn test_legacy_detection() {
        assert_eq!(detect_os_family("win98"), OsFamily::Legacy);
        assert_eq!(detect_os_family("Windows 95"), OsFamily::Legacy);
        assert_eq!(detect_os_family("FreeDOS"), OsFamily::Legacy);
        assert_eq!(detect_os_family("freebsd"), OsFamily::Legacy);
        assert_eq!(detect_os_family("OpenBSD 7.4"), OsFamily::Legacy);
        assert_eq!(detect_os_family("macOS"), OsFamily::Legacy);
        assert_eq!(detect_os_family("darwin"), OsFamily::Legacy);
    }

    #[test]
    fn test_linux_detection() {
        assert_eq!(detect_os_family("ubuntu"), OsFamily::Linux);
        assert_eq!(detect_os_family("Ubuntu 24.04"), OsFamily::Linux);
        assert_eq!(detect_os_family("rocky"), OsFamily::Linux);
        assert_eq!(detect_os_family("linux"), OsFamily::Linux);
        assert_eq!(detect_os_family("NixOS"), OsFamily::Linux);
    }

    #[test]
    fn test_unknown_is_default() {
        assert_eq!(detect_os_family("plan9"), OsFamily::Default);
        assert_eq!(detect_os_family(""), OsFamily::Default);
    }

    #[test]
    fn test_preset_values() {
        let w = OsFamily::Windows.preset();
        assert_eq!(w.disk_bus, "virtio");
        assert_eq!(w.cache_mode, "none");
        assert_eq!(w.advisory_queues, 4);

        let l = OsFamily::Legacy.preset();
        assert_eq!(l.disk_bus, "ide");
        assert_eq!(l.network_model, "e1000");
        assert_eq!(l.advisory_display, DisplayProtocol::Vnc);

        let d = OsFamily::Default.preset();
        assert_eq!(d.cache_mode, "writeback");
    }

    #[test]
    fn test_validate_option_coerces_unknown() {
        assert_eq!(
            validate_option("diskBus", "virtio", DISK_BUSES, "virtio"),
            "virtio"
        );
        assert_eq!(
            validate_option("diskBus", "floppy", DISK_BUSES, "virtio"),
            "virtio"
        );
    }

    #[test]
    fn test_queue_count_clamp() {
        assert_eq!(effective_queue_count(None, 1), 1);
        assert_eq!(effective_queue_count(None, 2), 2);
        assert_eq!(effective_queue_count(None, 8), 4);
        assert_eq!(effective_queue_count(Some(3), 8), 3);
        assert_eq!(effective_queue_count(Some(0), 8), 1);
        assert_eq!(effective_queue_count(Some(16), 2), 4);
    }
}
