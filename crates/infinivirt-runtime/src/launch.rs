//! Hypervisor launch command assembly.
//!
//! Produces an argv array only; nothing is ever passed through a shell. The
//! worker daemonizes and writes a PID file so the control plane can track it
//! after the launcher returns.

use std::path::{Path, PathBuf};

use tracing::warn;

use infinivirt_core::vm::{DisplayConfig, DisplayProtocol};
use infinivirt_host::numa::PinPlan;

use crate::options::EffectiveOptions;

pub const HYPERVISOR_BIN: &str = "qemu-system-x86_64";
const HUGEPAGES_MOUNT: &str = "/dev/hugepages";

#[derive(Debug, Clone)]
pub struct PassthroughDevice {
    /// PCI address on the host, e.g. "0000:01:00.0".
    pub address: String,
    pub rom_file: Option<PathBuf>,
}

/// Everything needed to render the worker command line.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub internal_name: String,
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub options: EffectiveOptions,
    pub disk_paths: Vec<PathBuf>,
    pub install_iso: Option<PathBuf>,
    pub tap_device: String,
    pub mac_address: String,
    pub display: DisplayConfig,
    pub control_socket: PathBuf,
    pub pid_file: PathBuf,
    pub uefi_vars: Option<PathBuf>,
    pub passthrough: Option<PassthroughDevice>,
    pub pin_plan: Option<PinPlan>,
}

#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Whether the NUMA wrapper carries the pinning. When false and a plan
    /// exists, the caller applies cgroup affinity after launch.
    pub numa_wrapped: bool,
}

/// Locate the NUMA wrapper tool, if installed.
pub fn find_numactl() -> Option<PathBuf> {
    which::which("numactl").ok()
}

/// Render the launch command. `numactl` is the wrapper binary to use for a
/// pinned launch; without it, pinning degrades to post-launch cgroup
/// affinity with a warning.
pub fn build_command(spec: &LaunchSpec, numactl: Option<&Path>) -> LaunchCommand {
    let mut args: Vec<String> = Vec::new();
    let mut program = HYPERVISOR_BIN.to_string();
    let mut numa_wrapped = false;

    if let Some(plan) = &spec.pin_plan {
        match numactl {
            Some(numactl) => {
                program = numactl.display().to_string();
                args.extend(plan.numactl_args());
                args.push(HYPERVISOR_BIN.to_string());
                numa_wrapped = true;
            }
            None => {
                warn!(
                    vm = %spec.internal_name,
                    "numactl not found, falling back to cgroup affinity"
                );
            }
        }
    }

    args.push("-name".into());
    args.push(format!("guest={},debug-threads=on", spec.internal_name));

    args.push("-machine".into());
    args.push(format!("{},accel=kvm", spec.options.machine_type));
    args.push("-cpu".into());
    args.push(spec.options.cpu_model.clone());
    args.push("-smp".into());
    args.push(spec.cpu_cores.to_string());

    args.push("-m".into());
    args.push(format!("{}M", (spec.ram_gb * 1024.0) as u64));
    if spec.options.hugepages {
        args.push("-mem-path".into());
        args.push(HUGEPAGES_MOUNT.into());
        args.push("-mem-prealloc".into());
    }

    if let (Some(code), Some(vars)) = (&spec.options.firmware_path, &spec.uefi_vars) {
        args.push("-drive".into());
        args.push(format!(
            "if=pflash,format=raw,readonly=on,file={}",
            code.display()
        ));
        args.push("-drive".into());
        args.push(format!("if=pflash,format=raw,file={}", vars.display()));
    }

    for disk in &spec.disk_paths {
        args.push("-drive".into());
        args.push(format!(
            "file={},format=qcow2,if={},cache={}",
            disk.display(),
            drive_interface(&spec.options.disk_bus),
            spec.options.cache_mode
        ));
    }

    match &spec.install_iso {
        Some(iso) => {
            args.push("-drive".into());
            args.push(format!("file={},media=cdrom,readonly=on", iso.display()));
            args.push("-boot".into());
            args.push("order=dc".into());
        }
        None => {
            args.push("-boot".into());
            args.push("order=c".into());
        }
    }

    let queues = spec.options.queue_count;
    let mut netdev = format!(
        "tap,id=net0,ifname={},script=no,downscript=no",
        spec.tap_device
    );
    let multiqueue = queues > 1 && spec.options.network_model == "virtio-net-pci";
    if multiqueue {
        netdev.push_str(&format!(",queues={},vhost=on", queues));
    }
    args.push("-netdev".into());
    args.push(netdev);

    let mut netdevice = format!(
        "{},netdev=net0,mac={}",
        spec.options.network_model, spec.mac_address
    );
    if multiqueue {
        // vectors: 2 per queue pair plus config/control.
        netdevice.push_str(&format!(",mq=on,vectors={}", 2 * queues + 2));
    }
    args.push("-device".into());
    args.push(netdevice);

    if spec.options.memory_balloon {
        args.push("-device".into());
        args.push("virtio-balloon-pci".into());
    }

    if let Some(dev) = &spec.passthrough {
        let mut vfio = format!("vfio-pci,host={}", dev.address);
        if let Some(rom) = &dev.rom_file {
            vfio.push_str(&format!(",romfile={}", rom.display()));
        }
        args.push("-device".into());
        args.push(vfio);
    }

    match spec.display.protocol {
        DisplayProtocol::Spice => {
            let mut spice = format!("port={}", spec.display.port);
            if let Some(host) = &spec.display.host {
                spice.push_str(&format!(",addr={}", host));
            }
            match &spec.display.password {
                Some(password) => spice.push_str(&format!(",password={}", password)),
                None => spice.push_str(",disable-ticketing=on"),
            }
            args.push("-spice".into());
            args.push(spice);
            args.push("-vga".into());
            args.push("qxl".into());
        }
        DisplayProtocol::Vnc => {
            let host = spec.display.host.as_deref().unwrap_or("");
            args.push("-vnc".into());
            args.push(format!("{}:{}", host, spec.display.port));
        }
    }

    args.push("-qmp".into());
    args.push(format!(
        "unix:{},server=on,wait=off",
        spec.control_socket.display()
    ));

    args.push("-daemonize".into());
    args.push("-pidfile".into());
    args.push(spec.pid_file.display().to_string());

    LaunchCommand {
        program,
        args,
        numa_wrapped,
    }
}

fn drive_interface(bus: &str) -> &str {
    match bus {
        "virtio" => "virtio",
        "scsi" => "scsi",
        // SATA rides the IDE drive interface at this level.
        _ => "ide",
    }
}
