//! CPU pinning through the host cgroup tree.
//!
//! Used when the NUMA wrapper tool is unavailable or pinning is applied
//! after launch. Everything here is best-effort: pinning failures degrade
//! performance, never correctness, so callers warn and continue.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use infinivirt_host::numa::PinPlan;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/infinivirt";

fn scope_dir(cgroup_root: &Path, internal_name: &str) -> PathBuf {
    cgroup_root.join(format!("{}.scope", internal_name))
}

/// Place the hypervisor process into a per-VM cpuset scope.
pub fn apply_cpu_pinning(
    cgroup_root: &Path,
    internal_name: &str,
    pid: u32,
    plan: &PinPlan,
) -> Result<()> {
    let dir = scope_dir(cgroup_root, internal_name);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create cgroup scope {}", dir.display()))?;

    let cpus = plan
        .selected_cores
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mems = plan
        .numa_nodes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",");

    fs::write(dir.join("cpuset.cpus"), &cpus)
        .with_context(|| format!("Failed to set cpuset.cpus for {}", internal_name))?;
    fs::write(dir.join("cpuset.mems"), &mems)
        .with_context(|| format!("Failed to set cpuset.mems for {}", internal_name))?;
    fs::write(dir.join("cgroup.procs"), pid.to_string())
        .with_context(|| format!("Failed to move pid {} into scope", pid))?;

    debug!(internal_name, pid, cpus = %cpus, mems = %mems, "CPU pinning applied");
    Ok(())
}

/// Remove an empty per-VM scope directory. Returns whether anything was
/// removed; a populated or missing scope is left alone.
pub fn reap_scope(cgroup_root: &Path, internal_name: &str) -> bool {
    let dir = scope_dir(cgroup_root, internal_name);
    match fs::remove_dir(&dir) {
        Ok(()) => {
            debug!(internal_name, "cgroup scope reaped");
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infinivirt_host::numa::{NumaNode, NumaTopology, plan_sequential};

    fn plan() -> PinPlan {
        let topo = NumaTopology {
            nodes: vec![NumaNode {
                id: 0,
                cpus: vec![0, 1, 2, 3],
            }],
        };
        plan_sequential(&topo, 2).unwrap()
    }

    #[test]
    fn test_apply_writes_cpuset_files() {
        let root = tempfile::tempdir().unwrap();
        apply_cpu_pinning(root.path(), "vm-abc123", 4242, &plan()).unwrap();

        let scope = root.path().join("vm-abc123.scope");
        assert_eq!(fs::read_to_string(scope.join("cpuset.cpus")).unwrap(), "0,1");
        assert_eq!(fs::read_to_string(scope.join("cpuset.mems")).unwrap(), "0");
        assert_eq!(fs::read_to_string(scope.join("cgroup.procs")).unwrap(), "4242");
    }

    #[test]
    fn test_reap_removes_only_empty_scope() {
        let root = tempfile::tempdir().unwrap();
        let scope = root.path().join("vm-abc123.scope");
        fs::create_dir_all(&scope).unwrap();
        assert!(reap_scope(root.path(), "vm-abc123"));
        assert!(!scope.exists());

        // Missing scope: nothing to do.
        assert!(!reap_scope(root.path(), "vm-abc123"));

        // Populated scope stays.
        fs::create_dir_all(&scope).unwrap();
        fs::write(scope.join("cpuset.cpus"), "0").unwrap();
        assert!(!reap_scope(root.path(), "vm-abc123"));
        assert!(scope.exists());
    }
}
