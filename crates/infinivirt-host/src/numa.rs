//! NUMA topology discovery and CPU-pin planning.
//!
//! Topology comes from sysfs; hosts without NUMA information get a single
//! synthetic node covering every CPU from `/proc/cpuinfo`. Plans select
//! physical cores for a VM's vCPUs either sequentially (proportional to
//! node size) or hybrid (seeded shuffle across all cores).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{info, warn};

const SYSFS_NODE_DIR: &str = "/sys/devices/system/node";
const PROC_CPUINFO: &str = "/proc/cpuinfo";

#[derive(Debug, Clone, Serialize)]
pub struct NumaNode {
    pub id: u32,
    pub cpus: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NumaTopology {
    pub nodes: Vec<NumaNode>,
}

impl NumaTopology {
    /// Discover host topology from the default sysfs/procfs locations.
    pub fn discover() -> Result<Self> {
        Self::discover_from(Path::new(SYSFS_NODE_DIR), Path::new(PROC_CPUINFO))
    }

    /// Discovery with explicit roots, for tests and containers.
    pub fn discover_from(node_dir: &Path, cpuinfo: &Path) -> Result<Self> {
        let mut nodes = Vec::new();

        if let Ok(entries) = fs::read_dir(node_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(id_str) = name.strip_prefix("node") else {
                    continue;
                };
                let Ok(id) = id_str.parse::<u32>() else {
                    continue;
                };
                let cpulist_path = entry.path().join("cpulist");
                let Ok(cpulist) = fs::read_to_string(&cpulist_path) else {
                    continue;
                };
                let cpus = parse_cpulist(cpulist.trim())?;
                if !cpus.is_empty() {
                    nodes.push(NumaNode { id, cpus });
                }
            }
        }

        if nodes.is_empty() {
            // No NUMA sysfs: synthesize one node over all CPUs.
            let count = count_processors(cpuinfo)?;
            warn!(cpus = count, "no NUMA sysfs, using single synthetic node");
            nodes.push(NumaNode {
                id: 0,
                cpus: (0..count).collect(),
            });
        }

        nodes.sort_by_key(|n| n.id);
        Ok(Self { nodes })
    }

    pub fn total_cpus(&self) -> usize {
        self.nodes.iter().map(|n| n.cpus.len()).sum()
    }
}

/// Parse a kernel cpulist like `0-3,5,8-9` into individual CPU indices.
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start.trim().parse().context("bad cpulist range start")?;
            let end: usize = end.trim().parse().context("bad cpulist range end")?;
            if end < start {
                bail!("inverted cpulist range: {}", part);
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(part.parse().context("bad cpulist entry")?);
        }
    }
    Ok(cpus)
}

fn count_processors(cpuinfo: &Path) -> Result<usize> {
    let content = fs::read_to_string(cpuinfo)
        .with_context(|| format!("Failed to read {}", cpuinfo.display()))?;
    let count = content
        .lines()
        .filter(|l| l.starts_with("processor"))
        .count();
    if count == 0 {
        bail!("no processors found in {}", cpuinfo.display());
    }
    Ok(count)
}

/// A computed vCPU→core assignment.
#[derive(Debug, Clone, Serialize)]
pub struct PinPlan {
    /// Sorted, deduplicated physical cores in the plan.
    pub selected_cores: Vec<usize>,
    /// NUMA nodes contributing cores.
    pub numa_nodes: Vec<u32>,
    /// `(vcpu, core)` pairs, one per vCPU.
    pub vcpu_to_core: Vec<(u32, usize)>,
    /// vCPUs grouped by the node their core belongs to.
    pub node_vcpus: BTreeMap<u32, Vec<u32>>,
}

impl PinPlan {
    /// Arguments for the NUMA wrapper tool.
    pub fn numactl_args(&self) -> Vec<String> {
        let cores = self
            .selected_cores
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let nodes = self
            .numa_nodes
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",");
        vec![
            format!("--physcpubind={}", cores),
            format!("--membind={}", nodes),
        ]
    }
}

/// Sequential plan: distribute vCPUs across nodes proportionally to each
/// node's share of physical CPUs, remainder to the last node. Within a node,
/// cores are taken in order, wrapping on overcommit.
pub fn plan_sequential(topology: &NumaTopology, vcpus: u32) -> Result<PinPlan> {
    let total = topology.total_cpus();
    if total == 0 || vcpus == 0 {
        bail!("cannot plan {} vcpus over {} cpus", vcpus, total);
    }

    let mut counts: Vec<u32> = Vec::with_capacity(topology.nodes.len());
    let mut assigned = 0u32;
    for (i, node) in topology.nodes.iter().enumerate() {
        let count = if i + 1 == topology.nodes.len() {
            vcpus - assigned
        } else {
            (vcpus as usize * node.cpus.len() / total) as u32
        };
        counts.push(count);
        assigned += count;
    }

    let mut plan = PinPlan {
        selected_cores: Vec::new(),
        numa_nodes: Vec::new(),
        vcpu_to_core: Vec::new(),
        node_vcpus: BTreeMap::new(),
    };

    let mut vcpu = 0u32;
    for (node, count) in topology.nodes.iter().zip(counts) {
        if count == 0 {
            continue;
        }
        plan.numa_nodes.push(node.id);
        for i in 0..count {
            let core = node.cpus[i as usize % node.cpus.len()];
            plan.vcpu_to_core.push((vcpu, core));
            plan.node_vcpus.entry(node.id).or_default().push(vcpu);
            plan.selected_cores.push(core);
            vcpu += 1;
        }
    }

    plan.selected_cores.sort_unstable();
    plan.selected_cores.dedup();
    Ok(plan)
}

/// Hybrid plan: flatten `(core, node)` pairs, Fisher–Yates shuffle with a
/// seedable PRNG, take the first `vcpus` entries. On overcommit the indices
/// wrap and every core ends up in use. A caller-supplied seed makes the
/// plan reproducible; otherwise one is generated and logged.
pub fn plan_hybrid(topology: &NumaTopology, vcpus: u32, seed: Option<u64>) -> Result<PinPlan> {
    let total = topology.total_cpus();
    if total == 0 || vcpus == 0 {
        bail!("cannot plan {} vcpus over {} cpus", vcpus, total);
    }

    let seed = seed.unwrap_or_else(|| {
        let generated = rand::random::<u64>();
        info!(seed = generated, "hybrid pin plan using generated seed");
        generated
    });

    let mut pairs: Vec<(usize, u32)> = topology
        .nodes
        .iter()
        .flat_map(|n| n.cpus.iter().map(|c| (*c, n.id)))
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    pairs.shuffle(&mut rng);

    let mut plan = PinPlan {
        selected_cores: Vec::new(),
        numa_nodes: Vec::new(),
        vcpu_to_core: Vec::new(),
        node_vcpus: BTreeMap::new(),
    };

    for vcpu in 0..vcpus {
        let (core, node) = pairs[vcpu as usize % pairs.len()];
        plan.vcpu_to_core.push((vcpu, core));
        plan.node_vcpus.entry(node).or_default().push(vcpu);
        plan.selected_cores.push(core);
        if !plan.numa_nodes.contains(&node) {
            plan.numa_nodes.push(node);
        }
    }

    plan.selected_cores.sort_unstable();
    plan.selected_cores.dedup();
    plan.numa_nodes.sort_unstable();
    Ok(plan)
}
