use std::io::Read;

use anyhow::Result;
use clap::{Parser, Subcommand};

use infinivirt::core::firewall::FirewallRule;
use infinivirt::core::observability::{self, LogFormat};
use infinivirt::core::paths::HostPaths;
use infinivirt::core::{mac, naming};
use infinivirt::host::filter::{FilterService, translate};
use infinivirt::host::numa;

#[derive(Parser)]
#[command(
    name = "infinivirt",
    version,
    about = "Host-side VM control plane: diagnostics and host-state tooling"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the deterministic MAC address for a VM id
    Mac { vm_id: String },
    /// Print the derived TAP device and filter chain names for a VM id
    Names { vm_id: String },
    /// Generate a fresh VM id
    NewId,
    /// NUMA topology and CPU-pin planning
    Numa {
        #[command(subcommand)]
        command: NumaCommands,
    },
    /// Packet-filter table diagnostics
    Filter {
        #[command(subcommand)]
        command: FilterCommands,
    },
    /// Translate a firewall rule (JSON on stdin) into filter tokens
    TranslateRule {
        /// TAP device the rule applies to
        #[arg(long, default_value = "vnet-demo")]
        tap: String,
    },
}

#[derive(Subcommand)]
enum NumaCommands {
    /// Show the discovered host topology
    Topology,
    /// Compute a CPU-pin plan
    Plan {
        #[arg(long)]
        vcpus: u32,
        /// Shuffle cores across nodes instead of filling sequentially
        #[arg(long)]
        hybrid: bool,
        /// Seed for a reproducible hybrid plan
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Subcommand)]
enum FilterCommands {
    /// Create the table and base chain if absent
    Init,
    /// List chains in the packet-filter table
    ListChains,
    /// Reload the persisted ruleset into the kernel
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init(LogFormat::Human);
    let cli = Cli::parse();

    match cli.command {
        Commands::Mac { vm_id } => {
            println!("{}", mac::derive_mac(&vm_id));
            Ok(())
        }
        Commands::Names { vm_id } => {
            println!("tap:   {}", naming::tap_name(&vm_id));
            println!("chain: {}", naming::chain_name(&vm_id));
            Ok(())
        }
        Commands::NewId => {
            println!("{}", uuid::Uuid::new_v4().simple());
            Ok(())
        }
        Commands::Numa { command } => cmd_numa(command),
        Commands::Filter { command } => cmd_filter(command).await,
        Commands::TranslateRule { tap } => cmd_translate_rule(&tap),
    }
}

fn cmd_numa(command: NumaCommands) -> Result<()> {
    let topology = numa::NumaTopology::discover()?;
    match command {
        NumaCommands::Topology => {
            println!("{}", serde_json::to_string_pretty(&topology)?);
        }
        NumaCommands::Plan {
            vcpus,
            hybrid,
            seed,
        } => {
            let plan = if hybrid {
                numa::plan_hybrid(&topology, vcpus, seed)?
            } else {
                numa::plan_sequential(&topology, vcpus)?
            };
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }
    Ok(())
}

async fn cmd_filter(command: FilterCommands) -> Result<()> {
    let service = FilterService::new(HostPaths::default().filter_persist_path());
    match command {
        FilterCommands::Init => {
            service.initialize().await?;
            println!("table and base chain ensured");
        }
        FilterCommands::ListChains => {
            for chain in service.list_chains().await? {
                println!("{}", chain);
            }
        }
        FilterCommands::Reload => {
            service.reload_persisted().await?;
            println!("persisted ruleset reloaded");
        }
    }
    Ok(())
}

fn cmd_translate_rule(tap: &str) -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let rule: FirewallRule = serde_json::from_str(&input)?;
    let tokens = translate::translate(&rule, tap).map_err(|e| anyhow::anyhow!("{}", e))?;
    println!("{}", tokens.join(" "));
    Ok(())
}
