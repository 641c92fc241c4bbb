use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{generate_default_config, Settings};
use crate::core::{ChannelNotifier, CreateRequest, CreationManager, ShutdownMechanism, StateChange};
use crate::network::{MemoryPersistence, NetworkAllocator};

#[derive(Parser)]
#[command(name = "vm-provision")]
#[command(version = "0.1")]
#[command(about = "VM provisioning core: address pools, idempotent creation, backend tasks", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default/local configuration files
    #[arg(short, long, value_name = "CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List configured networks and their free entries
    Networks,

    /// Create instances and wait for the backend to report back
    Create {
        #[arg(short, long)]
        name: String,

        /// Root disk image
        #[arg(short, long)]
        image: String,

        #[arg(long, default_value_t = 1)]
        count: u16,

        #[arg(short, long, default_value_t = 256)]
        memory: u64,

        #[arg(short, long, default_value_t = 1)]
        vcpus: u32,

        /// Network to lease one NIC from; repeat for more NICs
        #[arg(long = "network")]
        networks: Vec<String>,

        /// Client token; a fresh one is generated when absent
        #[arg(short, long)]
        token: Option<String>,

        #[arg(long, default_value = "cli")]
        caller: String,

        /// Discard everything on shutdown
        #[arg(long)]
        trash: bool,

        /// Seconds to wait for backend state reports
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },

    /// Preview MAC addresses under the configured prefix
    Mac {
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },

    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub fn load_settings(config: Option<&std::path::Path>) -> anyhow::Result<Settings> {
    let settings = match config {
        Some(dir) => Settings::from_dir(&dir.display().to_string())?,
        None => Settings::new()?,
    };
    Ok(settings)
}

pub fn list_networks(settings: &Settings) -> anyhow::Result<()> {
    let allocator = NetworkAllocator::new(&settings.network, Arc::new(MemoryPersistence::new()))?;
    let names = allocator.get_association_names()?;
    if names.is_empty() {
        println!(
            "{} no networks under {}",
            "!".yellow(),
            settings.network.config_dir.display()
        );
        return Ok(());
    }

    println!("{}", "Networks:".bold());
    for name in names {
        let Some(association) = allocator.association(&name)? else {
            continue;
        };
        let free = association.free_count();
        let status = if free == 0 {
            "exhausted".red()
        } else {
            format!("{} free", free).green()
        };
        println!(
            "- {} ({} entries, dns {}) [{}]",
            name,
            association.entries.len(),
            association.dns.as_deref().unwrap_or("none"),
            status
        );
    }
    Ok(())
}

pub fn preview_macs(settings: &Settings, count: usize) -> anyhow::Result<()> {
    let allocator = NetworkAllocator::new(&settings.network, Arc::new(MemoryPersistence::new()))?;
    let mut taken: HashSet<String> = HashSet::new();
    for name in allocator.get_association_names()? {
        if let Some(association) = allocator.association(&name)? {
            taken.extend(association.entries.into_iter().filter_map(|e| e.mac));
        }
    }

    for _ in 0..count {
        let mac = allocator.mac_allocator().next_mac(&taken)?;
        println!("{}", mac);
        taken.insert(mac);
    }
    Ok(())
}

pub struct CreateArgs {
    pub name: String,
    pub image: String,
    pub count: u16,
    pub memory: u64,
    pub vcpus: u32,
    pub networks: Vec<String>,
    pub token: Option<String>,
    pub caller: String,
    pub trash: bool,
    pub wait: u64,
}

pub async fn create_instances(settings: &Settings, args: CreateArgs) -> anyhow::Result<()> {
    let (notifier, mut reports) = ChannelNotifier::new();
    let manager = CreationManager::new(
        settings,
        Arc::new(MemoryPersistence::new()),
        Arc::new(notifier),
    )?;

    let token = args.token.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut request = CreateRequest::new(args.name, args.image);
    request.count = args.count;
    request.memory_mb = args.memory;
    request.vcpus = args.vcpus;
    request.networks = args.networks;
    request.client_token = Some(token.clone());
    if args.trash {
        request.shutdown = ShutdownMechanism::Trash;
    }

    info!(caller = %args.caller, token = %token, "Submitting create request");
    let handles = manager.create(&args.caller, request).await?;
    println!("{} token {}", "✓".green(), token.bold());
    println!("{}", serde_json::to_string_pretty(&handles)?);

    let ids: HashSet<u64> = handles.iter().map(|h| h.id).collect();
    await_reports(&mut reports, ids, Duration::from_secs(args.wait)).await;
    Ok(())
}

async fn await_reports(
    reports: &mut UnboundedReceiver<StateChange>,
    mut pending: HashSet<u64>,
    wait: Duration,
) {
    let deadline = tokio::time::Instant::now() + wait;
    while !pending.is_empty() {
        let report = match tokio::time::timeout_at(deadline, reports.recv()).await {
            Ok(Some(report)) => report,
            Ok(None) => break,
            Err(_) => {
                warn!(outstanding = pending.len(), "Gave up waiting for backend reports");
                break;
            }
        };
        pending.remove(&report.vm_id);
        match report.error {
            None => println!("{} vm {} is {:?}", "✓".green(), report.vm_id, report.state),
            Some(e) => println!("{} vm {} is {:?}: {}", "✗".red(), report.vm_id, report.state, e),
        }
    }
}

pub fn init_config(dir: &std::path::Path, force: bool) -> anyhow::Result<()> {
    let target = dir.join("default.json");
    if target.exists() && !force {
        println!(
            "{} {} already exists. Use --force to overwrite.",
            "✗".red(),
            target.display()
        );
        return Ok(());
    }

    std::fs::create_dir_all(dir)?;
    let default_config = generate_default_config();
    std::fs::write(&target, serde_json::to_string_pretty(&default_config)?)?;

    println!("{} Default configuration written to {}", "✓".green(), target.display());
    Ok(())
}
