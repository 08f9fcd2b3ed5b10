//! ChunkVault - Persistent Chunk Storage Engine
//!
//! Offline administration tool: writes and checks configuration files and
//! inspects or sweeps an instance's storage while the instance is down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkvault::config::ChunkVaultConfig;
use chunkvault::replication::{QueueClass, SendError, Transport};
use chunkvault::storage::StorageEngine;

/// ChunkVault - Persistent Chunk Storage Engine
#[derive(Parser)]
#[command(name = "chunkvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "chunkvault.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "chunkvault.toml")]
        output: PathBuf,

        /// Instance ID
        #[arg(long, default_value_t = 0)]
        instance_id: u32,
    },

    /// Validate configuration file
    Validate,

    /// Show instance and storage information
    Info,

    /// List the chunk descriptors on disk
    Descriptors {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List the chunk map, version chains included
    ChunkMap {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Free stored versions of an array older than a horizon
    Sweep {
        /// Unversioned array id
        uaid: u64,

        /// Oldest version that must stay readable
        horizon: u64,
    },
}

/// Transport for offline use; nothing is ever delivered
struct Offline;

impl Transport for Offline {
    fn send_physical(&self, instance: u32, _payload: Bytes, _class: QueueClass) -> Result<(), SendError> {
        Err(SendError::Disconnected(format!(
            "instance {} unreachable from the admin tool",
            instance
        )))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Init { output, instance_id } => run_init(output, instance_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Descriptors { json } => run_descriptors(cli.config, json),
        Commands::ChunkMap { json } => run_chunk_map(cli.config, json),
        Commands::Sweep { uaid, horizon } => run_sweep(cli.config, uaid, horizon),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_engine(config_path: &Path) -> anyhow::Result<StorageEngine> {
    let config = ChunkVaultConfig::from_file(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    let data_dir = config.data_dir().clone();
    StorageEngine::open(config, Arc::new(Offline))
        .with_context(|| format!("failed to open storage in {}", data_dir.display()))
}

/// Initialize configuration file
fn run_init(output: PathBuf, instance_id: u32) -> anyhow::Result<()> {
    let config_content = format!(
        r#"# ChunkVault Configuration
# Generated configuration file

[node]
instance_id = {instance_id}
data_dir = "/var/lib/chunkvault/instance-{instance_id}"

[cluster]
instances = {instances}
redundancy = 0

[cache]
# 0 = auto-tune from installed memory
size_mb = 0
# tolerate | block | fail
overflow = "tolerate"

[delta]
enabled = true

[compression]
# none | lz4
method = "lz4"

[replication]
poll_interval_ms = 100

[logging]
level = "info"
"#,
        instances = instance_id + 1
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to describe your cluster and cache settings.");
    println!("Then check it with: chunkvault --config {} validate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match ChunkVaultConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Instance:   {} of {}", config.node.instance_id, config.cluster.instances);
            println!("  Redundancy: {}", config.cluster.redundancy);
            println!("  Cache:      {} MB", config.cache_bytes() / (1024 * 1024));
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show instance information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let engine = open_engine(&config_path)?;
    let config = engine.config();
    let descriptors = engine.list_chunk_descriptors()?;
    let stats = engine.stats()?;
    let tombstones = descriptors.iter().filter(|d| d.header.is_tombstone()).count();
    let stored: u64 = descriptors.iter().map(|d| d.header.compressed_size).sum();

    println!("ChunkVault Instance Information");
    println!("===============================");
    println!();
    println!("Instance ID:      {}", engine.instance_id());
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Cluster Configuration:");
    println!("  Instances:      {}", config.cluster.instances);
    println!("  Redundancy:     {}", config.cluster.redundancy);
    println!();
    println!("Cache Configuration:");
    println!("  Ceiling:        {} MB", stats.ceiling / (1024 * 1024));
    println!("  Overflow:       {:?}", config.cache.overflow);
    println!("  Delta Storage:  {}", config.delta.enabled);
    println!("  Compression:    {:?}", config.compression.method);
    println!();
    println!("Storage:");
    println!("  Descriptors:    {}", descriptors.len());
    println!("  Tombstones:     {}", tombstones);
    println!("  Chunks:         {}", stats.chunks);
    println!("  Stored Bytes:   {}", stored);

    engine.close()?;
    Ok(())
}

/// Dump the descriptor table
fn run_descriptors(config_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let engine = open_engine(&config_path)?;
    let descriptors = engine.list_chunk_descriptors()?;

    if json {
        let rows: Vec<_> = descriptors
            .iter()
            .map(|d| {
                serde_json::json!({
                    "address": d.address(),
                    "hdr_pos": d.header.pos.hdr_pos,
                    "offs": d.header.pos.offs,
                    "version": d.header.arr_id,
                    "flags": d.header.flags.bits(),
                    "compression": d.header.compression_method,
                    "compressed_size": d.header.compressed_size,
                    "size": d.header.size,
                    "allocated_size": d.header.allocated_size,
                    "n_elems": d.header.n_elems,
                    "instance_id": d.header.instance_id,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!(
            "{:>8} {:>6} {:>4} {:<20} {:>8} {:>10} {:>10} {:>6}",
            "HDR_POS", "UAID", "ATT", "COORDS", "VERSION", "SIZE", "STORED", "FLAGS"
        );
        for d in &descriptors {
            println!(
                "{:>8} {:>6} {:>4} {:<20} {:>8} {:>10} {:>10} {:>6}",
                d.header.pos.hdr_pos,
                d.header.pos.ds_guid,
                d.header.att_id,
                format!("{:?}", d.coords),
                d.header.arr_id,
                d.header.size,
                d.header.compressed_size,
                format!("{:?}", d.header.flags),
            );
        }
    }

    engine.close()?;
    Ok(())
}

/// Dump the chunk map
fn run_chunk_map(config_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let engine = open_engine(&config_path)?;
    let entries = engine.list_chunk_map()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            let indent = "  ".repeat(entry.depth);
            if entry.tombstone {
                println!("{}{} deleted at version {}", indent, entry.address, entry.version);
            } else {
                println!(
                    "{}{} version {} ({} bytes, {} stored)",
                    indent, entry.address, entry.version, entry.size, entry.compressed_size
                );
            }
        }
    }

    engine.close()?;
    Ok(())
}

/// Free versions no reader at or after `horizon` can reach
fn run_sweep(config_path: PathBuf, uaid: u64, horizon: u64) -> anyhow::Result<()> {
    let engine = open_engine(&config_path)?;
    let freed = engine
        .remove_versions(uaid, horizon)
        .with_context(|| format!("sweep of array {} failed", uaid))?;
    println!("Freed {} stored versions of array {}", freed, uaid);
    engine.close()?;
    Ok(())
}
