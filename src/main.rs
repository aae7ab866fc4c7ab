//! Binary entrypoint for the meshdir CLI.
//!
//! Commands:
//! - `init` - create a starter `meshdir.toml`
//! - `directories` - list persisted node directories
//! - `nodes <identity-key> [--include-self]` - list the nodes of one directory
//! - `forget <identity-key>` - drop a directory
//! - `prune <identity-key> --max-age-hours <n>` - drop nodes not heard recently
//! - `status` - registry summary and counters
//!
//! See the library crate docs for module-level details: `meshdir::`.
use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use std::sync::Arc;

use meshdir::config::Config;
use meshdir::logutil::{escape_log, node_label};
use meshdir::metrics;
use meshdir::nodedb::{NodeDirectory, NodeDirectoryRegistry, NodeInfo, RegistryConfig};
use meshdir::storage::{PersistentStorage, SledStore};

#[derive(Parser)]
#[command(name = "meshdir")]
#[command(about = "Inspect and maintain persisted Meshtastic node directories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshdir.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// List persisted node directories
    Directories,
    /// List the nodes of one directory
    Nodes {
        /// Directory identity key
        identity_key: u32,
        /// Also list the device's own node
        #[arg(long)]
        include_self: bool,
    },
    /// Remove a directory
    Forget {
        /// Directory identity key
        identity_key: u32,
    },
    /// Remove nodes that have not been heard from recently
    Prune {
        /// Directory identity key
        identity_key: u32,
        /// Maximum age of the last reception
        #[arg(long, default_value_t = 24 * 7)]
        max_age_hours: i64,
    },
    /// Show registry summary and counters
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        info!("Initializing new meshdir configuration");
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    // Missing config file falls back to defaults so the CLI works out of the box.
    let config = match Config::load(&cli.config).await {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("{} (using defaults)", e);
            None
        }
    };
    init_logging(&config, cli.verbose);
    let config = config.unwrap_or_default();
    let registry = open_registry(&config).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Directories => {
            let directories = registry.get_directories();
            if directories.is_empty() {
                println!("No node directories stored in {}", config.storage.data_dir);
            }
            for dir in directories {
                let my_node = dir
                    .my_node_num()?
                    .map(node_label)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>10}  device {}  {} nodes  {} errors",
                    dir.identity_key(),
                    my_node,
                    dir.get_nodes_length()?,
                    dir.error_count()?
                );
            }
        }
        Commands::Nodes {
            identity_key,
            include_self,
        } => {
            let dir = find_directory(&registry, identity_key)?;
            let mut nodes = dir.get_nodes()?;
            if include_self {
                if let Some(me) = dir.get_my_node()? {
                    nodes.insert(0, me);
                }
            }
            for node in &nodes {
                print_node(&dir, node)?;
            }
            println!("{} nodes", nodes.len());
        }
        Commands::Forget { identity_key } => {
            if !registry.remove_directory(identity_key) {
                bail!("No node directory with identity key {}", identity_key);
            }
            persist(registry).await?;
            println!("Removed node directory {}", identity_key);
        }
        Commands::Prune {
            identity_key,
            max_age_hours,
        } => {
            let cutoff = max_age(max_age_hours)?;
            let dir = find_directory(&registry, identity_key)?;
            let removed = dir.prune_stale_nodes(cutoff)?;
            persist(registry).await?;
            println!(
                "Pruned {} nodes not heard in {}h from directory {}",
                removed, max_age_hours, identity_key
            );
        }
        Commands::Status => {
            println!("meshdir v{}", env!("CARGO_PKG_VERSION"));
            println!("Data directory: {}", config.storage.data_dir);
            println!(
                "Directories: {}/{}",
                registry.len(),
                registry.capacity()
            );
            let total: usize = registry
                .get_directories()
                .iter()
                .map(|d| d.get_nodes_length().unwrap_or(0))
                .sum();
            println!("Nodes: {}", total);
            let m = metrics::snapshot();
            println!(
                "Persistence: {} writes, {} failures",
                m.persist_written, m.persist_failed
            );
            println!(
                "Directories evicted: {}, merged: {}",
                m.directories_evicted, m.directories_merged
            );
        }
    }

    Ok(())
}

async fn open_registry(config: &Config) -> Result<NodeDirectoryRegistry> {
    debug!("Opening sled store at {}", config.storage.data_dir);
    let store = Arc::new(SledStore::open(&config.storage.data_dir)?);
    let storage = PersistentStorage::new(store, config.registry.schema_version);
    Ok(NodeDirectoryRegistry::open(storage, RegistryConfig::from(config)).await)
}

fn find_directory(registry: &NodeDirectoryRegistry, identity_key: u32) -> Result<NodeDirectory> {
    registry
        .get_directory(identity_key)
        .ok_or_else(|| anyhow!("No node directory with identity key {}", identity_key))
}

fn max_age(hours: i64) -> Result<chrono::Duration> {
    if hours < 0 {
        bail!("--max-age-hours must not be negative");
    }
    chrono::Duration::try_hours(hours)
        .ok_or_else(|| anyhow!("--max-age-hours {} is out of range", hours))
}

async fn persist(registry: NodeDirectoryRegistry) -> Result<()> {
    if !registry.close().await {
        bail!("Failed to write node directories (see log)");
    }
    Ok(())
}

fn print_node(dir: &NodeDirectory, node: &NodeInfo) -> Result<()> {
    let name = node
        .long_name()
        .map(escape_log)
        .unwrap_or_else(|| "-".to_string());
    let heard = if node.last_heard == 0 {
        "never".to_string()
    } else {
        chrono::DateTime::from_timestamp(i64::from(node.last_heard), 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| node.last_heard.to_string())
    };
    let mut flags = String::new();
    if node.is_favorite {
        flags.push('*');
    }
    if node.is_ignored {
        flags.push('x');
    }
    if let Some(err) = dir.get_node_error(node.num)? {
        flags.push('!');
        debug!("{}: {}", node_label(node.num), escape_log(&err.error));
    }
    let hops = node
        .hops_away
        .map(|h| h.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "{} {:<3} {:<24} snr {:>6.2}  hops {:>2}  heard {}",
        node_label(node.num),
        flags,
        name,
        node.snr,
        hops,
        heard
    );
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_age_accepts_normal_values() {
        assert_eq!(max_age(0).unwrap(), chrono::Duration::zero());
        assert_eq!(max_age(24 * 7).unwrap(), chrono::Duration::days(7));
    }

    #[test]
    fn max_age_rejects_negative_and_huge_values() {
        assert!(max_age(-1).is_err());
        let err = max_age(i64::MAX).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(max_age(3_000_000_000_000_000).is_err());
    }
}
