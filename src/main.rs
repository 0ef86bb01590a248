//! Mini-P2P node
//!
//! Runs the networking core as a standalone node and manages its
//! persisted ban list.

use clap::{Parser, Subcommand};
use mini_p2p::net::{BanManager, BanReason, JsonBanStorage, NetConfig, Network, SubNet};
use mini_p2p::node::{ConnectionDirection, ConnectionManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How often the running node logs a status line
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "p2pnode")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer networking core of a Bitcoin-style node", long_about = None)]
struct Cli {
    /// JSON configuration file; command line options override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for the ban list and address table
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network: main, test or regtest
    #[arg(short, long)]
    network: Option<Network>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until interrupted
    Start {
        /// Address to listen on (repeatable)
        #[arg(short, long)]
        bind: Vec<SocketAddr>,

        /// Connect only to these nodes (repeatable)
        #[arg(long)]
        connect: Vec<String>,

        /// Keep a connection to this node open (repeatable)
        #[arg(long)]
        addnode: Vec<String>,

        /// Whitelist a subnet or address (repeatable)
        #[arg(long)]
        whitelist: Vec<SubNet>,

        /// Maximum number of connections
        #[arg(long)]
        max_connections: Option<usize>,

        /// Outbound upload target in MiB per cycle (0 = unlimited)
        #[arg(long)]
        max_upload_target: Option<u64>,

        /// Do not accept inbound connections
        #[arg(long)]
        no_listen: bool,

        /// Do not query DNS seeds
        #[arg(long)]
        no_dnsseed: bool,

        /// DNS seed to query (repeatable)
        #[arg(long)]
        seed: Vec<String>,
    },

    /// Print the effective configuration as JSON
    Config,

    /// Ban list management
    Bans {
        #[command(subcommand)]
        action: BanCommands,
    },
}

#[derive(Subcommand)]
enum BanCommands {
    /// List banned subnets
    List,

    /// Ban a subnet or address
    Add {
        subnet: SubNet,

        /// Ban duration in seconds (default: configured ban time)
        #[arg(short, long)]
        duration: Option<i64>,
    },

    /// Remove a ban
    Remove { subnet: SubNet },

    /// Remove every ban
    Clear,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NetConfig::load(path)?,
        None => NetConfig::default(),
    };
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }

    match cli.command {
        Commands::Start {
            bind,
            connect,
            addnode,
            whitelist,
            max_connections,
            max_upload_target,
            no_listen,
            no_dnsseed,
            seed,
        } => {
            if !bind.is_empty() {
                config.bind = bind;
            }
            config.connect_only.extend(connect);
            config.added_nodes.extend(addnode);
            config.whitelist.extend(whitelist);
            config.dns_seeds.extend(seed);
            if let Some(max) = max_connections {
                config.max_connections = max;
            }
            if let Some(mib) = max_upload_target {
                config.max_outbound_target = mib * 1024 * 1024;
            }
            if no_listen {
                config.listen = false;
            }
            if no_dnsseed {
                config.dns_seed = false;
            }
            config.validate()?;
            run_node(config)?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Bans { action } => {
            run_ban_command(action, &config)?;
        }
    }

    Ok(())
}

fn run_node(config: NetConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConnectionManager::new(config)?;
    let mut events = manager
        .take_events()
        .ok_or("event channel already taken")?;
    manager.start()?;

    for addr in manager.local_addrs() {
        println!("🌐 Listening on {}", addr);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let mut status = tokio::time::interval(STATUS_INTERVAL);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("\n📴 Shutting down node...");
                    break;
                }
                Some(event) = events.recv() => {
                    log::debug!("event: {:?}", event);
                }
                _ = status.tick() => {
                    let totals = manager.get_totals();
                    log::info!(
                        "peers: {} in / {} out, sent {} bytes, received {} bytes",
                        manager.get_node_count(ConnectionDirection::Inbound),
                        manager.get_node_count(ConnectionDirection::Outbound),
                        totals.total_bytes_sent,
                        totals.total_bytes_recv
                    );
                }
            }
        }
    });

    manager.stop();
    Ok(())
}

fn run_ban_command(action: BanCommands, config: &NetConfig) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let storage = JsonBanStorage::new(config.banlist_path());
    let bans = BanManager::new(Box::new(storage), config.whitelist.clone(), config.ban_time_secs)?;

    match action {
        BanCommands::List => {
            let list = bans.list_banned();
            if list.is_empty() {
                println!("No banned subnets");
            }
            for (subnet, entry) in list {
                let until = chrono::DateTime::from_timestamp(entry.ban_until, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| entry.ban_until.to_string());
                println!("{:<40} until {} ({})", subnet.to_string(), until, entry.reason);
            }
        }
        BanCommands::Add { subnet, duration } => {
            bans.ban(subnet, BanReason::ManuallyAdded, duration, false)?;
            println!("✅ Banned {}", subnet);
        }
        BanCommands::Remove { subnet } => {
            if bans.unban(&subnet)? {
                println!("✅ Unbanned {}", subnet);
            } else {
                println!("⚠️  {} was not banned", subnet);
            }
        }
        BanCommands::Clear => {
            bans.clear_banned()?;
            println!("✅ Ban list cleared");
        }
    }
    Ok(())
}
