//! Archipel CLI - LAN peer discovery and encrypted sessions

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use archipel_core::identity::{DEFAULT_KEY_DIR, PUBLIC_KEY_FILE};
use archipel_core::{IdentityKeyPair, NodeIdentity};
use archipel_network::config::DEFAULT_TCP_PORT;
use archipel_network::{
    Announcement, BeaconProfile, ConnectionEvent, DiscoveryBeacon, DiscoveryConfig, Node,
    NodeConfig, PeerRecord, PeerTable, Shutdown,
};

const DEFAULT_LOG_FILTER: &str = "info";

/// Archipel - serverless LAN peer discovery and encrypted messaging
#[derive(Parser)]
#[command(name = "archipel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the node key files
    #[arg(long, env = "ARCHIPEL_KEYS_DIR", default_value = DEFAULT_KEY_DIR)]
    keys_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the node identity key pair
    Keygen {
        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },

    /// Print this node's id
    Id,

    /// Run the discovery beacon only and print the peers found
    Discover {
        #[command(flatten)]
        network: NetworkArgs,

        /// Announce and listen for about one second, then exit
        #[arg(long)]
        once: bool,

        /// Stop after this many seconds
        #[arg(long, env = "ARCHIPEL_DURATION")]
        duration: Option<u64>,
    },

    /// Run a full node with an interactive shell
    Run {
        #[command(flatten)]
        network: NetworkArgs,
    },
}

#[derive(Args)]
struct NetworkArgs {
    /// Announcement wire format (json or hello)
    #[arg(long, env = "ARCHIPEL_PROFILE", default_value = "json")]
    profile: BeaconProfile,

    /// Multicast group (defaults to the profile's group)
    #[arg(long, env = "ARCHIPEL_GROUP")]
    group: Option<Ipv4Addr>,

    /// Multicast port (defaults to the profile's port)
    #[arg(long, env = "ARCHIPEL_MPORT")]
    mport: Option<u16>,

    /// Local interface address used for multicast
    #[arg(long, env = "ARCHIPEL_IFACE", default_value = "0.0.0.0")]
    iface: Ipv4Addr,

    /// TCP port to accept sessions on
    #[arg(long, env = "ARCHIPEL_TCP_PORT", default_value_t = DEFAULT_TCP_PORT)]
    tcp_port: u16,

    /// Seconds between announcements
    #[arg(long, env = "ARCHIPEL_INTERVAL", default_value = "2")]
    interval: u64,

    /// Seconds without an announcement before a peer is dropped
    #[arg(long, env = "ARCHIPEL_TTL", default_value = "60")]
    ttl: u64,

    /// Display name announced to peers
    #[arg(short, long, env = "ARCHIPEL_NAME", default_value = "archipel-node")]
    name: String,
}

impl NetworkArgs {
    fn discovery_config(&self) -> DiscoveryConfig {
        let base = match self.profile {
            BeaconProfile::Json => DiscoveryConfig::default(),
            BeaconProfile::Hello => DiscoveryConfig::hello_profile(),
        };
        DiscoveryConfig {
            group: self.group.unwrap_or(base.group),
            port: self.mport.unwrap_or(base.port),
            iface: self.iface,
            interval: Duration::from_secs(self.interval),
            peer_ttl: Duration::from_secs(self.ttl),
            ..base
        }
    }

    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            name: self.name.clone(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.tcp_port)),
            discovery: self.discovery_config(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { force } => cmd_keygen(&cli.keys_dir, force)?,
        Commands::Id => cmd_id(&cli.keys_dir)?,
        Commands::Discover {
            network,
            once,
            duration,
        } => cmd_discover(&cli.keys_dir, &network, once, duration).await?,
        Commands::Run { network } => cmd_run(&cli.keys_dir, &network).await?,
    }

    Ok(())
}

/// `RUST_LOG` when set and valid, `info` otherwise
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn load_identity(keys_dir: &Path) -> Result<NodeIdentity> {
    NodeIdentity::load_from_dir(keys_dir).with_context(|| {
        format!(
            "No node identity in {}. Run 'archipel keygen' first.",
            keys_dir.display()
        )
    })
}

fn cmd_keygen(keys_dir: &Path, force: bool) -> Result<()> {
    if keys_dir.join(PUBLIC_KEY_FILE).exists() && !force {
        anyhow::bail!(
            "Key files already exist in {}. Use --force to replace them.",
            keys_dir.display()
        );
    }

    let keypair = IdentityKeyPair::generate();
    let (public_path, private_path) = keypair
        .write_pem(keys_dir)
        .context("Failed to write key files")?;

    println!("✓ Identity created.\n");
    println!("Public key:  {}", public_path.display());
    println!("Private key: {}", private_path.display());
    println!("Node id:     {}", keypair.node_identity()?);

    Ok(())
}

fn cmd_id(keys_dir: &Path) -> Result<()> {
    let identity = load_identity(keys_dir)?;
    println!("{}", identity);
    Ok(())
}

async fn cmd_discover(
    keys_dir: &Path,
    network: &NetworkArgs,
    once: bool,
    duration: Option<u64>,
) -> Result<()> {
    let config = network.discovery_config();
    config.validate()?;
    let name = announced_name(config.profile, &network.name, keys_dir)?;

    let shutdown = Shutdown::new();
    let peers = PeerTable::new();
    let beacon = DiscoveryBeacon::new(
        config,
        Announcement::new(name, network.tcp_port),
        peers.clone(),
        shutdown.clone(),
    );

    spawn_ctrl_c(shutdown);
    beacon
        .run_for(once, duration.map(Duration::from_secs))
        .await;

    print_peers(&peers.snapshot().await);
    Ok(())
}

/// Name carried by a beacon-only run. Only the HELLO profile announces the
/// node id, so only it needs the key files.
fn announced_name(profile: BeaconProfile, display_name: &str, keys_dir: &Path) -> Result<String> {
    match profile {
        BeaconProfile::Json => Ok(display_name.to_string()),
        BeaconProfile::Hello => Ok(load_identity(keys_dir)?.to_hex()),
    }
}

async fn cmd_run(keys_dir: &Path, network: &NetworkArgs) -> Result<()> {
    let identity = load_identity(keys_dir)?;
    let mut node = Node::new(network.node_config(), identity)?;

    let mut events = node
        .take_event_receiver()
        .context("Event receiver already taken")?;
    let local_addr = node.start().await?;

    println!("Node {} listening on {}", identity, local_addr);
    println!("Commands: peers | connections | connect <peer> | send <peer> <text> | quit");

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected {
                    peer_id, inbound, ..
                } => {
                    let direction = if inbound { "from" } else { "to" };
                    println!("* connected {} {}", direction, peer_id);
                }
                ConnectionEvent::Message { peer_id, payload } => {
                    println!("[{}] {}", peer_id, String::from_utf8_lossy(&payload));
                }
                ConnectionEvent::Disconnected { peer_id } => {
                    println!("* disconnected {}", peer_id);
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        if !handle_command(&node, line.trim()).await {
            break;
        }
    }

    node.stop().await;
    Ok(())
}

/// Execute one shell command. Returns `false` when the shell should exit.
async fn handle_command(node: &Node, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(""), _, _) => {}
        (Some("peers"), None, None) => print_peers(&node.peers().await),
        (Some("connections"), None, None) => {
            let connections = node.connected_peers().await;
            if connections.is_empty() {
                println!("No active connections.");
            }
            for (peer_id, addr) in connections {
                println!("{} ({})", peer_id, addr);
            }
        }
        (Some("connect"), Some(peer), None) => match node.connect_to_peer(peer).await {
            Ok(()) => println!("✓ Connected to {}", peer),
            Err(e) => println!("Connect failed: {}", e),
        },
        (Some("send"), Some(peer), Some(text)) => {
            if let Err(e) = node.send(peer, text.as_bytes()).await {
                println!("Send failed: {}", e);
            }
        }
        (Some("quit"), None, None) | (Some("exit"), None, None) => return false,
        _ => println!("Unknown command: {}", line),
    }
    true
}

fn print_peers(peers: &[PeerRecord]) {
    if peers.is_empty() {
        println!("No peers discovered.");
        return;
    }

    println!("Peers");
    println!("=====");
    for peer in peers {
        println!(
            "{:<22} {:<20} seen {}s ago",
            peer.key,
            peer.display_name,
            peer.age().as_secs()
        );
    }
}

fn spawn_ctrl_c(shutdown: Shutdown) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.trigger();
        }
    });
}
