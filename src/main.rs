//! p2pnode
//!
//! Runs the peer-to-peer layer on its own and manages keys in the keystore.

use blockchain_p2p::config::P2PConfig;
use blockchain_p2p::crypto::NodeKey;
use blockchain_p2p::keystore::Hsm;
use blockchain_p2p::network::addrbook::{spawn_saver, AddrBook};
use blockchain_p2p::network::discover::{DiscoverConfig, Network, Node};
use blockchain_p2p::network::node_info::{major_version_compatible, NodeInfo, ServiceFlags};
use blockchain_p2p::network::pex::PexReactor;
use blockchain_p2p::network::switch::Switch;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

const KEYSTORE_DIR: &str = "keystore";

#[derive(Parser)]
#[command(name = "p2pnode")]
#[command(version = "0.1.0")]
#[command(about = "Blockchain peer-to-peer node", long_about = None)]
struct Cli {
    /// Data directory for keys, the address book and the ban list
    #[arg(short, long, default_value = blockchain_p2p::config::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the p2p node until Ctrl-C
    Run(RunArgs),

    /// Keystore operations
    Key {
        #[command(subcommand)]
        action: KeyCommands,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// TCP address to accept peers on
    #[arg(long, default_value = blockchain_p2p::config::DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// UDP address for node discovery
    #[arg(long)]
    discovery_listen: Option<String>,

    /// Seed peers (comma-separated host:port)
    #[arg(long, default_value = "")]
    seeds: String,

    /// Discovery bootnodes (comma-separated id@ip:port)
    #[arg(long, default_value = "")]
    bootnodes: String,

    #[arg(long, default_value = "mainnet")]
    chain_id: String,

    #[arg(long, default_value = "50")]
    max_peers: usize,

    #[arg(long, default_value = "p2pnode")]
    moniker: String,

    /// Disable peer exchange
    #[arg(long)]
    no_pex: bool,

    /// Disable UDP node discovery
    #[arg(long)]
    no_discovery: bool,

    /// Try to map the listen port on the gateway
    #[arg(long)]
    upnp: bool,
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Create a new key
    Create {
        #[arg(short, long)]
        alias: String,

        #[arg(short, long)]
        password: String,
    },

    /// List stored keys
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_node(args, cli.data_dir))
        }
        Commands::Key { action } => run_key_command(action, &cli.data_dir),
    }
}

fn run_key_command(action: KeyCommands, data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let hsm = Hsm::new(data_dir.join(KEYSTORE_DIR));
    match action {
        KeyCommands::Create { alias, password } => {
            let info = hsm.xcreate(&alias, &password)?;
            println!("Created key '{}'", info.alias);
            println!("  xpub: {}", info.xpub);
            println!("  file: {}", info.file.display());
        }
        KeyCommands::List => {
            let keys = hsm.list_keys();
            if keys.is_empty() {
                println!("No keys in {}", hsm.key_dir().display());
            }
            for info in keys {
                println!("{:<20} {}", info.alias, info.xpub);
            }
        }
    }
    hsm.close();
    Ok(())
}

async fn run_node(args: RunArgs, data_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = P2PConfig {
        listen_addr: args.listen.clone(),
        seeds: args.seeds,
        skip_upnp: !args.upnp,
        max_num_peers: args.max_peers,
        pex_enable: !args.no_pex,
        chain_id: args.chain_id,
        moniker: args.moniker,
        data_dir,
        discovery_listen_addr: args.discovery_listen.unwrap_or(args.listen),
        discovery_enable: !args.no_discovery,
        ..P2PConfig::default()
    };

    let node_key = NodeKey::load_or_generate(&config.node_key, &config.node_key_path())?;
    let book = AddrBook::open(config.addr_book_path(), config.addrbook_strict)?.into_shared();
    let (saver_quit, saver_quit_rx) = watch::channel(false);
    let saver = spawn_saver(book.clone(), saver_quit_rx);

    let discv = if config.pex_enable && config.discovery_enable {
        let bootnodes = args
            .bootnodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<Node>)
            .collect::<Result<Vec<_>, _>>()?;
        let tcp_port = config
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map(|a| a.port())
            .unwrap_or(0);
        let discover_config = DiscoverConfig {
            listen_addr: config.discovery_listen_addr.clone(),
            chain_id: config.chain_id.clone(),
            bootnodes,
            tcp_port,
            ..DiscoverConfig::default()
        };
        Some(Network::listen(node_key.clone(), discover_config).await?)
    } else {
        None
    };

    let info = NodeInfo {
        pub_key: node_key.pub_key(),
        moniker: config.moniker.clone(),
        network: config.chain_id.clone(),
        listen_addr: String::new(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        genesis_hash: String::new(),
        best_height: 0,
        best_hash: String::new(),
        service_flags: ServiceFlags::FULL_NODE,
        other: Vec::new(),
    };
    let seeds = config.seed_list();
    let pex_enable = config.pex_enable;
    let switch = Switch::new(config, node_key, info, book.clone(), major_version_compatible)?;
    if pex_enable {
        switch.add_reactor("pex", Arc::new(PexReactor::new(book.clone(), discv.clone())))?;
    }
    switch.start().await?;
    if let Err(e) = switch.dial_seeds(&seeds).await {
        log::warn!("Seed dialing failed: {}", e);
    }

    println!("Node {} listening on {:?}", switch.pub_key(), switch.listen_address());
    tokio::signal::ctrl_c().await?;
    println!("Shutting down node...");

    switch.stop().await;
    if let Some(discv) = discv {
        discv.close();
    }
    saver_quit.send_replace(true);
    let _ = saver.await;
    Ok(())
}
