use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use shardkv::config::ClusterConfig;
use shardkv::transport::UdpTransport;
use shardkv::{Node, Result, ShardError};

const DEFAULT_BASE_PORT: u16 = 9300;
const DEFAULT_WORKERS: usize = 4;

/// Keys pre-loaded into each node's owned shards at startup.
const SEED_KEYS: u64 = 100_000;
const SEED_VALUE: &[u8] = b"0";

#[derive(Parser)]
#[command(name = "shardkv-server", version, about = "A sharded replicated key-value store node")]
struct Cli {
    /// This node's id within the cluster
    #[arg(long, value_name = "ID")]
    machine_id: u8,

    /// IPv4 host of every node, in node-id order (this node included)
    #[arg(long, value_name = "HOST", value_delimiter = ',', required = true)]
    peers: Vec<Ipv4Addr>,

    /// First UDP port of the per-worker port range
    #[arg(long, default_value_t = DEFAULT_BASE_PORT, value_name = "PORT")]
    base_port: u16,

    /// Worker threads on this node
    #[arg(long, default_value_t = DEFAULT_WORKERS, value_name = "COUNT")]
    workers: usize,

    /// Cache and store sizing, as a JSON ClusterConfig file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if usize::from(cli.machine_id) >= cli.peers.len() {
        return Err(ShardError::Config(format!(
            "machine id {} outside peer list of {}",
            cli.machine_id,
            cli.peers.len()
        )));
    }
    if cli.workers > num_cpus::get() {
        warn!(
            "{} workers on {} cores; polling loops will contend",
            cli.workers,
            num_cpus::get()
        );
    }

    let config = match &cli.config {
        Some(path) => {
            let mut sized: ClusterConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
            // Topology always comes from the command line.
            sized.nodes = cli.peers.len();
            sized.workers = cli.workers;
            sized
        }
        None => ClusterConfig::small(cli.peers.len(), cli.workers),
    };
    config.validate()?;

    info!("shardkv-server {}", env!("CARGO_PKG_VERSION"));
    info!(
        "node {} of {}, {} workers, ports from {}",
        cli.machine_id,
        cli.peers.len(),
        cli.workers,
        cli.base_port
    );

    let transport = Arc::new(UdpTransport::new(cli.peers, cli.base_port));
    let node = Node::start_seeded(cli.machine_id, config, transport, SEED_KEYS, SEED_VALUE)?;
    node.wait_ready()?;
    info!("node {} ready", node.node_id());

    // Workers poll until the process is killed.
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
