use anyhow::Context;
use clap::Parser;
use peerbackup_node::p2p::{build_node, drive_node, parse_listen_multiaddr, RecoveryPlan};
use peerbackup_node::{BackupService, BackupStore, MacKey, NodeConfig, PeerIdentity};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

const IDENTITY_FILE: &str = "node_identity.key";
const CONFIG_FILE: &str = "node-config.json";

#[derive(Parser, Debug, Clone)]
#[command(name = "peerbackup-node", version, about = "Peer-to-peer encrypted backup node")]
struct Args {
    #[arg(long, default_value = "./node-data")]
    storage_path: PathBuf,

    #[arg(long, default_value_t = 50)]
    max_gb: u64,

    #[arg(long, default_value = "/ip4/0.0.0.0/tcp/9000")]
    listen: String,

    #[arg(long, num_args = 0..)]
    bootstrap: Vec<String>,

    /// JSON node configuration. Defaults to `<storage-path>/node-config.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Recover the newest backup index held by connected peers.
    #[arg(long, default_value_t = false)]
    recover: bool,

    #[arg(long, default_value = "./restored")]
    recover_dir: PathBuf,

    #[arg(long, default_value_t = false)]
    print_peer_id: bool,

    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    fs::create_dir_all(&args.storage_path).with_context(|| {
        format!("failed to create storage path {}", args.storage_path.display())
    })?;
    let keypair = load_or_create_identity(&args.storage_path)?;
    if args.print_peer_id {
        println!("{}", keypair.public().to_peer_id());
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });
    run_node_with_shutdown(&args, keypair, shutdown_rx).await
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_node_with_shutdown(
    args: &Args,
    keypair: libp2p::identity::Keypair,
    shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.storage_path.join(CONFIG_FILE));
    let config = NodeConfig::load(&config_path)?;
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Default node configuration written");
    }

    let secret = keypair
        .to_protobuf_encoding()
        .context("failed to encode node identity")?;
    let mac_key = MacKey::derive(&secret)?;
    let local = PeerIdentity::from(&keypair.public().to_peer_id());

    let store = BackupStore::open(&args.storage_path.join("db"))?;
    let max_bytes = args
        .max_gb
        .saturating_mul(1024)
        .saturating_mul(1024)
        .saturating_mul(1024);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let service = BackupService::open(store, config, local, mac_key, max_bytes, outbound_tx)?;

    let bootstrap_addrs = args
        .bootstrap
        .iter()
        .map(|s| s.parse())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid bootstrap address")?;
    let node = build_node(keypair, service, outbound_rx, bootstrap_addrs)?;
    let listen_addr = parse_listen_multiaddr(&args.listen)?;

    info!(peer_id = %node.peer_id, "Node identity loaded");
    info!(
        max_gb = args.max_gb,
        path = %args.storage_path.display(),
        "Node storage allocation configured"
    );

    let recovery = args.recover.then(|| RecoveryPlan {
        destination: args.recover_dir.clone(),
    });
    drive_node(node, listen_addr, recovery, shutdown_rx).await
}

fn load_or_create_identity(storage_path: &Path) -> anyhow::Result<libp2p::identity::Keypair> {
    let key_path = storage_path.join(IDENTITY_FILE);

    if key_path.exists() {
        let bytes = fs::read(&key_path)
            .with_context(|| format!("failed to read identity {}", key_path.display()))?;
        let keypair = libp2p::identity::Keypair::from_protobuf_encoding(&bytes)?;
        return Ok(keypair);
    }

    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let encoded = keypair.to_protobuf_encoding()?;
    fs::write(&key_path, encoded)
        .with_context(|| format!("failed to write identity {}", key_path.display()))?;
    Ok(keypair)
}
