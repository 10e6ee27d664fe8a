use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use rln_membership_sync::{
    config::Config, merkle::PersistentMerkleTree, root_tracker::MerkleRootTracker,
    EthersConnector, FileKeystore, FileMetadataStore, GroupManager, GroupManagerSettings,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Overrides `keystore.password`.
const KEYSTORE_PASSWORD_ENV: &str = "RLN_KEYSTORE_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "rln.toml")]
    config: PathBuf,

    /// Overrides `chain.eth_client_address`
    #[arg(long)]
    eth_client_address: Option<String>,

    /// Overrides `chain.membership_contract_address`
    #[arg(long)]
    contract: Option<String>,

    /// Overrides `keystore.path`
    #[arg(long)]
    keystore: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        Config::load_from_file(&args.config)
            .with_context(|| format!("Failed to load config {}", args.config.display()))?
    } else {
        warn!(
            "Config file {} not found, using defaults",
            args.config.display()
        );
        Config::default()
    };

    if let Some(address) = &args.eth_client_address {
        config.chain.eth_client_address = address.clone();
    }
    if let Some(contract) = &args.contract {
        config.chain.membership_contract_address = Some(contract.clone());
    }
    if let Some(keystore) = &args.keystore {
        config.keystore.path = Some(keystore.clone());
    }
    if let Ok(password) = std::env::var(KEYSTORE_PASSWORD_ENV) {
        config.keystore.password = Some(password);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let settings = GroupManagerSettings::from_config(&config)?;

    info!("Loading membership tree from: {}", config.tree.path.display());
    let tree = PersistentMerkleTree::open(&config.tree.path, config.tree.depth)
        .context("Failed to open membership tree")?;
    info!("Membership tree has {} members", tree.member_count());

    let tracker = MerkleRootTracker::new(
        config.roots.acceptable_root_window_size,
        config.roots.history_buffer_size,
    );

    let mut manager = GroupManager::new(
        settings,
        Arc::new(EthersConnector),
        Arc::new(FileKeystore),
        Arc::new(FileMetadataStore::new(config.metadata.path.clone())),
    );

    manager
        .start(Box::new(tree), Box::new(tracker))
        .await
        .context("Failed to start group manager")?;

    let membership_index = manager.membership_index()?;
    info!(
        "Syncing registry {:?} on chain {} as member {}",
        manager.membership_contract(),
        manager.chain_id().unwrap_or_default(),
        membership_index
    );

    let mut roots = manager.subscribe_roots();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
            changed = roots.changed() => {
                if changed.is_err() {
                    break;
                }
                let window = roots.borrow_and_update().clone();
                debug!("Acceptable roots: {}", window.len());
                if let Some(latest) = window.last() {
                    info!(
                        "New membership root {} (lastProcessedBlock={})",
                        hex::encode(latest),
                        manager.last_processed_block()
                    );
                }
            }
        }
    }

    manager.stop().await.context("Failed to stop group manager")?;
    Ok(())
}
