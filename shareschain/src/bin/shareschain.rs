//! Shareschain CLI
//!
//! Command-line interface for the Shareschain node.
//!
//! # Usage
//!
//! ```bash
//! # Start a forging devnet node
//! shareschain --network devnet node --forge "shareschain devnet forger"
//!
//! # Generate a new key, or show the key of a secret phrase
//! shareschain keygen
//! shareschain keygen --secret "my secret phrase"
//!
//! # Account id of a hex public key
//! shareschain account-id <public key>
//!
//! # Print the genesis block
//! shareschain --network testnet genesis
//! ```

use shareschain::crypto::{self, KeyPair};
use shareschain::types::PublicKey;
use shareschain::node::config::{default_data_dir, Network};
use shareschain::node::{Node, NodeConfig, NodeEvent};

use clap::{Args, Parser, Subcommand};
use rand::RngCore;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shareschain - proof-of-stake chain node
#[derive(Parser)]
#[command(name = "shareschain")]
#[command(version)]
#[command(about = "Shareschain consensus node and CLI", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, global = true, env = "SHARESCHAIN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Network (mainnet, testnet, devnet)
    #[arg(short, long, global = true, default_value = "testnet")]
    network: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Node(NodeArgs),

    /// Show the account of a secret phrase, or of a random one
    Keygen {
        /// Secret phrase to derive the key from
        #[arg(long)]
        secret: Option<String>,
    },

    /// Derive the account id of a public key
    AccountId {
        /// Public key (hex)
        public_key: String,
    },

    /// Print the genesis block of the selected network
    Genesis,

    /// Write the default configuration to the data directory
    Init(InitArgs),

    /// Show version and protocol info
    Version,
}

#[derive(Args)]
struct NodeArgs {
    /// Secret phrase of an account to forge with
    #[arg(long, env = "SHARESCHAIN_FORGING_SECRET")]
    forge: Option<String>,

    /// Run without peers
    #[arg(long)]
    offline: bool,

    /// Mempool size (max transactions)
    #[arg(long)]
    mempool_size: Option<usize>,

    /// Seconds to wait past a hit time before forging
    #[arg(long)]
    forging_delay: Option<i32>,

    /// JSON file with genesis allocations
    #[arg(long)]
    genesis_file: Option<PathBuf>,
}

#[derive(Args)]
struct InitArgs {
    /// Overwrite an existing configuration
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let network: Network = cli
        .network
        .parse()
        .map_err(|e: String| format!("Invalid network: {}", e))?;

    let config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => match network {
            Network::Mainnet => NodeConfig::mainnet(data_dir),
            Network::Testnet => NodeConfig::testnet(data_dir),
            Network::Devnet => NodeConfig::devnet(data_dir),
        },
    };

    match cli.command {
        Commands::Node(args) => run_node(args, config).await?,
        Commands::Keygen { secret } => run_keygen(secret),
        Commands::AccountId { public_key } => run_account_id(&public_key)?,
        Commands::Genesis => run_genesis(&config)?,
        Commands::Init(args) => run_init(args, &config)?,
        Commands::Version => run_version(),
    }

    Ok(())
}

/// Run the node until Ctrl+C
async fn run_node(args: NodeArgs, mut config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.offline |= args.offline;
    if let Some(size) = args.mempool_size {
        config.mempool_size = size;
    }
    if let Some(delay) = args.forging_delay {
        config.forging_delay = delay;
    }
    if args.genesis_file.is_some() {
        config.genesis_file = args.genesis_file;
    }

    let mut node = Node::new(config)?;
    node.start().await?;

    if let Some(secret) = args.forge {
        let account_id = node.start_forging(&secret)?;
        info!("Forging with account {}", account_id);
    }

    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::BlockPushed { id, height }) => info!("Block {} at height {}", id, height),
                Ok(NodeEvent::BlockPopped { id, height }) => info!("Popped block {} at height {}", id, height),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} node events", missed)
                }
                Err(_) => break,
            }
        }
    });

    info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    node.stop().await?;
    Ok(())
}

fn run_keygen(secret: Option<String>) {
    let secret_phrase = secret.unwrap_or_else(|| {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let phrase = hex::encode(seed);
        println!("Generated new account:");
        println!("  Secret phrase: {}", phrase);
        phrase
    });
    let keys = KeyPair::from_secret_phrase(&secret_phrase);
    println!("  Account id:    {}", keys.account_id());
    println!("  Public key:    {}", hex::encode(keys.public_key()));
}

fn run_account_id(public_key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = hex::decode(public_key)?;
    let key: PublicKey = bytes
        .try_into()
        .map_err(|_| "Public key must be 32 bytes of hex")?;
    if !crypto::is_canonical_public_key(&key) {
        return Err("Public key is not canonical".into());
    }
    println!("Account id: {}", crypto::account_id(&key));
    Ok(())
}

fn run_genesis(config: &NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let chain_config = config.chain_config()?;
    let genesis = chain_config.genesis();
    let block = genesis.block();
    println!("Genesis block {} ({} allocations, {} KER)", block.id(), genesis.allocations().len(), genesis.total_ker());
    println!("{}", serde_json::to_string_pretty(&block.to_json())?);
    Ok(())
}

fn run_init(args: InitArgs, config: &NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let path = config.data_dir.join("config.json");
    if path.exists() && !args.force {
        return Err("Configuration already exists. Use --force to overwrite.".into());
    }
    config.validate()?;
    config.save(&path)?;
    info!("Created configuration at {}", path.display());
    Ok(())
}

fn run_version() {
    println!("Shareschain {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  Chain:        {}", shareschain::constants::CHAIN_NAME);
    println!("  Block time:   {} s", shareschain::constants::BLOCK_TIME);
    println!("  Max rollback: {} blocks minimum", shareschain::constants::MIN_MAX_ROLLBACK);
    println!("  Total supply: {} SCTK", shareschain::constants::MAX_BALANCE_SCTK);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from(["shareschain", "-n", "devnet", "node", "--offline"]).unwrap();
        assert_eq!(cli.network, "devnet");
        assert!(matches!(cli.command, Commands::Node(NodeArgs { offline: true, .. })));

        let cli = Cli::try_parse_from(["shareschain", "keygen", "--secret", "phrase"]).unwrap();
        assert!(matches!(cli.command, Commands::Keygen { secret: Some(_) }));
    }

    #[test]
    fn test_account_id_rejects_bad_keys() {
        assert!(run_account_id("zz").is_err());
        assert!(run_account_id("00ff").is_err());
        let keys = KeyPair::from_secret_phrase("cli test");
        assert!(run_account_id(&hex::encode(keys.public_key())).is_ok());
    }
}
