// pledger node binary
// Run a beacon, relay, or miner from a JSON config

use anyhow::Context;
use clap::{Parser, Subcommand};
use pledger_node::config::NodeConfig;
use pledger_node::ledger::Ledger;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pledger", version, about = "Proof-of-stake ledger node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config for a new node.
    Init {
        /// Where to write the config file.
        #[arg(short, long)]
        config: PathBuf,
        /// Work directory the node will use.
        #[arg(short, long)]
        work_dir: PathBuf,
        /// Role to configure: beacon, relay, or miner.
        #[arg(short, long, default_value = "relay")]
        role: String,
    },
    /// Run a node from a JSON config file.
    Run {
        /// Path to the node config.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print a stored block from a ledger directory.
    Inspect {
        /// Ledger directory (the node's `<work_dir>/ledger`).
        #[arg(short, long)]
        ledger: PathBuf,
        /// Block id to print; defaults to the last block.
        #[arg(short, long)]
        block: Option<u64>,
    },
}

fn init_config(config_path: PathBuf, work_dir: PathBuf, role: String) -> anyhow::Result<()> {
    use pledger_node::config::{GenesisParams, NodeRole};

    let role = match role.as_str() {
        "beacon" => NodeRole::Beacon,
        "relay" => NodeRole::Relay,
        "miner" => NodeRole::Miner,
        other => anyhow::bail!("unknown role {other:?} (expected beacon, relay, or miner)"),
    };
    let config = NodeConfig {
        work_dir: work_dir.clone(),
        role,
        time_offset: 0,
        starting_block_id: 0,
        key_file: matches!(role, NodeRole::Miner).then(|| PathBuf::from("miner.key")),
        account_id: matches!(role, NodeRole::Miner).then_some(2),
        genesis: matches!(role, NodeRole::Beacon).then(|| GenesisParams {
            genesis_time: 0,
            slot_duration: 5,
            slots_per_epoch: 21_600,
            max_transactions_per_block: 1000,
            min_fee_per_transaction: 0,
            checkpoint_min_blocks: 10_000,
            checkpoint_min_age_seconds: 7 * 24 * 3600,
        }),
    };

    let node_id = pledger_node::ensure_node_id(&work_dir)
        .with_context(|| format!("failed to set up work dir {}", work_dir.display()))?;
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    println!("wrote {}", config_path.display());
    println!("work dir {} (node id {})", work_dir.display(), hex::encode(node_id));
    Ok(())
}

fn inspect(ledger_dir: PathBuf, block: Option<u64>) -> anyhow::Result<()> {
    let mut ledger = Ledger::mount(&ledger_dir)
        .with_context(|| format!("failed to mount ledger at {}", ledger_dir.display()))?;
    let next = ledger.next_block_id();
    println!("ledger: {} block(s), next id {next}", next - ledger.starting_block_id());

    let block_id = match block {
        Some(id) => id,
        None if next > ledger.starting_block_id() => next - 1,
        None => return Ok(()),
    };
    let node = ledger
        .read_block(block_id)
        .with_context(|| format!("failed to read block {block_id}"))?;
    println!("block {block_id}");
    println!("  hash:          {}", node.hash);
    println!("  previous hash: {}", node.block.previous_hash);
    println!("  timestamp:     {}", node.block.timestamp);
    println!("  slot:          {}", node.block.slot);
    println!("  slot leader:   {}", node.block.slot_leader);
    println!("  transactions:  {}", node.block.signed_txes.len());
    for (i, signed_tx) in node.block.signed_txes.iter().enumerate() {
        let tx = &signed_tx.obj;
        println!(
            "    [{i}] {:?} {} -> {} amount {} fee {} ({} signature(s))",
            tx.tx_type,
            tx.from_wallet_id,
            tx.to_wallet_id,
            tx.amount,
            tx.fee,
            signed_tx.signatures.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init {
            config,
            work_dir,
            role,
        } => init_config(config, work_dir, role)?,
        Command::Run { config } => {
            let config = NodeConfig::load(&config)
                .with_context(|| "failed to load node config".to_string())?;
            pledger_node::service::run_node(config)
                .await
                .context("node service failed")?;
        }
        Command::Inspect { ledger, block } => inspect(ledger, block)?,
    }
    Ok(())
}
