// Node service
// Slot-paced run loop driving a role until shutdown

use crate::chain::ChainError;
use crate::config::{ensure_node_id, NodeConfig, NodeRole};
use crate::genesis::GenesisKeys;
use crate::roles::{Beacon, Miner, Relay, RoleConfig};
use chrono::{TimeZone, Utc};
use pledger_consensus::SystemClock;
use pledger_core::{load_private_key, save_private_key, KeyPair};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};


#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Crypto(#[from] pledger_core::CryptoError),
    #[error("beacon requires genesis parameters in the config")]
    MissingGenesis,
}

enum Role {
    Beacon(Beacon),
    Relay(Relay),
    Miner(Miner),
}

/// Ties a configured role to a slot-paced tokio loop.
///
/// The loop sleeps to each slot boundary; a miner checks leadership each
/// slot and produces a block when it holds it. Storage and chain work
/// stay synchronous inside the single service task.
pub struct NodeService {
    config: NodeConfig,
    role: Role,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl NodeService {
    pub fn new(config: NodeConfig) -> Result<NodeService, ServiceError> {
        config.validate()?;
        let node_id = ensure_node_id(&config.work_dir)?;
        info!(node_id = %hex::encode(node_id), "node identity loaded");

        let role_config = RoleConfig {
            work_dir: config.work_dir.clone(),
            time_offset: config.time_offset,
            starting_block_id: config.starting_block_id,
        };

        let role = match config.role {
            NodeRole::Beacon => {
                let genesis_params = config.genesis.as_ref().ok_or(ServiceError::MissingGenesis)?;
                let chain_config =
                    genesis_params.to_chain_config(pledger_consensus::Clock::now(&SystemClock));
                let keys = Self::load_or_create_genesis_keys(&config)?;
                Role::Beacon(Beacon::init(
                    &config.work_dir,
                    config.time_offset,
                    &chain_config,
                    &keys,
                )?)
            }
            NodeRole::Relay => Role::Relay(Relay::init(&role_config)?),
            NodeRole::Miner => {
                let key_path = config.key_file.clone().expect("validated");
                let key_path = if key_path.is_absolute() {
                    key_path
                } else {
                    config.work_dir.join(key_path)
                };
                let seed = load_private_key(&key_path)?;
                let keypair = KeyPair::from_seed(seed);
                let account_id = config.account_id.expect("validated");
                Role::Miner(Miner::init(&role_config, keypair, account_id)?)
            }
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(NodeService {
            config,
            role,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The beacon's signing material: one key file per system account
    /// under the work dir, generated on first bootstrap.
    fn load_or_create_genesis_keys(config: &NodeConfig) -> Result<GenesisKeys, ServiceError> {
        let names = ["genesis.key", "fee.key", "reserve.key", "recycle.key"];
        let mut keys = Vec::with_capacity(names.len());
        if !config.work_dir.exists() {
            std::fs::create_dir_all(&config.work_dir).map_err(|source| {
                crate::config::ConfigError::NodeId {
                    path: config.work_dir.display().to_string(),
                    source,
                }
            })?;
        }
        for name in names {
            let path = config.work_dir.join(name);
            let keypair = if path.exists() {
                KeyPair::from_seed(load_private_key(&path)?)
            } else {
                let keypair = KeyPair::generate();
                save_private_key(&path, &keypair.seed())?;
                info!(path = %path.display(), "generated key file");
                keypair
            };
            keys.push(keypair);
        }
        let mut keys = keys.into_iter();
        Ok(GenesisKeys {
            genesis: keys.next().expect("four keys"),
            fee: keys.next().expect("four keys"),
            reserve: keys.next().expect("four keys"),
            recycle: keys.next().expect("four keys"),
        })
    }

    fn chain(&self) -> &crate::chain::Chain {
        match &self.role {
            Role::Beacon(beacon) => beacon.chain(),
            Role::Relay(relay) => relay.chain(),
            Role::Miner(miner) => miner.chain(),
        }
    }

    /// Handle for requesting shutdown from another task.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown, ticking once per slot.
    pub async fn run(&mut self) -> Result<(), ServiceError> {
        let chain_config = self.chain().chain_config().clone();
        let genesis_utc = Utc
            .timestamp_opt(chain_config.genesis_time, 0)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| chain_config.genesis_time.to_string());
        info!(
            role = ?self.config.role,
            genesis_time = %genesis_utc,
            slot_duration = chain_config.slot_duration,
            slots_per_epoch = chain_config.slots_per_epoch,
            next_block_id = self.chain().next_block_id(),
            "node service running"
        );

        let mut last_epoch = self.chain().current_epoch();
        loop {
            let slot = self.chain().current_slot();
            let wait = self.chain().time_until_slot(slot + 1).max(0) as u64;

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(wait.max(1))) => {}
            }

            let epoch = self.chain().current_epoch();
            if epoch != last_epoch {
                info!(epoch, "epoch boundary");
                last_epoch = epoch;
            }

            if let Role::Miner(miner) = &mut self.role {
                if miner.is_current_slot_leader() {
                    // No mempool surface in this node; blocks carry the
                    // mandatory renewals only.
                    match miner.produce_block(Vec::new()) {
                        Ok(node) => {
                            info!(block_id = node.block.index, "block produced for slot")
                        }
                        Err(ChainError::Timing) => {
                            debug!("slot window already closed, skipping")
                        }
                        Err(error) => {
                            warn!(%error, "block production failed")
                        }
                    }
                } else {
                    debug!("not the slot leader for this slot");
                }
            }
        }
    }
}

/// Convenience used by the binary: build and run a service from config.
pub async fn run_node(config: NodeConfig) -> Result<(), ServiceError> {
    let mut service = NodeService::new(config)?;
    if let Err(error) = service.run().await {
        error!(%error, "node service stopped");
        return Err(error);
    }
    Ok(())
}
