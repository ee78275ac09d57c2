// Node configuration
// JSON config file, validation, and the on-disk node identity

use pledger_core::{ChainConfig, CheckpointConfig};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Length of the opaque node identity blob.
pub const NODE_ID_LEN: usize = 20;
const NODE_ID_FILE: &str = "node-id";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to access node id file {path}: {source}")]
    NodeId {
        path: String,
        source: std::io::Error,
    },
}

/// Which role this node plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Bootstraps the chain and serves it.
    Beacon,
    /// Replays and relays blocks, never produces.
    Relay,
    /// Replays and produces blocks when it holds the slot.
    Miner,
}

/// Genesis parameters used when bootstrapping a brand-new chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisParams {
    /// Wall-clock start of slot 0; 0 means "now" at init time.
    #[serde(default)]
    pub genesis_time: i64,
    pub slot_duration: u64,
    pub slots_per_epoch: u64,
    #[serde(default)]
    pub max_transactions_per_block: u64,
    #[serde(default)]
    pub min_fee_per_transaction: u64,
    pub checkpoint_min_blocks: u64,
    pub checkpoint_min_age_seconds: u64,
}

impl GenesisParams {
    pub fn to_chain_config(&self, now: i64) -> ChainConfig {
        ChainConfig {
            genesis_time: if self.genesis_time == 0 {
                now
            } else {
                self.genesis_time
            },
            slot_duration: self.slot_duration,
            slots_per_epoch: self.slots_per_epoch,
            max_transactions_per_block: self.max_transactions_per_block,
            min_fee_per_transaction: self.min_fee_per_transaction,
            checkpoint: CheckpointConfig {
                min_blocks: self.checkpoint_min_blocks,
                min_age_seconds: self.checkpoint_min_age_seconds,
            },
        }
    }
}

/// Node configuration, loaded from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub work_dir: PathBuf,
    pub role: NodeRole,
    #[serde(default)]
    pub time_offset: i64,
    #[serde(default)]
    pub starting_block_id: u64,
    /// Private key file (32 raw bytes or 64 hex chars); miners only.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Account id this node signs as; miners only.
    #[serde(default)]
    pub account_id: Option<u64>,
    /// Genesis parameters; beacons only.
    #[serde(default)]
    pub genesis: Option<GenesisParams>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<NodeConfig, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: NodeConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("work_dir must be set".into()));
        }
        match self.role {
            NodeRole::Miner => {
                if self.key_file.is_none() {
                    return Err(ConfigError::Invalid("miner requires key_file".into()));
                }
                if self.account_id.is_none() {
                    return Err(ConfigError::Invalid("miner requires account_id".into()));
                }
            }
            NodeRole::Beacon => {
                if let Some(genesis) = &self.genesis {
                    if genesis.slot_duration == 0 {
                        return Err(ConfigError::Invalid(
                            "genesis slot_duration must be positive".into(),
                        ));
                    }
                    if genesis.slots_per_epoch == 0 {
                        return Err(ConfigError::Invalid(
                            "genesis slots_per_epoch must be positive".into(),
                        ));
                    }
                }
            }
            NodeRole::Relay => {}
        }
        Ok(())
    }
}

/// Read this node's identity blob, creating it with fresh random bytes
/// on first start.
pub fn ensure_node_id(work_dir: &Path) -> Result<[u8; NODE_ID_LEN], ConfigError> {
    let path = work_dir.join(NODE_ID_FILE);
    let as_error = |source: std::io::Error| ConfigError::NodeId {
        path: path.display().to_string(),
        source,
    };

    if path.exists() {
        let raw = std::fs::read(&path).map_err(as_error)?;
        let blob: [u8; NODE_ID_LEN] = raw.as_slice().try_into().map_err(|_| ConfigError::NodeId {
            path: path.display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected {NODE_ID_LEN} bytes, found {}", raw.len()),
            ),
        })?;
        return Ok(blob);
    }

    if !work_dir.exists() {
        std::fs::create_dir_all(work_dir).map_err(as_error)?;
    }
    let mut blob = [0u8; NODE_ID_LEN];
    rand::thread_rng().fill_bytes(&mut blob);
    std::fs::write(&path, blob).map_err(as_error)?;
    Ok(blob)
}
