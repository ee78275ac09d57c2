// Node roles
// Role-specific glue around the chain: bootstrap, replay, and production

use crate::chain::{Chain, ChainError};
use crate::genesis::{build_genesis_block, GenesisKeys};
use pledger_consensus::{Clock, OuroborosConfig, SystemClock};
use pledger_core::{binary_pack, Block, ChainConfig, ChainNode, KeyPair, SignedTx};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Ledger subdirectory under a node's work directory.
pub const DIR_LEDGER: &str = "ledger";

#[derive(Clone, Debug)]
pub struct RoleConfig {
    pub work_dir: PathBuf,
    /// Local clock adjustment in seconds.
    pub time_offset: i64,
    /// First block this node keeps; 0 for a full node.
    pub starting_block_id: u64,
}

fn prepare_chain(config: &RoleConfig, clock: Arc<dyn Clock>) -> Result<Chain, ChainError> {
    if !config.work_dir.exists() {
        std::fs::create_dir_all(&config.work_dir)
            .map_err(|e| ChainError::Internal(format!("failed to create work dir: {e}")))?;
    }
    let mut chain = Chain::with_clock(clock);
    // Only the time offset is known up front; the remaining consensus
    // parameters arrive with the genesis block.
    chain.init_consensus(OuroborosConfig {
        time_offset: config.time_offset,
        genesis_time: 0,
        ..OuroborosConfig::default()
    });
    chain.open_ledger_dir(&config.work_dir.join(DIR_LEDGER), config.starting_block_id)?;
    Ok(chain)
}

/// A replaying node: rebuilds state from its ledger and accepts live
/// blocks with strict validation.
pub struct Relay {
    chain: Chain,
}

impl Relay {
    pub fn init(config: &RoleConfig) -> Result<Relay, ChainError> {
        Self::init_with_clock(config, Arc::new(SystemClock))
    }

    pub fn init_with_clock(
        config: &RoleConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Relay, ChainError> {
        info!(work_dir = %config.work_dir.display(), "initializing relay");
        let mut chain = prepare_chain(config, clock)?;
        chain.load_from_ledger(config.starting_block_id)?;
        info!(
            starting_block_id = config.starting_block_id,
            next_block_id = chain.next_block_id(),
            "relay initialized"
        );
        Ok(Relay { chain })
    }

    pub fn add_block(&mut self, node: &ChainNode) -> Result<(), ChainError> {
        self.chain.add_block(node, true)
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut Chain {
        &mut self.chain
    }
}

/// A bootstrapping node: creates the chain when the ledger is empty and
/// serves it afterwards.
pub struct Beacon {
    chain: Chain,
}

impl Beacon {
    pub fn init(
        work_dir: &Path,
        time_offset: i64,
        genesis_config: &ChainConfig,
        keys: &GenesisKeys,
    ) -> Result<Beacon, ChainError> {
        Self::init_with_clock(
            work_dir,
            time_offset,
            genesis_config,
            keys,
            Arc::new(SystemClock),
        )
    }

    pub fn init_with_clock(
        work_dir: &Path,
        time_offset: i64,
        genesis_config: &ChainConfig,
        keys: &GenesisKeys,
        clock: Arc<dyn Clock>,
    ) -> Result<Beacon, ChainError> {
        info!(work_dir = %work_dir.display(), "initializing beacon");
        let config = RoleConfig {
            work_dir: work_dir.to_path_buf(),
            time_offset,
            starting_block_id: 0,
        };
        let mut chain = prepare_chain(&config, clock)?;

        if chain.next_block_id() == 0 {
            let genesis = build_genesis_block(genesis_config, keys);
            info!(hash = %genesis.hash, "bootstrapping chain with genesis block");
            chain.add_block(&genesis, true)?;
        } else {
            chain.load_from_ledger(0)?;
        }

        info!(next_block_id = chain.next_block_id(), "beacon initialized");
        Ok(Beacon { chain })
    }

    pub fn add_block(&mut self, node: &ChainNode) -> Result<(), ChainError> {
        self.chain.add_block(node, true)
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut Chain {
        &mut self.chain
    }
}

/// A producing node: a relay plus the key material to sign renewals and
/// produce blocks when it holds the slot.
pub struct Miner {
    chain: Chain,
    keypair: KeyPair,
    account_id: u64,
}

impl Miner {
    pub fn init(
        config: &RoleConfig,
        keypair: KeyPair,
        account_id: u64,
    ) -> Result<Miner, ChainError> {
        Self::init_with_clock(config, keypair, account_id, Arc::new(SystemClock))
    }

    pub fn init_with_clock(
        config: &RoleConfig,
        keypair: KeyPair,
        account_id: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Miner, ChainError> {
        info!(
            work_dir = %config.work_dir.display(),
            account_id,
            "initializing miner"
        );
        let mut chain = prepare_chain(config, clock)?;
        chain.load_from_ledger(config.starting_block_id)?;
        Ok(Miner {
            chain,
            keypair,
            account_id,
        })
    }

    pub fn account_id(&self) -> u64 {
        self.account_id
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut Chain {
        &mut self.chain
    }

    pub fn add_block(&mut self, node: &ChainNode) -> Result<(), ChainError> {
        self.chain.add_block(node, true)
    }

    /// True when this node's account leads the current slot.
    pub fn is_current_slot_leader(&mut self) -> bool {
        self.chain.refresh_stakeholders();
        let slot = self.chain.current_slot();
        self.chain.is_stakeholder_slot_leader(self.account_id, slot)
    }

    /// Assemble, sign, validate, and persist a block at the current
    /// slot. Mandatory renewals are prepended and signed with this
    /// node's key; the caller-supplied transactions fill the rest of the
    /// block up to the per-block cap.
    pub fn produce_block(&mut self, user_txes: Vec<SignedTx>) -> Result<ChainNode, ChainError> {
        self.chain.refresh_stakeholders();
        let slot = self.chain.current_slot();
        if !self.chain.is_stakeholder_slot_leader(self.account_id, slot) {
            return Err(ChainError::SlotLeader {
                leader: self.account_id,
                slot,
            });
        }
        if !self.chain.is_slot_block_production_time(slot) {
            return Err(ChainError::Timing);
        }

        let mut signed_txes = self.chain.collect_renewals()?;
        for renewal in &mut signed_txes {
            let signature = self.keypair.sign(&binary_pack(&renewal.obj));
            renewal.signatures.push(signature);
        }

        let cap = self.chain.max_transactions_per_block();
        let mut user_txes = user_txes;
        if cap > 0 && user_txes.len() as u64 > cap {
            user_txes.truncate(cap as usize);
        }
        signed_txes.extend(user_txes);

        let next_block_id = self.chain.next_block_id();
        let previous_hash = if next_block_id == 0 {
            pledger_core::GENESIS_PREVIOUS_HASH.to_string()
        } else {
            self.chain.get_block(next_block_id - 1)?.hash
        };

        let block = Block {
            index: next_block_id,
            timestamp: self.chain.consensus_timestamp(),
            previous_hash,
            nonce: 0,
            slot,
            slot_leader: self.account_id,
            signed_txes,
        };
        let node = ChainNode {
            hash: block.compute_hash(),
            block,
        };
        self.chain.add_block(&node, true)?;
        info!(block_id = node.block.index, slot, "produced block");
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pledger_consensus::ManualClock;
    use pledger_core::{ChainConfig, CheckpointConfig, ID_RESERVE};
    use tempfile::TempDir;

    fn genesis_config() -> ChainConfig {
        ChainConfig {
            genesis_time: 1000,
            slot_duration: 5,
            slots_per_epoch: 10,
            max_transactions_per_block: 100,
            min_fee_per_transaction: 0,
            checkpoint: CheckpointConfig {
                min_blocks: 10,
                min_age_seconds: 20,
            },
        }
    }

    #[test]
    fn test_beacon_bootstraps_then_remounts() {
        let dir = TempDir::new().unwrap();
        let keys = GenesisKeys::generate();
        let clock = ManualClock::new(1000);

        {
            let beacon = Beacon::init_with_clock(
                dir.path(),
                0,
                &genesis_config(),
                &keys,
                Arc::new(clock.clone()),
            )
            .unwrap();
            assert_eq!(beacon.chain().next_block_id(), 1);
        }

        // A second start finds the ledger and replays instead of
        // re-bootstrapping.
        let beacon = Beacon::init_with_clock(
            dir.path(),
            0,
            &genesis_config(),
            &keys,
            Arc::new(clock.clone()),
        )
        .unwrap();
        assert_eq!(beacon.chain().next_block_id(), 1);
        assert_eq!(beacon.chain().chain_config(), &genesis_config());
    }

    #[test]
    fn test_relay_replays_existing_ledger() {
        let dir = TempDir::new().unwrap();
        let keys = GenesisKeys::generate();
        let clock = ManualClock::new(1000);
        {
            Beacon::init_with_clock(
                dir.path(),
                0,
                &genesis_config(),
                &keys,
                Arc::new(clock.clone()),
            )
            .unwrap();
        }

        let relay = Relay::init_with_clock(
            &RoleConfig {
                work_dir: dir.path().to_path_buf(),
                time_offset: 0,
                starting_block_id: 0,
            },
            Arc::new(clock.clone()),
        )
        .unwrap();
        assert_eq!(relay.chain().next_block_id(), 1);
        assert!(relay.chain().bank().has_account(ID_RESERVE));
    }

    #[test]
    fn test_relay_fresh_work_dir_starts_empty() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::init_with_clock(
            &RoleConfig {
                work_dir: dir.path().join("node"),
                time_offset: 0,
                starting_block_id: 0,
            },
            Arc::new(ManualClock::new(1000)),
        )
        .unwrap();
        assert_eq!(relay.chain().next_block_id(), 0);
        assert!(dir.path().join("node/ledger").exists());
    }

    #[test]
    fn test_miner_produces_block_when_leader() {
        let dir = TempDir::new().unwrap();
        let keys = GenesisKeys::generate();
        let clock = ManualClock::new(1000);
        let reserve_seed = keys.reserve.seed();
        {
            Beacon::init_with_clock(
                dir.path(),
                0,
                &genesis_config(),
                &keys,
                Arc::new(clock.clone()),
            )
            .unwrap();
        }

        let mut miner = Miner::init_with_clock(
            &RoleConfig {
                work_dir: dir.path().to_path_buf(),
                time_offset: 0,
                starting_block_id: 0,
            },
            KeyPair::from_seed(reserve_seed),
            ID_RESERVE,
            Arc::new(clock.clone()),
        )
        .unwrap();

        // Only the reserve holds stake, so it leads every slot.
        clock.set(1005);
        assert!(miner.is_current_slot_leader());
        let node = miner.produce_block(Vec::new()).unwrap();
        assert_eq!(node.block.index, 1);
        assert_eq!(node.block.slot, 1);
        assert_eq!(node.block.slot_leader, ID_RESERVE);
        assert_eq!(miner.chain().next_block_id(), 2);

        // The produced block persists and replays.
        clock.set(1010);
        let node = miner.produce_block(Vec::new()).unwrap();
        assert_eq!(node.block.index, 2);
    }

    #[test]
    fn test_miner_refuses_foreign_slot() {
        let dir = TempDir::new().unwrap();
        let keys = GenesisKeys::generate();
        let clock = ManualClock::new(1000);
        {
            Beacon::init_with_clock(
                dir.path(),
                0,
                &genesis_config(),
                &keys,
                Arc::new(clock.clone()),
            )
            .unwrap();
        }

        // An account with no stake can never lead.
        let mut miner = Miner::init_with_clock(
            &RoleConfig {
                work_dir: dir.path().to_path_buf(),
                time_offset: 0,
                starting_block_id: 0,
            },
            KeyPair::generate(),
            pledger_core::ID_FIRST_USER,
            Arc::new(clock.clone()),
        )
        .unwrap();
        clock.set(1005);
        assert!(!miner.is_current_slot_leader());
        assert!(matches!(
            miner.produce_block(Vec::new()),
            Err(ChainError::SlotLeader { .. })
        ));
    }
}
