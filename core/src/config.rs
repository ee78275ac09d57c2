// Chain configuration
// Persisted in the genesis transaction meta, updatable via config transactions

use crate::account::UserAccount;
use crate::codec::{Codec, CodecError, InputArchive, OutputArchive};

/// Renewal deadline thresholds.
///
/// An account must renew once the chain has advanced `min_blocks` past its
/// last refresh and the corresponding block is at least `min_age_seconds`
/// old.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub min_blocks: u64,
    pub min_age_seconds: u64,
}

impl Codec for CheckpointConfig {
    fn encode(&self, ar: &mut OutputArchive) {
        ar.write_u64(self.min_blocks);
        ar.write_u64(self.min_age_seconds);
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        CheckpointConfig {
            min_blocks: ar.read_u64(),
            min_age_seconds: ar.read_u64(),
        }
    }
}

/// Chain-wide parameters, fixed at genesis and constrained thereafter:
/// `genesis_time` never changes, `slot_duration` may only decrease and
/// `slots_per_epoch` may only increase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainConfig {
    /// Wall-clock start of slot 0, in seconds.
    pub genesis_time: i64,
    /// Slot length in seconds.
    pub slot_duration: u64,
    pub slots_per_epoch: u64,
    /// Cap on user transactions per block; 0 means unlimited. Renewals
    /// are not counted against the cap.
    pub max_transactions_per_block: u64,
    pub min_fee_per_transaction: u64,
    pub checkpoint: CheckpointConfig,
}

impl Codec for ChainConfig {
    fn encode(&self, ar: &mut OutputArchive) {
        ar.write_i64(self.genesis_time);
        ar.write_u64(self.slot_duration);
        ar.write_u64(self.slots_per_epoch);
        ar.write_u64(self.max_transactions_per_block);
        ar.write_u64(self.min_fee_per_transaction);
        self.checkpoint.encode(ar);
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        ChainConfig {
            genesis_time: ar.read_i64(),
            slot_duration: ar.read_u64(),
            slots_per_epoch: ar.read_u64(),
            max_transactions_per_block: ar.read_u64(),
            min_fee_per_transaction: ar.read_u64(),
            checkpoint: CheckpointConfig::decode(ar),
        }
    }
}

/// Payload of genesis and config transactions: the chain configuration
/// plus the genesis account definition, behind a format version tag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenesisAccountMeta {
    pub config: ChainConfig,
    pub genesis: UserAccount,
}

impl GenesisAccountMeta {
    pub const META_VERSION: u32 = 1;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ar = OutputArchive::new();
        ar.write_u32(Self::META_VERSION);
        self.config.encode(&mut ar);
        self.genesis.encode(&mut ar);
        ar.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut ar = InputArchive::new(data);
        let version = ar.read_u32();
        if ar.failed() {
            return Err(CodecError::Malformed(data.len()));
        }
        if version != Self::META_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let meta = GenesisAccountMeta {
            config: ChainConfig::decode(&mut ar),
            genesis: UserAccount::decode(&mut ar),
        };
        if ar.failed() {
            return Err(CodecError::Malformed(data.len()));
        }
        Ok(meta)
    }
}
