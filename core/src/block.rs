// Block model
// Sequenced transaction containers and their hashed ledger records

use crate::codec::{binary_pack, Codec, InputArchive, OutputArchive};
use crate::crypto::sha256_hex;
use crate::transaction::SignedTx;

/// Previous-hash sentinel of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// A block of signed transactions at a consensus slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub previous_hash: String,
    pub nonce: u64,
    pub slot: u64,
    pub slot_leader: u64,
    pub signed_txes: Vec<SignedTx>,
}

impl Block {
    /// SHA-256 over the binary serialization, lowercase hex.
    pub fn compute_hash(&self) -> String {
        sha256_hex(&binary_pack(self))
    }
}

impl Codec for Block {
    fn encode(&self, ar: &mut OutputArchive) {
        ar.write_u64(self.index);
        ar.write_i64(self.timestamp);
        self.previous_hash.encode(ar);
        ar.write_u64(self.nonce);
        ar.write_u64(self.slot);
        ar.write_u64(self.slot_leader);
        self.signed_txes.encode(ar);
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        Block {
            index: ar.read_u64(),
            timestamp: ar.read_i64(),
            previous_hash: String::decode(ar),
            nonce: ar.read_u64(),
            slot: ar.read_u64(),
            slot_leader: ar.read_u64(),
            signed_txes: Vec::decode(ar),
        }
    }
}

/// A block together with its hash, as persisted in the ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainNode {
    pub hash: String,
    pub block: Block,
}

impl Codec for ChainNode {
    fn encode(&self, ar: &mut OutputArchive) {
        self.hash.encode(ar);
        self.block.encode(ar);
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        ChainNode {
            hash: String::decode(ar),
            block: Block::decode(ar),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::binary_unpack;
    use crate::transaction::{Transaction, TxType};

    fn sample_block() -> Block {
        Block {
            index: 1,
            timestamp: 12345,
            previous_hash: "prev".to_string(),
            nonce: 7,
            slot: 2,
            slot_leader: 3,
            signed_txes: vec![SignedTx {
                obj: Transaction {
                    tx_type: TxType::Default,
                    token_id: 0,
                    from_wallet_id: 2,
                    to_wallet_id: 3,
                    amount: 10,
                    fee: 1,
                    meta: Vec::new(),
                },
                signatures: vec![vec![5u8; 64]],
            }],
        }
    }

    #[test]
    fn test_block_round_trip() {
        let block = sample_block();
        let unpacked: Block = binary_unpack(&binary_pack(&block)).unwrap();
        assert_eq!(unpacked, block);
    }

    #[test]
    fn test_chain_node_round_trip() {
        let block = sample_block();
        let node = ChainNode {
            hash: block.compute_hash(),
            block,
        };
        let unpacked: ChainNode = binary_unpack(&binary_pack(&node)).unwrap();
        assert_eq!(unpacked, node);
    }

    #[test]
    fn test_hash_deterministic_and_sensitive() {
        let block = sample_block();
        let hash1 = block.compute_hash();
        let hash2 = block.compute_hash();
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert!(hash1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let mut tampered = sample_block();
        tampered.nonce = 8;
        assert_ne!(tampered.compute_hash(), hash1);
    }
}
