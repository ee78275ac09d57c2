// Genesis block construction
// The four-transaction bootstrap: system init, fee, reserve, recycle

use pledger_core::{
    binary_pack, Block, ChainConfig, ChainNode, GenesisAccountMeta, KeyPair, SignedTx, Transaction,
    TxType, UserAccount, Wallet, GENESIS_PREVIOUS_HASH, ID_FEE, ID_GENESIS, ID_RECYCLE, ID_RESERVE,
    INITIAL_TOKEN_SUPPLY,
};
use std::collections::BTreeMap;

/// Key pairs controlling the four system accounts.
pub struct GenesisKeys {
    pub genesis: KeyPair,
    pub fee: KeyPair,
    pub reserve: KeyPair,
    pub recycle: KeyPair,
}

impl GenesisKeys {
    pub fn generate() -> Self {
        GenesisKeys {
            genesis: KeyPair::generate(),
            fee: KeyPair::generate(),
            reserve: KeyPair::generate(),
            recycle: KeyPair::generate(),
        }
    }
}

fn single_key_account(key: &KeyPair, balance: i64, meta: &str) -> UserAccount {
    UserAccount {
        wallet: Wallet {
            public_keys: vec![key.public_key()],
            min_signatures: 1,
            balances: BTreeMap::from([(ID_GENESIS, balance)]),
        },
        meta: meta.to_string(),
    }
}

fn signed(tx: Transaction, signer: &KeyPair) -> SignedTx {
    let signature = signer.sign(&binary_pack(&tx));
    SignedTx {
        obj: tx,
        signatures: vec![signature],
    }
}

/// Build the genesis block exactly as the chain validates it: index 0,
/// previous hash "0", slot and leader 0, and the four system
/// transactions in order, all signed by the genesis key.
pub fn build_genesis_block(config: &ChainConfig, keys: &GenesisKeys) -> ChainNode {
    let min_fee = config.min_fee_per_transaction as i64;

    let meta = GenesisAccountMeta {
        config: config.clone(),
        genesis: single_key_account(&keys.genesis, 0, "genesis"),
    };

    let mut block = Block {
        index: 0,
        timestamp: config.genesis_time,
        previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
        nonce: 0,
        slot: 0,
        slot_leader: 0,
        signed_txes: Vec::new(),
    };

    block.signed_txes.push(signed(
        Transaction {
            tx_type: TxType::Genesis,
            token_id: ID_GENESIS,
            from_wallet_id: ID_GENESIS,
            to_wallet_id: ID_GENESIS,
            amount: 0,
            fee: 0,
            meta: meta.to_bytes(),
        },
        &keys.genesis,
    ));

    let fee_account = single_key_account(&keys.fee, 0, "fee");
    block.signed_txes.push(signed(
        Transaction {
            tx_type: TxType::NewUser,
            token_id: ID_GENESIS,
            from_wallet_id: ID_GENESIS,
            to_wallet_id: ID_FEE,
            amount: 0,
            fee: 0,
            meta: binary_pack(&fee_account),
        },
        &keys.genesis,
    ));

    // The reserve receives the full supply less the fee burned creating
    // the recycle account below.
    let reserve_amount = INITIAL_TOKEN_SUPPLY - min_fee;
    let reserve_account = single_key_account(&keys.reserve, reserve_amount, "reserve");
    block.signed_txes.push(signed(
        Transaction {
            tx_type: TxType::NewUser,
            token_id: ID_GENESIS,
            from_wallet_id: ID_GENESIS,
            to_wallet_id: ID_RESERVE,
            amount: reserve_amount,
            fee: min_fee,
            meta: binary_pack(&reserve_account),
        },
        &keys.genesis,
    ));

    let recycle_account = single_key_account(&keys.recycle, 0, "recycle write-off sink");
    block.signed_txes.push(signed(
        Transaction {
            tx_type: TxType::NewUser,
            token_id: ID_GENESIS,
            from_wallet_id: ID_GENESIS,
            to_wallet_id: ID_RECYCLE,
            amount: 0,
            fee: min_fee,
            meta: binary_pack(&recycle_account),
        },
        &keys.genesis,
    ));

    let hash = block.compute_hash();
    ChainNode { hash, block }
}
