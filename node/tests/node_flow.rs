// End-to-end node flow
// Bootstrap a chain, produce blocks across epochs, remount, replay, rewind

use pledger_consensus::ManualClock;
use pledger_core::{
    binary_pack, ChainConfig, CheckpointConfig, KeyPair, SignedTx, Transaction, TxType,
    UserAccount, Wallet, ID_GENESIS, ID_RESERVE, INITIAL_TOKEN_SUPPLY,
};
use pledger_node::{Beacon, GenesisKeys, Ledger, Miner, Relay, RoleConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const USER_A: u64 = pledger_core::ID_FIRST_USER;
const USER_B: u64 = pledger_core::ID_FIRST_USER + 1;

fn genesis_config() -> ChainConfig {
    ChainConfig {
        genesis_time: 1000,
        slot_duration: 5,
        slots_per_epoch: 4,
        max_transactions_per_block: 100,
        min_fee_per_transaction: 0,
        // Generous thresholds keep renewals out of this scenario.
        checkpoint: CheckpointConfig {
            min_blocks: 1000,
            min_age_seconds: 86_400,
        },
    }
}

fn signed(tx: Transaction, signer: &KeyPair) -> SignedTx {
    let signature = signer.sign(&binary_pack(&tx));
    SignedTx {
        obj: tx,
        signatures: vec![signature],
    }
}

fn new_user_tx(to: u64, key: &KeyPair) -> Transaction {
    Transaction {
        tx_type: TxType::NewUser,
        token_id: ID_GENESIS,
        from_wallet_id: ID_RESERVE,
        to_wallet_id: to,
        amount: 0,
        fee: 0,
        meta: binary_pack(&UserAccount {
            wallet: Wallet {
                public_keys: vec![key.public_key()],
                min_signatures: 1,
                balances: BTreeMap::from([(ID_GENESIS, 0i64)]),
            },
            meta: String::new(),
        }),
    }
}

fn transfer_tx(from: u64, to: u64, amount: i64) -> Transaction {
    Transaction {
        tx_type: TxType::Default,
        token_id: ID_GENESIS,
        from_wallet_id: from,
        to_wallet_id: to,
        amount,
        fee: 0,
        meta: Vec::new(),
    }
}

/// Drive the miner through slots until every transaction batch has
/// landed in a block, skipping slots another stakeholder leads.
fn produce_batches(miner: &mut Miner, clock: &ManualClock, batches: Vec<Vec<SignedTx>>) {
    let config = genesis_config();
    let mut slot = miner.chain().current_slot();
    let mut remaining = batches.into_iter();
    let mut next_batch = remaining.next();
    while let Some(batch) = next_batch.take() {
        slot += 1;
        assert!(slot < 200, "ran out of slots before all batches landed");
        clock.set(config.genesis_time + (slot * config.slot_duration) as i64);
        if miner.is_current_slot_leader() {
            miner.produce_block(batch).unwrap();
            next_batch = remaining.next();
        } else {
            // Another stakeholder owns this slot; retry the batch later.
            next_batch = Some(batch);
        }
    }
}

fn bootstrap(dir: &Path, clock: &ManualClock) -> GenesisKeys {
    let keys = GenesisKeys::generate();
    let beacon = Beacon::init_with_clock(
        dir,
        0,
        &genesis_config(),
        &keys,
        Arc::new(clock.clone()),
    )
    .unwrap();
    assert_eq!(beacon.chain().next_block_id(), 1);
    keys
}

#[test]
fn test_chain_grows_and_replays_identically() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1000);
    let keys = bootstrap(dir.path(), &clock);
    let key_a = KeyPair::generate();
    let key_b = KeyPair::generate();

    let produced_next;
    {
        let mut miner = Miner::init_with_clock(
            &RoleConfig {
                work_dir: dir.path().to_path_buf(),
                time_offset: 0,
                starting_block_id: 0,
            },
            KeyPair::from_seed(keys.reserve.seed()),
            ID_RESERVE,
            Arc::new(clock.clone()),
        )
        .unwrap();

        produce_batches(
            &mut miner,
            &clock,
            vec![
                vec![signed(new_user_tx(USER_A, &key_a), &keys.reserve)],
                vec![signed(new_user_tx(USER_B, &key_b), &keys.reserve)],
                vec![signed(transfer_tx(ID_RESERVE, USER_A, 300), &keys.reserve)],
                vec![signed(transfer_tx(USER_A, USER_B, 100), &key_a)],
            ],
        );

        produced_next = miner.chain().next_block_id();
        assert_eq!(produced_next, 5);
        assert_eq!(miner.chain().bank().get_balance(USER_A, ID_GENESIS), 200);
        assert_eq!(miner.chain().bank().get_balance(USER_B, ID_GENESIS), 100);
        assert_eq!(
            miner.chain().bank().get_balance(ID_RESERVE, ID_GENESIS),
            INITIAL_TOKEN_SUPPLY - 300
        );
    }

    // A relay over the same work dir replays to the same state.
    let relay = Relay::init_with_clock(
        &RoleConfig {
            work_dir: dir.path().to_path_buf(),
            time_offset: 0,
            starting_block_id: 0,
        },
        Arc::new(clock.clone()),
    )
    .unwrap();
    assert_eq!(relay.chain().next_block_id(), produced_next);
    assert_eq!(relay.chain().bank().get_balance(USER_A, ID_GENESIS), 200);
    assert_eq!(relay.chain().bank().get_balance(USER_B, ID_GENESIS), 100);
    assert_eq!(
        relay.chain().bank().get_balance(ID_RESERVE, ID_GENESIS),
        INITIAL_TOKEN_SUPPLY - 300
    );
    assert_eq!(relay.chain().chain_config(), &genesis_config());

    // Epochs actually advanced during production (4 slots each).
    assert!(relay.chain().current_epoch() >= 1);
}

#[test]
fn test_rewound_ledger_replays_the_prefix() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1000);
    let keys = bootstrap(dir.path(), &clock);
    let key_a = KeyPair::generate();
    let key_b = KeyPair::generate();

    {
        let mut miner = Miner::init_with_clock(
            &RoleConfig {
                work_dir: dir.path().to_path_buf(),
                time_offset: 0,
                starting_block_id: 0,
            },
            KeyPair::from_seed(keys.reserve.seed()),
            ID_RESERVE,
            Arc::new(clock.clone()),
        )
        .unwrap();
        produce_batches(
            &mut miner,
            &clock,
            vec![
                vec![signed(new_user_tx(USER_A, &key_a), &keys.reserve)],
                vec![signed(new_user_tx(USER_B, &key_b), &keys.reserve)],
                vec![signed(transfer_tx(ID_RESERVE, USER_A, 300), &keys.reserve)],
            ],
        );
        assert_eq!(miner.chain().next_block_id(), 4);
    }

    // Truncate everything after the first user creation.
    {
        let mut ledger = Ledger::mount(&dir.path().join("ledger")).unwrap();
        ledger.rewind_to(2).unwrap();
        assert_eq!(ledger.next_block_id(), 2);
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
    assert_eq!(relay.chain().next_block_id(), 2);
    assert!(relay.chain().bank().has_account(USER_A));
    assert!(!relay.chain().bank().has_account(USER_B));
    assert_eq!(
        relay.chain().bank().get_balance(ID_RESERVE, ID_GENESIS),
        INITIAL_TOKEN_SUPPLY
    );
}
