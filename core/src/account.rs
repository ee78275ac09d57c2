// Account model
// Multi-sig wallets and the user-account metadata carried in transactions

use crate::codec::{Codec, InputArchive, OutputArchive};
use std::collections::BTreeMap;

/// System account holding the chain configuration; its token is the
/// native stake token.
pub const ID_GENESIS: u64 = 0;
/// Reserved fee account (fees are burned; the account exists for layout).
pub const ID_FEE: u64 = 1;
/// Reserve account funded with the initial token supply.
pub const ID_RESERVE: u64 = 2;
/// Sink for balances written off from terminated accounts.
pub const ID_RECYCLE: u64 = 3;
/// First id available to user accounts; everything below is system space.
pub const ID_FIRST_USER: u64 = 1 << 20;

pub const INITIAL_TOKEN_SUPPLY: i64 = 1 << 30;

/// Signing policy and per-token balances of an account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Wallet {
    pub public_keys: Vec<Vec<u8>>,
    pub min_signatures: u32,
    pub balances: BTreeMap<u64, i64>,
}

impl Codec for Wallet {
    fn encode(&self, ar: &mut OutputArchive) {
        ar.write_u64(self.public_keys.len() as u64);
        for key in &self.public_keys {
            ar.write_bytes(key);
        }
        ar.write_u32(self.min_signatures);
        self.balances.encode(ar);
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        let key_count = ar.read_u64();
        let mut public_keys = Vec::new();
        for _ in 0..key_count {
            if ar.failed() {
                break;
            }
            public_keys.push(ar.read_byte_string());
        }
        Wallet {
            public_keys,
            min_signatures: ar.read_u32(),
            balances: BTreeMap::decode(ar),
        }
    }
}

/// Account metadata as carried in transaction payloads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserAccount {
    pub wallet: Wallet,
    pub meta: String,
}

impl Codec for UserAccount {
    fn encode(&self, ar: &mut OutputArchive) {
        self.wallet.encode(ar);
        self.meta.encode(ar);
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        UserAccount {
            wallet: Wallet::decode(ar),
            meta: String::decode(ar),
        }
    }
}
