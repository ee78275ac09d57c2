// pledger-core
// Binary codec, crypto primitives, and the shared ledger data model

pub mod account;
pub mod block;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod transaction;

pub use account::{
    UserAccount, Wallet, ID_FEE, ID_FIRST_USER, ID_GENESIS, ID_RECYCLE, ID_RESERVE,
    INITIAL_TOKEN_SUPPLY,
};
pub use block::{Block, ChainNode, GENESIS_PREVIOUS_HASH};
pub use codec::{binary_pack, binary_unpack, Codec, CodecError, InputArchive, OutputArchive};
pub use config::{ChainConfig, CheckpointConfig, GenesisAccountMeta};
pub use crypto::{
    ed25519_verify, load_private_key, save_private_key, sha256_hex, CryptoError, KeyPair,
    PRIVATE_KEY_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
pub use transaction::{SignedData, SignedTx, Transaction, TxType};
