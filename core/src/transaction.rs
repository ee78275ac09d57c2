// Transaction model
// Typed ledger operations with detached multi-signatures

use crate::codec::{Codec, InputArchive, OutputArchive};

/// Ledger transaction kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxType {
    /// Plain token transfer.
    Default,
    /// System initialization, only valid in block 0.
    Genesis,
    /// Account creation.
    NewUser,
    /// System configuration update.
    Config,
    /// Account update (wallet replacement).
    User,
    /// Account renewal (refreshes the account's block id).
    Renewal,
    /// Account termination with write-off.
    EndUser,
}

impl TxType {
    pub fn from_u32(value: u32) -> Option<TxType> {
        match value {
            0 => Some(TxType::Default),
            1 => Some(TxType::Genesis),
            2 => Some(TxType::NewUser),
            3 => Some(TxType::Config),
            4 => Some(TxType::User),
            5 => Some(TxType::Renewal),
            6 => Some(TxType::EndUser),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            TxType::Default => 0,
            TxType::Genesis => 1,
            TxType::NewUser => 2,
            TxType::Config => 3,
            TxType::User => 4,
            TxType::Renewal => 5,
            TxType::EndUser => 6,
        }
    }
}

impl Codec for TxType {
    fn encode(&self, ar: &mut OutputArchive) {
        ar.write_u32(self.as_u32());
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        // Unknown discriminants decode to Default; the chain rejects them
        // before application via explicit type checks.
        TxType::from_u32(ar.read_u32()).unwrap_or(TxType::Default)
    }
}

/// A single ledger operation.
///
/// `meta` carries type-specific payload: a serialized wallet for account
/// transactions, the serialized chain configuration for system ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub tx_type: TxType,
    pub token_id: u64,
    pub from_wallet_id: u64,
    pub to_wallet_id: u64,
    pub amount: i64,
    pub fee: i64,
    pub meta: Vec<u8>,
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction {
            tx_type: TxType::Default,
            token_id: 0,
            from_wallet_id: 0,
            to_wallet_id: 0,
            amount: 0,
            fee: 0,
            meta: Vec::new(),
        }
    }
}

impl Codec for Transaction {
    fn encode(&self, ar: &mut OutputArchive) {
        self.tx_type.encode(ar);
        ar.write_u64(self.token_id);
        ar.write_u64(self.from_wallet_id);
        ar.write_u64(self.to_wallet_id);
        ar.write_i64(self.amount);
        ar.write_i64(self.fee);
        ar.write_bytes(&self.meta);
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        Transaction {
            tx_type: TxType::decode(ar),
            token_id: ar.read_u64(),
            from_wallet_id: ar.read_u64(),
            to_wallet_id: ar.read_u64(),
            amount: ar.read_i64(),
            fee: ar.read_i64(),
            meta: ar.read_byte_string(),
        }
    }
}

/// An object together with the detached signatures endorsing it.
///
/// Signatures cover the binary packing of `obj`, not this envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignedData<T> {
    pub obj: T,
    pub signatures: Vec<Vec<u8>>,
}

impl<T: Codec> Codec for SignedData<T> {
    fn encode(&self, ar: &mut OutputArchive) {
        self.obj.encode(ar);
        ar.write_u64(self.signatures.len() as u64);
        for signature in &self.signatures {
            ar.write_bytes(signature);
        }
    }

    fn decode(ar: &mut InputArchive<'_>) -> Self {
        let obj = T::decode(ar);
        let count = ar.read_u64();
        let mut signatures = Vec::new();
        for _ in 0..count {
            if ar.failed() {
                break;
            }
            signatures.push(ar.read_byte_string());
        }
        SignedData { obj, signatures }
    }
}

pub type SignedTx = SignedData<Transaction>;
