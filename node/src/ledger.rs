// Durable chain ledger
// ChainNode records in a recursive block store, plus a timestamp index

use pledger_core::{binary_pack, binary_unpack, ChainNode, CodecError};
use pledger_store::{BlockStoreOps, DirDirStore, DirInitConfig, DirMountConfig, StoreError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Subdirectory of the ledger work dir holding the block store.
const STORE_DIR: &str = "store";
/// Per-block timestamp index: the starting block id followed by one
/// big-endian i64 per block.
const TS_INDEX_FILE: &str = "ts.idx";

const DEFAULT_MAX_DIR_COUNT: u64 = 100;
const DEFAULT_MAX_FILE_COUNT: u64 = 100;
const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
const DEFAULT_MAX_LEVEL: u64 = 2;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("block {0} is corrupt: {1}")]
    CorruptBlock(u64, CodecError),
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("ledger directory already exists: {0}")]
    AlreadyExists(String),
    #[error("ledger directory does not exist: {0}")]
    NotFound(String),
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("block id {0} predates this ledger (starts at {1})")]
    BeforeStart(u64, u64),
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LedgerInitConfig {
    pub work_dir: PathBuf,
    /// First block id this ledger holds; 0 for a full chain, higher for
    /// partial relays.
    pub starting_block_id: u64,
}

/// Append-only store of `ChainNode` records with dense block ids.
///
/// Wraps a `DirDirStore` under `<work_dir>/store` and keeps a sibling
/// timestamp index enabling binary search by block time.
pub struct Ledger {
    work_dir: PathBuf,
    store: DirDirStore,
    starting_block_id: u64,
    timestamps: Vec<i64>,
}

impl Ledger {
    /// Create a fresh ledger; the work directory must not exist.
    pub fn init(config: LedgerInitConfig) -> Result<Ledger, LedgerError> {
        if config.work_dir.exists() {
            return Err(LedgerError::AlreadyExists(
                config.work_dir.display().to_string(),
            ));
        }
        fs::create_dir_all(&config.work_dir).map_err(|e| LedgerError::io(&config.work_dir, e))?;
        let store = DirDirStore::init(DirInitConfig {
            dir_path: config.work_dir.join(STORE_DIR),
            max_dir_count: DEFAULT_MAX_DIR_COUNT,
            max_file_count: DEFAULT_MAX_FILE_COUNT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_level: DEFAULT_MAX_LEVEL,
        })?;

        let ledger = Ledger {
            work_dir: config.work_dir,
            store,
            starting_block_id: config.starting_block_id,
            timestamps: Vec::new(),
        };
        ledger.write_ts_index()?;
        info!(
            path = %ledger.work_dir.display(),
            starting_block_id = ledger.starting_block_id,
            "initialized ledger"
        );
        Ok(ledger)
    }

    /// Open an existing ledger without re-validating block contents.
    pub fn mount(work_dir: &Path) -> Result<Ledger, LedgerError> {
        if !work_dir.exists() {
            return Err(LedgerError::NotFound(work_dir.display().to_string()));
        }
        let store = DirDirStore::mount(DirMountConfig {
            dir_path: work_dir.join(STORE_DIR),
            max_dir_count: DEFAULT_MAX_DIR_COUNT,
            max_level: DEFAULT_MAX_LEVEL,
        })?;

        let mut ledger = Ledger {
            work_dir: work_dir.to_path_buf(),
            store,
            starting_block_id: 0,
            timestamps: Vec::new(),
        };
        ledger.load_ts_index()?;
        info!(
            path = %ledger.work_dir.display(),
            blocks = ledger.store.block_count(),
            starting_block_id = ledger.starting_block_id,
            "mounted ledger"
        );
        Ok(ledger)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn starting_block_id(&self) -> u64 {
        self.starting_block_id
    }

    /// One past the last stored block id.
    pub fn next_block_id(&self) -> u64 {
        self.starting_block_id + self.store.block_count()
    }

    fn ts_index_path(&self) -> PathBuf {
        self.work_dir.join(TS_INDEX_FILE)
    }

    fn write_ts_index(&self) -> Result<(), LedgerError> {
        let path = self.ts_index_path();
        let mut raw = Vec::with_capacity(8 + self.timestamps.len() * 8);
        raw.extend_from_slice(&self.starting_block_id.to_be_bytes());
        for ts in &self.timestamps {
            raw.extend_from_slice(&ts.to_be_bytes());
        }
        fs::write(&path, raw).map_err(|e| LedgerError::io(&path, e))
    }

    fn append_ts_index(&self, timestamp: i64) -> Result<(), LedgerError> {
        let path = self.ts_index_path();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::io(&path, e))?;
        file.write_all(&timestamp.to_be_bytes())
            .map_err(|e| LedgerError::io(&path, e))
    }

    /// Load the timestamp index, backfilling from block reads when the
    /// file is missing or short.
    fn load_ts_index(&mut self) -> Result<(), LedgerError> {
        let path = self.ts_index_path();
        let block_count = self.store.block_count();

        match fs::read(&path) {
            Ok(raw) if raw.len() >= 8 => {
                self.starting_block_id = u64::from_be_bytes(raw[0..8].try_into().expect("8 bytes"));
                self.timestamps = raw[8..]
                    .chunks_exact(8)
                    .map(|c| i64::from_be_bytes(c.try_into().expect("8 bytes")))
                    .collect();
            }
            Ok(_) => {
                warn!(path = %path.display(), "timestamp index truncated, rebuilding");
                self.timestamps.clear();
            }
            Err(_) => {
                warn!(path = %path.display(), "timestamp index missing, rebuilding");
                self.timestamps.clear();
            }
        }

        if self.timestamps.len() as u64 > block_count {
            self.timestamps.truncate(block_count as usize);
            self.write_ts_index()?;
        } else if (self.timestamps.len() as u64) < block_count {
            let from = self.timestamps.len() as u64;
            debug!(from, to = block_count, "backfilling timestamp index");
            for i in from..block_count {
                let node = self.read_store_block(i)?;
                self.timestamps.push(node.block.timestamp);
            }
            self.write_ts_index()?;
        }
        Ok(())
    }

    fn read_store_block(&mut self, store_index: u64) -> Result<ChainNode, LedgerError> {
        let raw = match self.store.read_block(store_index) {
            Ok(raw) => raw,
            Err(StoreError::BlockNotFound(_)) | Err(StoreError::OutOfRange { .. }) => {
                return Err(LedgerError::BlockNotFound(
                    self.starting_block_id + store_index,
                ))
            }
            Err(error) => return Err(error.into()),
        };
        binary_unpack(&raw)
            .map_err(|e| LedgerError::CorruptBlock(self.starting_block_id + store_index, e))
    }

    /// Append a block; its id is `next_block_id()`.
    pub fn add_block(&mut self, node: &ChainNode) -> Result<u64, LedgerError> {
        let raw = binary_pack(node);
        self.store.append_block(&raw)?;
        self.timestamps.push(node.block.timestamp);
        self.append_ts_index(node.block.timestamp)?;
        let block_id = self.next_block_id() - 1;
        debug!(block_id, size = raw.len(), "ledger block appended");
        Ok(block_id)
    }

    pub fn read_block(&mut self, block_id: u64) -> Result<ChainNode, LedgerError> {
        if block_id < self.starting_block_id {
            return Err(LedgerError::BeforeStart(block_id, self.starting_block_id));
        }
        self.read_store_block(block_id - self.starting_block_id)
    }

    pub fn read_last_block(&mut self) -> Result<ChainNode, LedgerError> {
        let next = self.next_block_id();
        if next == self.starting_block_id {
            return Err(LedgerError::BlockNotFound(next));
        }
        self.read_block(next - 1)
    }

    /// First block id whose timestamp is at or after `timestamp`
    /// (timestamps are non-decreasing). Equals `next_block_id()` when
    /// every stored block is older.
    pub fn find_block_by_timestamp(&self, timestamp: i64) -> u64 {
        let idx = self.timestamps.partition_point(|&ts| ts < timestamp);
        self.starting_block_id + idx as u64
    }

    /// Truncate so `block_id` becomes the next id to be appended.
    pub fn rewind_to(&mut self, block_id: u64) -> Result<(), LedgerError> {
        if block_id < self.starting_block_id {
            return Err(LedgerError::BeforeStart(block_id, self.starting_block_id));
        }
        self.store.rewind_to(block_id - self.starting_block_id)?;
        self.timestamps
            .truncate((block_id - self.starting_block_id) as usize);
        self.write_ts_index()
    }
}
