// pledger-store
// Append-only block storage: single file, directory of files, and a
// recursive directory of directories

pub mod dir_dir_store;
pub mod file_dir_store;
pub mod file_store;

pub use dir_dir_store::{DirDirStore, DirInitConfig, DirMountConfig};
pub use file_dir_store::{FileDirStore, FileDirInitConfig};
pub use file_store::FileStore;

use std::io;
use std::path::Path;
use thiserror::Error;

/// Magic of a block file header ("PLFB").
pub const FILE_MAGIC: u32 = 0x504C_4642;
/// Magic of a file-directory index ("PLID").
pub const FILE_DIR_MAGIC: u32 = 0x504C_4944;
/// Magic of a directory-directory index ("PLDD").
pub const DIR_DIR_MAGIC: u32 = 0x504C_4444;

pub const FORMAT_VERSION: u16 = 1;

/// Smallest permitted per-file capacity.
pub const MIN_FILE_SIZE: u64 = 1024 * 1024;

/// Size of the block file header in bytes.
pub const HEADER_SIZE: u64 = 24;
/// Size of the per-record length prefix in bytes.
pub const SIZE_PREFIX_BYTES: u64 = 8;

/// Index file name shared by the directory stores; the header magic
/// discriminates which store owns it.
pub const INDEX_FILE_NAME: &str = "idx.dat";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O failure at {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("already exists: {0} (use mount to load an existing store)")]
    AlreadyExists(String),
    #[error("does not exist: {0} (use init to create a new store)")]
    NotFound(String),
    #[error("max file size must be at least 1 MiB")]
    MaxFileSizeTooSmall,
    #[error("max file count must be greater than 0")]
    ZeroMaxFileCount,
    #[error("max dir count must be greater than 0")]
    ZeroMaxDirCount,
    #[error("invalid magic 0x{magic:08X} in {path}")]
    BadMagic { magic: u32, path: String },
    #[error("unsupported format version {version} in {path}")]
    UnsupportedVersion { version: u16, path: String },
    #[error("corrupt index file {0}")]
    CorruptIndex(String),
    #[error("block {index} out of range (count: {count})")]
    OutOfRange { index: u64, count: u64 },
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("cannot fit {0} bytes")]
    CannotFit(u64),
    #[error("cannot rewind to {target} (count: {count})")]
    RewindBeyondEnd { target: u64, count: u64 },
    #[error("store is full")]
    Full,
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Operations shared by every block store layer.
///
/// Block ids are dense and monotonic from 0; `append_block` returns the
/// id assigned to the new block.
pub trait BlockStoreOps {
    fn can_fit(&self, size: u64) -> bool;
    fn block_count(&self) -> u64;
    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, StoreError>;
    fn append_block(&mut self, data: &[u8]) -> Result<u64, StoreError>;
    fn rewind_to(&mut self, index: u64) -> Result<(), StoreError>;
}

/// Zero-padded six-digit name used for numbered files and directories.
pub(crate) fn numbered_name(id: u32) -> String {
    format!("{id:06}")
}
