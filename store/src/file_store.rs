// Single-file append-only block store
// 24-byte big-endian header, u64 size-prefixed records, lazy index

use crate::{
    BlockStoreOps, StoreError, FILE_MAGIC, FORMAT_VERSION, HEADER_SIZE, MIN_FILE_SIZE,
    SIZE_PREFIX_BYTES,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Clone, Copy)]
struct BlockEntry {
    offset: u64,
    size: u64,
}

/// Append-only store of size-prefixed records in a single file.
///
/// The header records the block count at the last clean update; the
/// authoritative count after a crash comes from the lazy sequential scan,
/// which trusts the file contents over the header.
pub struct FileStore {
    path: PathBuf,
    max_size: u64,
    file: File,
    current_size: u64,
    block_count: u64,
    block_index: Vec<BlockEntry>,
    index_built: bool,
}

impl FileStore {
    /// Create a new store; the file must not exist yet.
    pub fn init(path: &Path, max_size: u64) -> Result<FileStore, StoreError> {
        if max_size < MIN_FILE_SIZE {
            return Err(StoreError::MaxFileSizeTooSmall);
        }
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.display().to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        let mut store = FileStore {
            path: path.to_path_buf(),
            max_size,
            file,
            current_size: HEADER_SIZE,
            block_count: 0,
            block_index: Vec::new(),
            index_built: true,
        };
        store.write_header()?;
        debug!(path = %store.path.display(), "created block file");
        Ok(store)
    }

    /// Open an existing store; the index is not rebuilt until the first
    /// index-keyed read.
    pub fn mount(path: &Path, max_size: u64) -> Result<FileStore, StoreError> {
        if max_size < MIN_FILE_SIZE {
            return Err(StoreError::MaxFileSizeTooSmall);
        }
        if !path.exists() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        let mut store = FileStore {
            path: path.to_path_buf(),
            max_size,
            file,
            current_size: 0,
            block_count: 0,
            block_index: Vec::new(),
            index_built: false,
        };
        let header_count = store.read_header()?;
        store.current_size = store
            .file
            .metadata()
            .map_err(|e| StoreError::io(&store.path, e))?
            .len();
        store.block_count = header_count;
        debug!(
            path = %store.path.display(),
            size = store.current_size,
            blocks = store.block_count,
            "mounted block file"
        );
        Ok(store)
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    fn write_header(&mut self) -> Result<(), StoreError> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&FILE_MAGIC.to_be_bytes());
        header[4..6].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        // bytes 6..8 reserved
        header[8..16].copy_from_slice(&self.block_count.to_be_bytes());
        header[16..24].copy_from_slice(&HEADER_SIZE.to_be_bytes());

        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&header))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Validate the header, returning the recorded block count.
    fn read_header(&mut self) -> Result<u64, StoreError> {
        let mut header = [0u8; HEADER_SIZE as usize];
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_exact(&mut header))
            .map_err(|e| StoreError::io(&self.path, e))?;

        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FILE_MAGIC {
            return Err(StoreError::BadMagic {
                magic,
                path: self.path.display().to_string(),
            });
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        if version > FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                version,
                path: self.path.display().to_string(),
            });
        }
        Ok(u64::from_be_bytes([
            header[8], header[9], header[10], header[11], header[12], header[13], header[14],
            header[15],
        ]))
    }

    /// Rewrite the block count field in place. Best effort after appends;
    /// a lost update is recovered by the scan on the next mount.
    fn update_header_block_count(&mut self) -> Result<(), StoreError> {
        self.file
            .seek(SeekFrom::Start(8))
            .and_then(|_| self.file.write_all(&self.block_count.to_be_bytes()))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Walk the records sequentially, rebuilding the in-memory index.
    /// The scan result wins over the header count.
    fn build_block_index(&mut self) -> Result<(), StoreError> {
        self.block_index.clear();
        let mut offset = HEADER_SIZE;
        let file_end = self.current_size;

        while offset + SIZE_PREFIX_BYTES <= file_end {
            let mut prefix = [0u8; SIZE_PREFIX_BYTES as usize];
            self.file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| self.file.read_exact(&mut prefix))
                .map_err(|e| StoreError::io(&self.path, e))?;
            let size = u64::from_be_bytes(prefix);

            if offset + SIZE_PREFIX_BYTES + size > file_end {
                warn!(
                    path = %self.path.display(),
                    offset,
                    size,
                    "record overruns file end, truncating scan"
                );
                break;
            }

            self.block_index.push(BlockEntry { offset, size });
            offset += SIZE_PREFIX_BYTES + size;
        }

        self.index_built = true;
        if self.block_index.len() as u64 != self.block_count {
            debug!(
                path = %self.path.display(),
                header = self.block_count,
                scanned = self.block_index.len(),
                "block count mismatch, trusting scan"
            );
            self.block_count = self.block_index.len() as u64;
        }
        Ok(())
    }

    fn ensure_block_index(&mut self) -> Result<(), StoreError> {
        if self.index_built {
            return Ok(());
        }
        self.build_block_index()
    }
}

impl BlockStoreOps for FileStore {
    fn can_fit(&self, size: u64) -> bool {
        self.current_size + SIZE_PREFIX_BYTES + size <= self.max_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, StoreError> {
        self.ensure_block_index()?;
        if index >= self.block_index.len() as u64 {
            return Err(StoreError::OutOfRange {
                index,
                count: self.block_index.len() as u64,
            });
        }

        let entry = self.block_index[index as usize];
        let mut data = vec![0u8; entry.size as usize];
        self.file
            .seek(SeekFrom::Start(entry.offset + SIZE_PREFIX_BYTES))
            .and_then(|_| self.file.read_exact(&mut data))
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(data)
    }

    fn append_block(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        let size = data.len() as u64;
        if !self.can_fit(size) {
            return Err(StoreError::CannotFit(size));
        }
        // A mounted file keeps its index lazy; build it before the first
        // append so the in-memory entries stay complete.
        self.ensure_block_index()?;

        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .write_all(&size.to_be_bytes())
            .and_then(|_| self.file.write_all(data))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| StoreError::io(&self.path, e))?;

        self.block_index.push(BlockEntry { offset, size });
        let block_id = self.block_count;
        self.block_count += 1;
        self.current_size += SIZE_PREFIX_BYTES + size;

        if let Err(error) = self.update_header_block_count() {
            warn!(path = %self.path.display(), %error, "failed to update header block count");
        }

        debug!(
            path = %self.path.display(),
            block_id,
            size,
            offset,
            total = self.current_size,
            "wrote block"
        );
        Ok(block_id)
    }

    fn rewind_to(&mut self, index: u64) -> Result<(), StoreError> {
        self.ensure_block_index()?;
        if index > self.block_count {
            return Err(StoreError::RewindBeyondEnd {
                target: index,
                count: self.block_count,
            });
        }
        if index == self.block_count {
            return Ok(());
        }

        let truncate_offset = if index == 0 {
            HEADER_SIZE
        } else {
            self.block_index[index as usize].offset
        };

        self.file
            .set_len(truncate_offset)
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.block_count = index;
        self.current_size = truncate_offset;
        self.block_index.truncate(index as usize);
        self.write_header()?;
        debug!(path = %self.path.display(), blocks = index, "rewound block file");
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Leave the header count consistent on clean shutdown.
        if let Err(error) = self.update_header_block_count() {
            warn!(path = %self.path.display(), %error, "failed to update header on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("f.dat")
    }

    #[test]
    fn test_init_rejects_existing_file_and_small_max() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        assert!(matches!(
            FileStore::init(&path, 1024),
            Err(StoreError::MaxFileSizeTooSmall)
        ));
        let _store = FileStore::init(&path, MIN_FILE_SIZE).unwrap();
        assert!(matches!(
            FileStore::init(&path, MIN_FILE_SIZE),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::init(&store_path(&dir), MIN_FILE_SIZE).unwrap();

        assert_eq!(store.append_block(b"Hello, FileStore!").unwrap(), 0);
        assert_eq!(store.append_block(b"Second block").unwrap(), 1);
        assert_eq!(store.read_block(0).unwrap(), b"Hello, FileStore!");
        assert_eq!(store.read_block(1).unwrap(), b"Second block");
        assert_eq!(store.block_count(), 2);
        // Header (24) + two prefixed records.
        assert_eq!(store.current_size(), 24 + (8 + 17) + (8 + 12));
        assert_eq!(store.current_size(), 69);
        assert!(matches!(
            store.read_block(2),
            Err(StoreError::OutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_mount_resumes_state() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        {
            let mut store = FileStore::init(&path, MIN_FILE_SIZE).unwrap();
            store.append_block(b"Hello, FileStore!").unwrap();
            store.append_block(b"Second block").unwrap();
        }
        let mut store = FileStore::mount(&path, MIN_FILE_SIZE).unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.read_block(1).unwrap(), b"Second block");
    }

    #[test]
    fn test_mount_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FileStore::mount(&store_path(&dir), MIN_FILE_SIZE),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_mount_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        drop(FileStore::init(&path, MIN_FILE_SIZE).unwrap());
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] = 0xFF;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(
            FileStore::mount(&path, MIN_FILE_SIZE),
            Err(StoreError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_can_fit_is_the_admission_rule() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::init(&store_path(&dir), MIN_FILE_SIZE).unwrap();
        let budget = MIN_FILE_SIZE - HEADER_SIZE - SIZE_PREFIX_BYTES;
        assert!(store.can_fit(budget));
        assert!(!store.can_fit(budget + 1));
        assert!(matches!(
            store.append_block(&vec![0u8; (budget + 1) as usize]),
            Err(StoreError::CannotFit(_))
        ));
    }

    #[test]
    fn test_size_invariant_over_append_rewind_sequences() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::init(&store_path(&dir), MIN_FILE_SIZE).unwrap();
        let payloads: [&[u8]; 4] = [b"a", b"bb", b"ccc", b"dddd"];
        for payload in payloads {
            store.append_block(payload).unwrap();
        }
        let expected = |sizes: &[u64]| {
            HEADER_SIZE + sizes.iter().map(|s| SIZE_PREFIX_BYTES + s).sum::<u64>()
        };
        assert_eq!(store.current_size(), expected(&[1, 2, 3, 4]));

        store.rewind_to(2).unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.current_size(), expected(&[1, 2]));
        assert_eq!(store.read_block(1).unwrap(), b"bb");

        store.append_block(b"eeeee").unwrap();
        assert_eq!(store.block_count(), 3);
        assert_eq!(store.current_size(), expected(&[1, 2, 5]));
        assert_eq!(store.read_block(2).unwrap(), b"eeeee");
    }

    #[test]
    fn test_rewind_is_idempotent_and_bounded() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::init(&store_path(&dir), MIN_FILE_SIZE).unwrap();
        for i in 0..5u8 {
            store.append_block(&[i]).unwrap();
        }
        store.rewind_to(3).unwrap();
        store.rewind_to(3).unwrap();
        assert_eq!(store.block_count(), 3);
        // Rewinding forward is a no-op only at the exact count.
        store.rewind_to(3).unwrap();
        assert!(matches!(
            store.rewind_to(4),
            Err(StoreError::RewindBeyondEnd { target: 4, count: 3 })
        ));
    }

    #[test]
    fn test_rewind_to_zero_keeps_only_header() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut store = FileStore::init(&path, MIN_FILE_SIZE).unwrap();
        store.append_block(b"payload").unwrap();
        store.rewind_to(0).unwrap();
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.current_size(), HEADER_SIZE);
        drop(store);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn test_crash_tolerance_header_count_lost() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        {
            let mut store = FileStore::init(&path, MIN_FILE_SIZE).unwrap();
            store.append_block(b"one").unwrap();
            store.append_block(b"two").unwrap();
            store.append_block(b"three").unwrap();
        }
        // Simulate a crash between the record write and the header update:
        // the header claims one block while three full records exist.
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(8)).unwrap();
            file.write_all(&1u64.to_be_bytes()).unwrap();
        }
        let mut store = FileStore::mount(&path, MIN_FILE_SIZE).unwrap();
        // Header value is trusted until the first indexed read...
        assert_eq!(store.block_count(), 1);
        // ...after which the scan recovers the true count.
        assert_eq!(store.read_block(2).unwrap(), b"three");
        assert_eq!(store.block_count(), 3);
    }

    #[test]
    fn test_scan_ignores_partial_trailing_record() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        {
            let mut store = FileStore::init(&path, MIN_FILE_SIZE).unwrap();
            store.append_block(b"whole").unwrap();
        }
        // Append a record prefix claiming more bytes than follow.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u64.to_be_bytes()).unwrap();
            file.write_all(b"short").unwrap();
        }
        let mut store = FileStore::mount(&path, MIN_FILE_SIZE).unwrap();
        assert_eq!(store.read_block(0).unwrap(), b"whole");
        assert_eq!(store.block_count(), 1);
    }
}
