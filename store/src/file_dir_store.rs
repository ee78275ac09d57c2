// Directory of block files
// Numbered FileStores plus an idx.dat mapping file ids to start block ids

use crate::file_store::FileStore;
use crate::{
    numbered_name, BlockStoreOps, StoreError, FILE_DIR_MAGIC, FORMAT_VERSION, INDEX_FILE_NAME,
    MIN_FILE_SIZE,
};
use pledger_core::{InputArchive, OutputArchive};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Size of the idx.dat header: magic, version, reserved, header size,
/// max file count, max file size.
const INDEX_HEADER_SIZE: u64 = 4 + 2 + 2 + 8 + 8 + 8;

#[derive(Clone, Debug)]
pub struct FileDirInitConfig {
    pub dir_path: PathBuf,
    pub max_file_count: u64,
    pub max_file_size: u64,
}

struct FileEntry {
    store: Option<FileStore>,
    start_block_id: u64,
}

/// Block store spreading records over numbered `FileStore` files.
///
/// `idx.dat` persists the configured limits and the start block id of
/// every file; it is rewritten after each append and rewind so a mount
/// never has to scan the directory.
pub struct FileDirStore {
    dir_path: PathBuf,
    max_file_count: u64,
    max_file_size: u64,
    entries: BTreeMap<u32, FileEntry>,
    current_file_id: u32,
    total_block_count: u64,
}

impl FileDirStore {
    /// Create a new store; the directory must not exist yet.
    pub fn init(config: FileDirInitConfig) -> Result<FileDirStore, StoreError> {
        if config.max_file_size < MIN_FILE_SIZE {
            return Err(StoreError::MaxFileSizeTooSmall);
        }
        if config.max_file_count == 0 {
            return Err(StoreError::ZeroMaxFileCount);
        }
        if config.dir_path.exists() {
            return Err(StoreError::AlreadyExists(
                config.dir_path.display().to_string(),
            ));
        }
        fs::create_dir_all(&config.dir_path).map_err(|e| StoreError::io(&config.dir_path, e))?;

        let store = FileDirStore {
            dir_path: config.dir_path,
            max_file_count: config.max_file_count,
            max_file_size: config.max_file_size,
            entries: BTreeMap::new(),
            current_file_id: 0,
            total_block_count: 0,
        };
        store.save_index()?;
        info!(path = %store.dir_path.display(), "initialized file dir store");
        Ok(store)
    }

    /// Open an existing store. The limits come from the idx.dat header,
    /// not from the caller.
    pub fn mount(dir_path: &Path) -> Result<FileDirStore, StoreError> {
        if !dir_path.exists() {
            return Err(StoreError::NotFound(dir_path.display().to_string()));
        }

        let mut store = FileDirStore {
            dir_path: dir_path.to_path_buf(),
            max_file_count: 0,
            max_file_size: 0,
            entries: BTreeMap::new(),
            current_file_id: 0,
            total_block_count: 0,
        };
        store.load_index()?;
        store.open_existing_block_files()?;
        store.recalculate_total_block_count();
        info!(
            path = %store.dir_path.display(),
            files = store.entries.len(),
            blocks = store.total_block_count,
            "mounted file dir store"
        );
        Ok(store)
    }

    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    pub fn file_count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn max_file_count(&self) -> u64 {
        self.max_file_count
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    fn index_file_path(&self) -> PathBuf {
        self.dir_path.join(INDEX_FILE_NAME)
    }

    fn block_file_path(&self, file_id: u32) -> PathBuf {
        self.dir_path.join(format!("{}.dat", numbered_name(file_id)))
    }

    fn open_existing_block_files(&mut self) -> Result<(), StoreError> {
        let paths: Vec<(u32, PathBuf)> = self
            .entries
            .keys()
            .map(|&id| (id, self.block_file_path(id)))
            .collect();
        for (file_id, path) in paths {
            if !path.exists() {
                warn!(path = %path.display(), "indexed block file missing, skipping");
                continue;
            }
            let store = FileStore::mount(&path, self.max_file_size)?;
            debug!(path = %path.display(), blocks = store.block_count(), "opened block file");
            if let Some(entry) = self.entries.get_mut(&file_id) {
                entry.store = Some(store);
            }
        }
        Ok(())
    }

    fn recalculate_total_block_count(&mut self) {
        self.total_block_count = self
            .entries
            .values()
            .filter_map(|e| e.store.as_ref())
            .map(FileStore::block_count)
            .sum();
    }

    /// Create the next numbered block file, recording its start block id.
    fn create_block_file(&mut self) -> Result<u32, StoreError> {
        let file_id = self.current_file_id + 1;
        let path = self.block_file_path(file_id);
        let store = FileStore::init(&path, self.max_file_size)?;
        info!(
            path = %path.display(),
            start_block_id = self.total_block_count,
            "created block file"
        );
        self.entries.insert(
            file_id,
            FileEntry {
                store: Some(store),
                start_block_id: self.total_block_count,
            },
        );
        self.current_file_id = file_id;
        Ok(file_id)
    }

    /// Resolve the file that should take the next append, creating a new
    /// one when the active file is out of room.
    fn active_file_id(&mut self, data_size: u64) -> Result<u32, StoreError> {
        if let Some(entry) = self.entries.get(&self.current_file_id) {
            if let Some(store) = &entry.store {
                if store.can_fit(data_size) {
                    return Ok(self.current_file_id);
                }
            }
        }
        if self.entries.len() as u64 >= self.max_file_count {
            return Err(StoreError::Full);
        }
        self.create_block_file()
    }

    /// Map a global block id to its owning file and in-file index.
    fn find_block_file(&self, block_id: u64) -> Option<(u32, u64)> {
        for (&file_id, entry) in &self.entries {
            let Some(store) = &entry.store else { continue };
            let count = store.block_count();
            if block_id >= entry.start_block_id && block_id < entry.start_block_id + count {
                return Some((file_id, block_id - entry.start_block_id));
            }
        }
        None
    }

    fn load_index(&mut self) -> Result<(), StoreError> {
        let index_path = self.index_file_path();
        let raw = fs::read(&index_path).map_err(|e| StoreError::io(&index_path, e))?;
        let mut ar = InputArchive::new(&raw);

        let magic = ar.read_u32();
        let version = ar.read_u16();
        let _reserved = ar.read_u16();
        let _header_size = ar.read_u64();
        let max_file_count = ar.read_u64();
        let max_file_size = ar.read_u64();
        if ar.failed() {
            return Err(StoreError::CorruptIndex(index_path.display().to_string()));
        }
        if magic != FILE_DIR_MAGIC {
            return Err(StoreError::BadMagic {
                magic,
                path: index_path.display().to_string(),
            });
        }
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                version,
                path: index_path.display().to_string(),
            });
        }
        self.max_file_count = max_file_count;
        self.max_file_size = max_file_size;

        while ar.remaining() >= 12 {
            let file_id = ar.read_u32();
            let start_block_id = ar.read_u64();
            if ar.failed() {
                return Err(StoreError::CorruptIndex(index_path.display().to_string()));
            }
            self.entries.insert(
                file_id,
                FileEntry {
                    store: None,
                    start_block_id,
                },
            );
            if file_id > self.current_file_id {
                self.current_file_id = file_id;
            }
        }
        debug!(
            path = %index_path.display(),
            files = self.entries.len(),
            "loaded file index"
        );
        Ok(())
    }

    fn save_index(&self) -> Result<(), StoreError> {
        let mut ar = OutputArchive::new();
        ar.write_u32(FILE_DIR_MAGIC);
        ar.write_u16(FORMAT_VERSION);
        ar.write_u16(0);
        ar.write_u64(INDEX_HEADER_SIZE);
        ar.write_u64(self.max_file_count);
        ar.write_u64(self.max_file_size);
        for (&file_id, entry) in &self.entries {
            ar.write_u32(file_id);
            ar.write_u64(entry.start_block_id);
        }
        let index_path = self.index_file_path();
        fs::write(&index_path, ar.into_bytes()).map_err(|e| StoreError::io(&index_path, e))
    }

    /// Nest this store one directory level deeper.
    ///
    /// Closes every block file, renames the directory through a temporary
    /// sibling into `<dir>/<subdir_name>`, then reopens the files at the
    /// new location. Returns the new directory path.
    pub fn relocate_to_subdir(&mut self, subdir_name: &str) -> Result<PathBuf, StoreError> {
        info!(
            path = %self.dir_path.display(),
            subdir = subdir_name,
            "relocating store into subdirectory"
        );
        for entry in self.entries.values_mut() {
            entry.store = None;
        }
        self.save_index()?;

        let dir_name = self
            .dir_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let temp_path = self.dir_path.with_file_name(format!("{dir_name}.relocating"));

        fs::rename(&self.dir_path, &temp_path).map_err(|e| StoreError::io(&self.dir_path, e))?;
        fs::create_dir(&self.dir_path).map_err(|e| StoreError::io(&self.dir_path, e))?;
        let target = self.dir_path.join(subdir_name);
        fs::rename(&temp_path, &target).map_err(|e| StoreError::io(&temp_path, e))?;

        self.dir_path = target.clone();
        self.open_existing_block_files()?;
        info!(path = %target.display(), "relocated store");
        Ok(target)
    }
}

impl BlockStoreOps for FileDirStore {
    fn can_fit(&self, size: u64) -> bool {
        // A record larger than a whole file can never be stored.
        if size > self.max_file_size {
            return false;
        }
        if let Some(entry) = self.entries.get(&self.current_file_id) {
            if let Some(store) = &entry.store {
                if store.can_fit(size) {
                    return true;
                }
            }
        }
        (self.entries.len() as u64) < self.max_file_count
    }

    fn block_count(&self) -> u64 {
        self.total_block_count
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, StoreError> {
        let (file_id, within) = self
            .find_block_file(index)
            .ok_or(StoreError::BlockNotFound(index))?;
        let entry = self
            .entries
            .get_mut(&file_id)
            .ok_or(StoreError::BlockNotFound(index))?;
        let store = entry
            .store
            .as_mut()
            .ok_or(StoreError::BlockNotFound(index))?;
        store.read_block(within)
    }

    fn append_block(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        let file_id = self.active_file_id(data.len() as u64)?;
        let entry = self
            .entries
            .get_mut(&file_id)
            .ok_or(StoreError::BlockNotFound(self.total_block_count))?;
        let store = entry.store.as_mut().ok_or(StoreError::Full)?;
        store.append_block(data)?;

        self.total_block_count += 1;
        debug!(
            block_id = self.total_block_count - 1,
            file_id,
            size = data.len(),
            "appended block"
        );
        self.save_index()?;
        Ok(self.total_block_count - 1)
    }

    fn rewind_to(&mut self, index: u64) -> Result<(), StoreError> {
        if index > self.total_block_count {
            return Err(StoreError::RewindBeyondEnd {
                target: index,
                count: self.total_block_count,
            });
        }
        if index == self.total_block_count {
            return Ok(());
        }

        let (file_id, within) = self
            .find_block_file(index)
            .ok_or(StoreError::BlockNotFound(index))?;

        // Remove every later file, on disk and in the index.
        let stale: Vec<u32> = self.entries.keys().copied().filter(|&id| id > file_id).collect();
        for id in stale {
            self.entries.remove(&id);
            let path = self.block_file_path(id);
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            }
        }

        if let Some(entry) = self.entries.get_mut(&file_id) {
            if let Some(store) = entry.store.as_mut() {
                store.rewind_to(within)?;
            }
        }

        self.current_file_id = self.entries.keys().max().copied().unwrap_or(0);
        self.recalculate_total_block_count();
        self.save_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_store(dir: &TempDir, max_file_count: u64) -> FileDirStore {
        FileDirStore::init(FileDirInitConfig {
            dir_path: dir.path().join("blocks"),
            max_file_count,
            max_file_size: MIN_FILE_SIZE,
        })
        .unwrap()
    }

    /// A payload sized so only `per_file` of them fit in a 1 MiB file.
    fn sized_payload(per_file: u64, tag: u8) -> Vec<u8> {
        let usable = MIN_FILE_SIZE - crate::HEADER_SIZE;
        let record = usable / per_file;
        vec![tag; (record - crate::SIZE_PREFIX_BYTES) as usize]
    }

    #[test]
    fn test_init_rejects_existing_dir() {
        let dir = TempDir::new().unwrap();
        let _store = init_store(&dir, 2);
        assert!(matches!(
            FileDirStore::init(FileDirInitConfig {
                dir_path: dir.path().join("blocks"),
                max_file_count: 2,
                max_file_size: MIN_FILE_SIZE,
            }),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_overflow_creates_second_file() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 2);
        let payload = sized_payload(2, b'x');

        assert_eq!(store.append_block(&payload).unwrap(), 0);
        assert_eq!(store.append_block(&payload).unwrap(), 1);
        // Third record does not fit in file 1 anymore.
        assert_eq!(store.append_block(&payload).unwrap(), 2);

        assert!(dir.path().join("blocks/000001.dat").exists());
        assert!(dir.path().join("blocks/000002.dat").exists());
        assert_eq!(store.file_count(), 2);

        // idx.dat carries both (file id, start block id) entries.
        let raw = std::fs::read(dir.path().join("blocks/idx.dat")).unwrap();
        assert_eq!(raw.len() as u64, INDEX_HEADER_SIZE + 2 * 12);
        let mut ar = InputArchive::new(&raw[INDEX_HEADER_SIZE as usize..]);
        assert_eq!(ar.read_u32(), 1);
        assert_eq!(ar.read_u64(), 0);
        assert_eq!(ar.read_u32(), 2);
        assert_eq!(ar.read_u64(), 2);
    }

    #[test]
    fn test_reads_are_dense_across_files() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3);
        let mut payloads = Vec::new();
        for i in 0..6u8 {
            let mut payload = sized_payload(2, b'0' + i);
            payload[0] = i;
            payloads.push(payload.clone());
            store.append_block(&payload).unwrap();
        }
        assert_eq!(store.block_count(), 6);
        for (i, payload) in payloads.iter().enumerate() {
            assert_eq!(&store.read_block(i as u64).unwrap(), payload);
        }
        assert!(matches!(
            store.read_block(6),
            Err(StoreError::BlockNotFound(6))
        ));
    }

    #[test]
    fn test_full_store_rejects_append() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 1);
        let payload = sized_payload(2, b'y');
        store.append_block(&payload).unwrap();
        store.append_block(&payload).unwrap();
        assert!(!store.can_fit(payload.len() as u64));
        assert!(matches!(store.append_block(&payload), Err(StoreError::Full)));
    }

    #[test]
    fn test_mount_restores_limits_and_blocks() {
        let dir = TempDir::new().unwrap();
        let payload = sized_payload(2, b'z');
        {
            let mut store = init_store(&dir, 2);
            for _ in 0..3 {
                store.append_block(&payload).unwrap();
            }
        }
        let mut store = FileDirStore::mount(&dir.path().join("blocks")).unwrap();
        assert_eq!(store.max_file_count(), 2);
        assert_eq!(store.max_file_size(), MIN_FILE_SIZE);
        assert_eq!(store.block_count(), 3);
        assert_eq!(store.read_block(2).unwrap(), payload);
        // Limits persisted in the index keep governing admission.
        store.append_block(&payload).unwrap();
        assert!(matches!(store.append_block(&payload), Err(StoreError::Full)));
    }

    #[test]
    fn test_rewind_drops_later_files() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3);
        let payload = sized_payload(2, b'w');
        for _ in 0..5 {
            store.append_block(&payload).unwrap();
        }
        assert_eq!(store.file_count(), 3);

        store.rewind_to(2).unwrap();
        assert_eq!(store.block_count(), 2);
        // The owning file is truncated in place; only later files go.
        assert_eq!(store.file_count(), 2);
        assert!(dir.path().join("blocks/000002.dat").exists());
        assert!(!dir.path().join("blocks/000003.dat").exists());

        // Appends resume from the rewound position.
        assert_eq!(store.append_block(&payload).unwrap(), 2);
        assert_eq!(store.read_block(2).unwrap(), payload);
    }

    #[test]
    fn test_rewind_to_zero_and_idempotence() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3);
        let payload = sized_payload(2, b'v');
        for _ in 0..4 {
            store.append_block(&payload).unwrap();
        }
        store.rewind_to(0).unwrap();
        store.rewind_to(0).unwrap();
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.append_block(&payload).unwrap(), 0);
    }

    #[test]
    fn test_relocate_to_subdir_preserves_blocks() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3);
        let payload = sized_payload(2, b'r');
        for _ in 0..3 {
            store.append_block(&payload).unwrap();
        }
        let new_path = store.relocate_to_subdir("000001").unwrap();
        assert_eq!(new_path, dir.path().join("blocks/000001"));
        assert!(new_path.join("idx.dat").exists());
        assert!(new_path.join("000001.dat").exists());
        assert_eq!(store.block_count(), 3);
        assert_eq!(store.read_block(1).unwrap(), payload);

        // The store keeps working at its new location.
        store.append_block(&payload).unwrap();
        assert_eq!(store.read_block(3).unwrap(), payload);
    }
}
