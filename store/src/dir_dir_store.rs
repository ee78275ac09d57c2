// Recursive directory-of-directories block store
// A root file-dir store that relocates into a numbered subdirectory when
// full, then grows sideways and (level permitting) downwards

use crate::file_dir_store::{FileDirInitConfig, FileDirStore};
use crate::{
    numbered_name, BlockStoreOps, StoreError, DIR_DIR_MAGIC, FILE_DIR_MAGIC, FORMAT_VERSION,
    INDEX_FILE_NAME, MIN_FILE_SIZE,
};
use pledger_core::{InputArchive, OutputArchive};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Size of the PLDD idx.dat header: magic, version, reserved, header
/// size, max dir count, max file count, max file size, dir count.
const INDEX_HEADER_SIZE: u64 = 4 + 2 + 2 + 8 + 8 + 8 + 8 + 4;

/// Name the root store is relocated under when the store leaves FILES
/// mode.
const FIRST_SUBDIR: &str = "000001";

#[derive(Clone, Debug)]
pub struct DirInitConfig {
    pub dir_path: PathBuf,
    pub max_dir_count: u64,
    pub max_file_count: u64,
    pub max_file_size: u64,
    /// Recursion bound: 0 keeps all children flat file-dir stores, N
    /// allows N levels of nested dir-dir stores.
    pub max_level: u64,
}

#[derive(Clone, Debug)]
pub struct DirMountConfig {
    pub dir_path: PathBuf,
    /// Governs subdirectory growth while the store is still in FILES
    /// mode; once in DIRS mode the persisted value wins.
    pub max_dir_count: u64,
    pub max_level: u64,
}

/// A subordinate store: flat directory of files, or a nested recursive
/// store.
enum SubStore {
    FileDir(FileDirStore),
    DirDir(Box<DirDirStore>),
}

impl SubStore {
    fn can_fit(&self, size: u64) -> bool {
        match self {
            SubStore::FileDir(s) => s.can_fit(size),
            SubStore::DirDir(s) => s.can_fit(size),
        }
    }

    fn block_count(&self) -> u64 {
        match self {
            SubStore::FileDir(s) => s.block_count(),
            SubStore::DirDir(s) => s.block_count(),
        }
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, StoreError> {
        match self {
            SubStore::FileDir(s) => s.read_block(index),
            SubStore::DirDir(s) => s.read_block(index),
        }
    }

    fn append_block(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        match self {
            SubStore::FileDir(s) => s.append_block(data),
            SubStore::DirDir(s) => s.append_block(data),
        }
    }

    fn rewind_to(&mut self, index: u64) -> Result<(), StoreError> {
        match self {
            SubStore::FileDir(s) => s.rewind_to(index),
            SubStore::DirDir(s) => s.rewind_to(index),
        }
    }
}

struct DirEntry {
    store: Option<SubStore>,
    start_block_id: u64,
    is_recursive: bool,
}

enum Mode {
    /// All data lives in the embedded root file-dir store; its PLID
    /// idx.dat owns the root directory.
    Files,
    /// Data lives in numbered subdirectory stores; the PLDD idx.dat owns
    /// the root directory.
    Dirs,
}

/// Recursive block store over a directory of directories.
///
/// Starts in FILES mode with an embedded `FileDirStore` at the root.
/// When that store is out of room it is relocated into `000001/` and the
/// store switches to DIRS mode, creating numbered sibling stores; when
/// the sibling budget is exhausted the active subdirectory is reopened
/// one level deeper as a nested `DirDirStore`, bounded by `max_level`.
pub struct DirDirStore {
    dir_path: PathBuf,
    max_dir_count: u64,
    max_file_count: u64,
    max_file_size: u64,
    max_level: u64,
    level: u64,
    mode: Mode,
    root: Option<FileDirStore>,
    dirs: BTreeMap<u32, DirEntry>,
    current_dir_id: u32,
    total_block_count: u64,
}

impl DirDirStore {
    /// Create a new store; the directory must not exist yet.
    pub fn init(config: DirInitConfig) -> Result<DirDirStore, StoreError> {
        if config.max_file_size < MIN_FILE_SIZE {
            return Err(StoreError::MaxFileSizeTooSmall);
        }
        if config.max_file_count == 0 {
            return Err(StoreError::ZeroMaxFileCount);
        }
        if config.max_dir_count == 0 {
            return Err(StoreError::ZeroMaxDirCount);
        }
        if config.dir_path.exists() {
            return Err(StoreError::AlreadyExists(
                config.dir_path.display().to_string(),
            ));
        }

        // The embedded root store creates the directory and owns its
        // idx.dat while the store stays in FILES mode.
        let root = FileDirStore::init(FileDirInitConfig {
            dir_path: config.dir_path.clone(),
            max_file_count: config.max_file_count,
            max_file_size: config.max_file_size,
        })?;

        info!(path = %config.dir_path.display(), "initialized dir dir store");
        Ok(DirDirStore {
            dir_path: config.dir_path,
            max_dir_count: config.max_dir_count,
            max_file_count: config.max_file_count,
            max_file_size: config.max_file_size,
            max_level: config.max_level,
            level: 0,
            mode: Mode::Files,
            root: Some(root),
            dirs: BTreeMap::new(),
            current_dir_id: 0,
            total_block_count: 0,
        })
    }

    /// Open an existing store. The idx.dat magic discriminates the mode:
    /// PLID means the root file-dir store still owns the directory, PLDD
    /// means numbered subdirectory stores do.
    pub fn mount(config: DirMountConfig) -> Result<DirDirStore, StoreError> {
        Self::mount_at_level(config, 0)
    }

    fn mount_at_level(config: DirMountConfig, level: u64) -> Result<DirDirStore, StoreError> {
        if !config.dir_path.exists() {
            return Err(StoreError::NotFound(config.dir_path.display().to_string()));
        }
        let index_path = config.dir_path.join(INDEX_FILE_NAME);
        let raw = fs::read(&index_path).map_err(|e| StoreError::io(&index_path, e))?;
        if raw.len() < 4 {
            return Err(StoreError::CorruptIndex(index_path.display().to_string()));
        }
        let magic = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);

        match magic {
            FILE_DIR_MAGIC => {
                let root = FileDirStore::mount(&config.dir_path)?;
                let total = root.block_count();
                info!(
                    path = %config.dir_path.display(),
                    blocks = total,
                    "mounted dir dir store in FILES mode"
                );
                Ok(DirDirStore {
                    max_file_count: root.max_file_count(),
                    max_file_size: root.max_file_size(),
                    dir_path: config.dir_path,
                    max_dir_count: config.max_dir_count,
                    max_level: config.max_level,
                    level,
                    mode: Mode::Files,
                    root: Some(root),
                    dirs: BTreeMap::new(),
                    current_dir_id: 0,
                    total_block_count: total,
                })
            }
            DIR_DIR_MAGIC => {
                let mut store = DirDirStore {
                    dir_path: config.dir_path,
                    max_dir_count: config.max_dir_count,
                    max_file_count: 0,
                    max_file_size: 0,
                    max_level: config.max_level,
                    level,
                    mode: Mode::Dirs,
                    root: None,
                    dirs: BTreeMap::new(),
                    current_dir_id: 0,
                    total_block_count: 0,
                };
                store.load_index(&raw, &index_path)?;
                store.open_subdirectory_stores()?;
                store.recalculate_total_block_count();
                info!(
                    path = %store.dir_path.display(),
                    dirs = store.dirs.len(),
                    blocks = store.total_block_count,
                    "mounted dir dir store in DIRS mode"
                );
                Ok(store)
            }
            magic => Err(StoreError::BadMagic {
                magic,
                path: index_path.display().to_string(),
            }),
        }
    }

    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn dir_count(&self) -> u64 {
        self.dirs.len() as u64
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    fn subdir_path(&self, dir_id: u32) -> PathBuf {
        self.dir_path.join(numbered_name(dir_id))
    }

    fn index_file_path(&self) -> PathBuf {
        self.dir_path.join(INDEX_FILE_NAME)
    }

    fn can_create_recursive(&self) -> bool {
        self.level < self.max_level
    }

    fn load_index(&mut self, raw: &[u8], index_path: &Path) -> Result<(), StoreError> {
        let mut ar = InputArchive::new(raw);
        let _magic = ar.read_u32();
        let version = ar.read_u16();
        let _reserved = ar.read_u16();
        let _header_size = ar.read_u64();
        let max_dir_count = ar.read_u64();
        let max_file_count = ar.read_u64();
        let max_file_size = ar.read_u64();
        let dir_count = ar.read_u32();
        if ar.failed() {
            return Err(StoreError::CorruptIndex(index_path.display().to_string()));
        }
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                version,
                path: index_path.display().to_string(),
            });
        }
        self.max_dir_count = max_dir_count;
        self.max_file_count = max_file_count;
        self.max_file_size = max_file_size;

        for _ in 0..dir_count {
            let dir_id = ar.read_u32();
            let start_block_id = ar.read_u64();
            let is_recursive = ar.read_bool();
            if ar.failed() {
                return Err(StoreError::CorruptIndex(index_path.display().to_string()));
            }
            self.dirs.insert(
                dir_id,
                DirEntry {
                    store: None,
                    start_block_id,
                    is_recursive,
                },
            );
            if dir_id > self.current_dir_id {
                self.current_dir_id = dir_id;
            }
        }
        debug!(
            path = %index_path.display(),
            dirs = self.dirs.len(),
            "loaded dir index"
        );
        Ok(())
    }

    fn save_index(&self) -> Result<(), StoreError> {
        let mut ar = OutputArchive::new();
        ar.write_u32(DIR_DIR_MAGIC);
        ar.write_u16(FORMAT_VERSION);
        ar.write_u16(0);
        ar.write_u64(INDEX_HEADER_SIZE);
        ar.write_u64(self.max_dir_count);
        ar.write_u64(self.max_file_count);
        ar.write_u64(self.max_file_size);
        ar.write_u32(self.dirs.len() as u32);
        for (&dir_id, entry) in &self.dirs {
            ar.write_u32(dir_id);
            ar.write_u64(entry.start_block_id);
            ar.write_bool(entry.is_recursive);
        }
        let index_path = self.index_file_path();
        fs::write(&index_path, ar.into_bytes()).map_err(|e| StoreError::io(&index_path, e))
    }

    fn open_subdirectory_stores(&mut self) -> Result<(), StoreError> {
        let ids: Vec<(u32, bool)> = self
            .dirs
            .iter()
            .map(|(&id, e)| (id, e.is_recursive))
            .collect();
        for (dir_id, is_recursive) in ids {
            let path = self.subdir_path(dir_id);
            if !path.exists() {
                continue;
            }
            let store = if is_recursive {
                SubStore::DirDir(Box::new(DirDirStore::mount_at_level(
                    DirMountConfig {
                        dir_path: path,
                        max_dir_count: self.max_dir_count,
                        max_level: self.max_level,
                    },
                    self.level + 1,
                )?))
            } else {
                SubStore::FileDir(FileDirStore::mount(&path)?)
            };
            if let Some(entry) = self.dirs.get_mut(&dir_id) {
                entry.store = Some(store);
            }
        }
        Ok(())
    }

    fn recalculate_total_block_count(&mut self) {
        self.total_block_count = match &self.mode {
            Mode::Files => self.root.as_ref().map(|r| r.block_count()).unwrap_or(0),
            Mode::Dirs => self
                .dirs
                .values()
                .filter_map(|e| e.store.as_ref())
                .map(SubStore::block_count)
                .sum(),
        };
    }

    /// Map a global block id to its owning subdirectory and local index.
    fn find_block_dir(&self, block_id: u64) -> Option<(u32, u64)> {
        for (&dir_id, entry) in &self.dirs {
            let Some(store) = &entry.store else { continue };
            let count = store.block_count();
            if block_id >= entry.start_block_id && block_id < entry.start_block_id + count {
                return Some((dir_id, block_id - entry.start_block_id));
            }
        }
        None
    }

    /// Leave FILES mode: relocate the embedded root store into the first
    /// numbered subdirectory and start the PLDD index.
    fn transition_to_dirs(&mut self) -> Result<(), StoreError> {
        let mut root = self.root.take().ok_or(StoreError::Full)?;
        info!(
            path = %self.dir_path.display(),
            "root store full, transitioning to DIRS mode"
        );
        root.relocate_to_subdir(FIRST_SUBDIR)?;
        self.dirs.insert(
            1,
            DirEntry {
                store: Some(SubStore::FileDir(root)),
                start_block_id: 0,
                is_recursive: false,
            },
        );
        self.current_dir_id = 1;
        self.mode = Mode::Dirs;
        self.save_index()
    }

    /// Create the next numbered sibling file-dir store.
    fn create_subdir_store(&mut self) -> Result<u32, StoreError> {
        let dir_id = self.current_dir_id + 1;
        let path = self.subdir_path(dir_id);
        let store = FileDirStore::init(FileDirInitConfig {
            dir_path: path.clone(),
            max_file_count: self.max_file_count,
            max_file_size: self.max_file_size,
        })?;
        info!(
            path = %path.display(),
            start_block_id = self.total_block_count,
            "created subdirectory store"
        );
        self.dirs.insert(
            dir_id,
            DirEntry {
                store: Some(SubStore::FileDir(store)),
                start_block_id: self.total_block_count,
                is_recursive: false,
            },
        );
        self.current_dir_id = dir_id;
        Ok(dir_id)
    }

    /// Reopen the active subdirectory one level deeper so it can keep
    /// growing internally.
    fn deepen_current_subdir(&mut self) -> Result<(), StoreError> {
        let dir_id = self.current_dir_id;
        let path = self.subdir_path(dir_id);
        let entry = self.dirs.get_mut(&dir_id).ok_or(StoreError::Full)?;
        if entry.is_recursive {
            // Already as deep as this entry goes; its own level budget is
            // exhausted when its can_fit said no.
            return Err(StoreError::Full);
        }
        // Close the flat store and remount the same directory as a nested
        // recursive store; the PLID index it leaves behind makes the
        // child start in FILES mode.
        entry.store = None;
        let child = DirDirStore::mount_at_level(
            DirMountConfig {
                dir_path: path.clone(),
                max_dir_count: self.max_dir_count,
                max_level: self.max_level,
            },
            self.level + 1,
        )?;
        info!(path = %path.display(), level = self.level + 1, "deepened subdirectory store");
        entry.store = Some(SubStore::DirDir(Box::new(child)));
        entry.is_recursive = true;
        self.save_index()
    }

    /// Resolve the subdirectory that should take the next append,
    /// growing sideways or downwards as needed.
    fn active_dir_id(&mut self, data_size: u64) -> Result<u32, StoreError> {
        if let Some(entry) = self.dirs.get(&self.current_dir_id) {
            if let Some(store) = &entry.store {
                if store.can_fit(data_size) {
                    return Ok(self.current_dir_id);
                }
            }
        }
        if (self.dirs.len() as u64) < self.max_dir_count {
            return self.create_subdir_store();
        }
        if self.can_create_recursive() {
            self.deepen_current_subdir()?;
            return Ok(self.current_dir_id);
        }
        Err(StoreError::Full)
    }
}

impl BlockStoreOps for DirDirStore {
    fn can_fit(&self, size: u64) -> bool {
        if size > self.max_file_size {
            return false;
        }
        match &self.mode {
            Mode::Files => {
                if self.root.as_ref().is_some_and(|r| r.can_fit(size)) {
                    return true;
                }
                // A relocation escape needs room for a sibling next to
                // the relocated root, or a deeper level to grow into.
                self.max_dir_count >= 2 || self.can_create_recursive()
            }
            Mode::Dirs => {
                if let Some(entry) = self.dirs.get(&self.current_dir_id) {
                    if entry.store.as_ref().is_some_and(|s| s.can_fit(size)) {
                        return true;
                    }
                }
                (self.dirs.len() as u64) < self.max_dir_count || self.can_create_recursive()
            }
        }
    }

    fn block_count(&self) -> u64 {
        self.total_block_count
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, StoreError> {
        if matches!(self.mode, Mode::Files) {
            return self
                .root
                .as_mut()
                .ok_or(StoreError::BlockNotFound(index))?
                .read_block(index);
        }
        let (dir_id, within) = self
            .find_block_dir(index)
            .ok_or(StoreError::BlockNotFound(index))?;
        let entry = self
            .dirs
            .get_mut(&dir_id)
            .ok_or(StoreError::BlockNotFound(index))?;
        entry
            .store
            .as_mut()
            .ok_or(StoreError::BlockNotFound(index))?
            .read_block(within)
    }

    fn append_block(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        let size = data.len() as u64;
        if size > self.max_file_size {
            return Err(StoreError::CannotFit(size));
        }

        if matches!(self.mode, Mode::Files) {
            let root = self.root.as_mut().ok_or(StoreError::Full)?;
            if root.can_fit(size) {
                root.append_block(data)?;
                self.total_block_count += 1;
                return Ok(self.total_block_count - 1);
            }
            self.transition_to_dirs()?;
        }

        let dir_id = self.active_dir_id(size)?;
        let entry = self.dirs.get_mut(&dir_id).ok_or(StoreError::Full)?;
        let store = entry.store.as_mut().ok_or(StoreError::Full)?;
        store.append_block(data)?;

        self.total_block_count += 1;
        debug!(
            block_id = self.total_block_count - 1,
            dir_id,
            size,
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

        if matches!(self.mode, Mode::Files) {
            self.root
                .as_mut()
                .ok_or(StoreError::BlockNotFound(index))?
                .rewind_to(index)?;
            self.recalculate_total_block_count();
            return Ok(());
        }

        let (dir_id, within) = self
            .find_block_dir(index)
            .ok_or(StoreError::BlockNotFound(index))?;

        // Remove every later subdirectory, on disk and in the index.
        let stale: Vec<u32> = self.dirs.keys().copied().filter(|&id| id > dir_id).collect();
        for id in stale {
            self.dirs.remove(&id);
            let path = self.subdir_path(id);
            if path.exists() {
                fs::remove_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
            }
        }

        if let Some(entry) = self.dirs.get_mut(&dir_id) {
            if let Some(store) = entry.store.as_mut() {
                store.rewind_to(within)?;
            }
        }

        self.current_dir_id = self.dirs.keys().max().copied().unwrap_or(0);
        self.recalculate_total_block_count();
        self.save_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KIB_200: usize = 200 * 1024;

    fn init_store(dir: &TempDir, max_dir_count: u64, max_level: u64) -> DirDirStore {
        DirDirStore::init(DirInitConfig {
            dir_path: dir.path().join("ledger"),
            max_dir_count,
            max_file_count: 3,
            max_file_size: MIN_FILE_SIZE,
            max_level,
        })
        .unwrap()
    }

    fn payload(tag: u8) -> Vec<u8> {
        vec![tag; KIB_200]
    }

    #[test]
    fn test_init_starts_in_files_mode() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3, 0);
        assert_eq!(store.append_block(&payload(b'a')).unwrap(), 0);

        // The root directory is owned by the embedded store's PLID index.
        let raw = std::fs::read(dir.path().join("ledger/idx.dat")).unwrap();
        let magic = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        assert_eq!(magic, FILE_DIR_MAGIC);
        assert!(dir.path().join("ledger/000001.dat").exists());
    }

    #[test]
    fn test_relocation_into_first_subdir() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3, 0);

        // 1 MiB files hold five 200 KiB records each; three files per
        // store means block 15 forces the transition.
        let mut written = Vec::new();
        for i in 0..16u8 {
            let data = payload(i);
            assert!(store.can_fit(data.len() as u64), "block {i} should fit");
            store.append_block(&data).unwrap();
            written.push(data);
        }

        // The root store moved into 000001/ and a sibling took over.
        assert!(dir.path().join("ledger/000001/idx.dat").exists());
        assert!(dir.path().join("ledger/000001/000001.dat").exists());
        assert!(dir.path().join("ledger/000002/idx.dat").exists());
        let raw = std::fs::read(dir.path().join("ledger/idx.dat")).unwrap();
        let magic = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        assert_eq!(magic, DIR_DIR_MAGIC);

        // Every block written before and after relocation reads back.
        for (i, data) in written.iter().enumerate() {
            assert_eq!(&store.read_block(i as u64).unwrap(), data, "block {i}");
        }
        assert_eq!(store.block_count(), 16);
    }

    #[test]
    fn test_mount_after_relocation() {
        let dir = TempDir::new().unwrap();
        let mut written = Vec::new();
        {
            let mut store = init_store(&dir, 3, 0);
            for i in 0..18u8 {
                let data = payload(i);
                store.append_block(&data).unwrap();
                written.push(data);
            }
        }
        let mut store = DirDirStore::mount(DirMountConfig {
            dir_path: dir.path().join("ledger"),
            max_dir_count: 3,
            max_level: 0,
        })
        .unwrap();
        assert_eq!(store.block_count(), 18);
        for (i, data) in written.iter().enumerate() {
            assert_eq!(&store.read_block(i as u64).unwrap(), data, "block {i}");
        }
        // Appends continue with dense ids.
        assert_eq!(store.append_block(&payload(99)).unwrap(), 18);
    }

    #[test]
    fn test_mount_in_files_mode() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = init_store(&dir, 3, 0);
            store.append_block(&payload(1)).unwrap();
            store.append_block(&payload(2)).unwrap();
        }
        let mut store = DirDirStore::mount(DirMountConfig {
            dir_path: dir.path().join("ledger"),
            max_dir_count: 3,
            max_level: 0,
        })
        .unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.read_block(1).unwrap(), payload(2));
    }

    #[test]
    fn test_capacity_exhaustion_without_recursion() {
        let dir = TempDir::new().unwrap();
        // 2 dirs x 3 files x 5 records = 30 blocks maximum.
        let mut store = init_store(&dir, 2, 0);
        let mut appended = 0u64;
        for i in 0..40u16 {
            if !store.can_fit(KIB_200 as u64) {
                break;
            }
            store.append_block(&payload((i % 251) as u8)).unwrap();
            appended += 1;
        }
        assert_eq!(appended, 30);
        assert!(matches!(
            store.append_block(&payload(0)),
            Err(StoreError::Full)
        ));
    }

    #[test]
    fn test_recursion_extends_capacity() {
        let dir = TempDir::new().unwrap();
        // Flat capacity is 30 blocks; one level of recursion deepens the
        // active subdirectory instead of failing.
        let mut store = init_store(&dir, 2, 1);
        for i in 0..35u16 {
            assert!(store.can_fit(KIB_200 as u64), "block {i} should fit");
            assert_eq!(store.append_block(&payload((i % 251) as u8)).unwrap(), i as u64);
        }
        assert_eq!(store.block_count(), 35);
        // The deepened child is a nested store with its own PLDD index.
        let child_idx = std::fs::read(dir.path().join("ledger/000002/idx.dat")).unwrap();
        let magic = u32::from_be_bytes([child_idx[0], child_idx[1], child_idx[2], child_idx[3]]);
        assert_eq!(magic, DIR_DIR_MAGIC);
        // Reads stay dense across the whole tree.
        for i in 0..35u64 {
            assert_eq!(store.read_block(i).unwrap(), payload((i % 251) as u8));
        }
    }

    #[test]
    fn test_mount_recursive_tree() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = init_store(&dir, 2, 1);
            for i in 0..35u16 {
                store.append_block(&payload((i % 251) as u8)).unwrap();
            }
        }
        let mut store = DirDirStore::mount(DirMountConfig {
            dir_path: dir.path().join("ledger"),
            max_dir_count: 2,
            max_level: 1,
        })
        .unwrap();
        assert_eq!(store.block_count(), 35);
        for i in 0..35u64 {
            assert_eq!(store.read_block(i).unwrap(), payload((i % 251) as u8));
        }
    }

    #[test]
    fn test_rewind_across_subdirs() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3, 0);
        for i in 0..20u8 {
            store.append_block(&payload(i)).unwrap();
        }
        // Block 20 lives in the second subdirectory; rewinding to 12
        // drops later dirs and truncates the owner.
        store.rewind_to(12).unwrap();
        assert_eq!(store.block_count(), 12);
        for i in 0..12u64 {
            assert_eq!(store.read_block(i).unwrap(), payload(i as u8));
        }
        assert!(matches!(
            store.read_block(12),
            Err(StoreError::BlockNotFound(12))
        ));

        // Idempotent, and appends resume densely.
        store.rewind_to(12).unwrap();
        assert_eq!(store.append_block(&payload(77)).unwrap(), 12);
        assert_eq!(store.read_block(12).unwrap(), payload(77));
    }

    #[test]
    fn test_rewind_in_files_mode() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3, 0);
        for i in 0..4u8 {
            store.append_block(&payload(i)).unwrap();
        }
        store.rewind_to(1).unwrap();
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.read_block(0).unwrap(), payload(0));
    }

    #[test]
    fn test_oversized_record_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = init_store(&dir, 3, 0);
        let oversized = vec![0u8; (MIN_FILE_SIZE + 1) as usize];
        assert!(!store.can_fit(oversized.len() as u64));
        assert!(matches!(
            store.append_block(&oversized),
            Err(StoreError::CannotFit(_))
        ));
    }
}
