//! VFS operations - the main interface.

use crate::config::VfsConfig;
use crate::crypto::{BlockCipher, KeyDerivation};
use crate::error::{Error, Result};
use crate::storage::{BlockDevice, BlockStore, FileDevice, RandomSource};
use crate::vfs::branch::Branch;
use crate::vfs::chain::{self, ChainWalk, LoadMode};
use crate::vfs::flush::{FlushController, FlushDecision};
use crate::vfs::path::VfsPath;
use crate::vfs::table::DirectoryTable;
use crate::vfs::types::{BlockRef, DirEntry, EntryStat};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What happened while mounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountReport {
    /// Entries in the active branch's table, root included.
    pub loaded_entries: usize,
    /// The active branch had no valid directory and starts out empty.
    pub fell_back_to_empty: bool,
    /// Branches mounted mark-only.
    pub locked_branches: usize,
    /// Blocks held for those branches.
    pub reserved_blocks: u64,
}

/// VFS information summary.
#[derive(Debug, Clone, Serialize)]
pub struct VfsInfo {
    pub block_size: u32,
    pub block_count: u32,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub reserved_blocks: u64,
    pub chain_blocks: usize,
    pub file_count: usize,
    pub dir_count: usize,
    pub total_file_size: u64,
    pub read_only: bool,
    pub faults: u64,
}

/// One mounted branch over a shared block pool.
///
/// The engine is single-threaded: one caller drives every operation. The
/// deferred flush is not a background thread; call [`ChaffVfs::tick`]
/// periodically from the same thread. There is no flush on drop, so end a
/// session with [`ChaffVfs::unmount`].
pub struct ChaffVfs<D: BlockDevice> {
    store: BlockStore<D>,
    cipher: BlockCipher,
    table: DirectoryTable,
    /// Branch-start block.
    start: u32,
    /// Blocks holding the directory chain currently on disk.
    journal: Vec<u32>,
    flush: FlushController,
    durable: bool,
    /// Set when an encrypted data write failed.
    write_failed: bool,
    report: MountReport,
}

impl ChaffVfs<FileDevice> {
    /// Mount a backing file, reading randomness from the configured source.
    pub fn open<S: AsRef<str>>(path: &Path, config: VfsConfig, passphrases: &[S]) -> Result<Self> {
        let device = FileDevice::open(path)?;
        Self::mount(device, config, passphrases)
    }
}

impl<D: BlockDevice> ChaffVfs<D> {
    /// Mount `passphrases` over `device`.
    ///
    /// Every passphrase but the last is mounted mark-only: its blocks are
    /// reserved so the active branch never overwrites them, but its
    /// directory is never materialized. The last passphrase is the active
    /// read-write branch.
    pub fn mount<S: AsRef<str>>(device: D, config: VfsConfig, passphrases: &[S]) -> Result<Self> {
        let rng = RandomSource::from_config(&config)?;
        Self::mount_with(device, rng, config, passphrases)
    }

    /// Like [`ChaffVfs::mount`] with an explicit randomness source.
    pub fn mount_with<S: AsRef<str>>(
        device: D,
        rng: RandomSource,
        config: VfsConfig,
        passphrases: &[S],
    ) -> Result<Self> {
        config.validate()?;
        let Some((active, locked)) = passphrases.split_last() else {
            return Err(Error::InvalidBranch("no passphrase given".to_string()));
        };

        let mut store = BlockStore::open(device, rng, &config)?;
        let kdf = KeyDerivation::new(&config.kdf);
        let count = store.block_count();
        let mut report = MountReport::default();

        for passphrase in locked {
            let branch = Branch::unlock(passphrase.as_ref(), count, &config.cipher, &kdf)?;
            reserve_branch(&mut store, &branch)?;
            report.locked_branches += 1;
        }
        report.reserved_blocks = store.reserved_blocks();

        let Branch { start, cipher } =
            Branch::unlock(active.as_ref(), count, &config.cipher, &kdf)?;
        if store.is_used(start) {
            return Err(Error::InvalidBranch(format!(
                "start block {} is already used by another branch",
                start
            )));
        }

        let (table, journal) = match chain::load(&store, &cipher, start, LoadMode::Full) {
            Ok(loaded) => {
                for &index in loaded.chain_blocks.iter().chain(&loaded.data_blocks) {
                    store.mark_used(index)?;
                }
                let table = loaded
                    .table
                    .unwrap_or_else(|| DirectoryTable::new(config.block_size));
                (table, loaded.chain_blocks)
            }
            Err(Error::CorruptChain(reason)) => {
                warn!(
                    start,
                    %reason,
                    "no valid directory for this passphrase, starting with an empty root"
                );
                store.mark_used(start)?;
                report.fell_back_to_empty = true;
                (DirectoryTable::new(config.block_size), vec![start])
            }
            Err(e) => return Err(e),
        };
        store.set_sentinel(start);
        report.loaded_entries = table.len();

        info!(
            blocks = count,
            block_size = config.block_size,
            used = store.used_blocks(),
            entries = table.len(),
            locked_branches = report.locked_branches,
            "mounted branch"
        );

        Ok(Self {
            store,
            cipher,
            table,
            start,
            journal,
            flush: FlushController::new(&config),
            durable: config.sync,
            write_failed: false,
            report,
        })
    }

    pub fn report(&self) -> &MountReport {
        &self.report
    }

    pub fn block_size(&self) -> u32 {
        self.store.block_size()
    }

    /// Branch-start block of the active branch.
    pub fn start_block(&self) -> u32 {
        self.start
    }

    /// Blocks of the directory chain currently on disk.
    pub fn journal(&self) -> &[u32] {
        &self.journal
    }

    pub fn is_dirty(&self) -> bool {
        self.flush.is_dirty()
    }

    pub fn is_read_only(&self) -> bool {
        self.write_failed || self.store.is_read_only()
    }

    pub fn store(&self) -> &BlockStore<D> {
        &self.store
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn check_parent(&self, path: &VfsPath) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidPath("the root has no parent".to_string()))?;
        match self.table.find(&parent.lookup_key()) {
            None => Err(Error::NotFound(parent.to_string())),
            Some(entry) if !entry.is_directory() => Err(Error::NotADirectory(parent.to_string())),
            Some(_) => Ok(()),
        }
    }

    /// Get file or directory info.
    pub fn stat(&self, path: &str) -> Result<EntryStat> {
        let vfs_path = VfsPath::parse(path)?;
        self.table
            .find(&vfs_path.lookup_key())
            .map(EntryStat::from_entry)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    /// Data blocks of a file, in file order.
    pub fn blocks(&self, path: &str) -> Result<&[BlockRef]> {
        let vfs_path = VfsPath::parse(path)?;
        self.table
            .find(&vfs_path.lookup_key())
            .map(|entry| entry.blocks.as_slice())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    /// List directory contents, sorted by name.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let vfs_path = VfsPath::parse(path)?;
        let dir = self
            .table
            .find(&vfs_path.lookup_key())
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if !dir.is_directory() {
            return Err(Error::NotADirectory(path.to_string()));
        }

        let mut entries: Vec<DirEntry> = self
            .table
            .children(&dir.path)
            .map(DirEntry::from_entry)
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Create an empty regular file.
    pub fn create_file(&mut self, path: &str) -> Result<()> {
        self.create(path, false)
    }

    /// Create a directory.
    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        self.create(path, true)
    }

    fn create(&mut self, path: &str, directory: bool) -> Result<()> {
        self.ensure_writable()?;
        let vfs_path = VfsPath::parse(path)?;
        if vfs_path.is_root() {
            return Err(Error::AlreadyExists("/".to_string()));
        }
        self.check_parent(&vfs_path)?;

        let key = if directory {
            vfs_path.dir_key()
        } else {
            vfs_path.lookup_key()
        };
        self.table.create(key)?;
        debug!(path = %vfs_path, directory, "created entry");

        self.touch(0);
        Ok(())
    }

    /// Delete a regular file, shredding its blocks.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let vfs_path = VfsPath::parse(path)?;
        let key = vfs_path.lookup_key();
        let entry = self
            .table
            .find(&key)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(Error::IsADirectory(path.to_string()));
        }

        let removed = self.table.remove(&key, &mut self.store)?;
        debug!(path = %vfs_path, blocks = removed.blocks.len(), "removed file");

        self.touch(0);
        Ok(())
    }

    /// Delete an empty directory.
    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let vfs_path = VfsPath::parse(path)?;
        if vfs_path.is_root() {
            return Err(Error::InvalidPath("cannot remove the root directory".to_string()));
        }
        let entry = self
            .table
            .find(&vfs_path.lookup_key())
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if !entry.is_directory() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        if self.table.has_children(&entry.path) {
            return Err(Error::NotEmpty(path.to_string()));
        }

        self.table.remove(&vfs_path.lookup_key(), &mut self.store)?;
        debug!(path = %vfs_path, "removed directory");

        self.touch(0);
        Ok(())
    }

    /// Move an entry. A directory takes everything below it along; an
    /// existing regular file at `to` is replaced by a regular file.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.ensure_writable()?;
        let from_path = VfsPath::parse(from)?;
        let to_path = VfsPath::parse(to)?;
        if from_path.is_root() || to_path.is_root() {
            return Err(Error::InvalidPath("cannot rename the root directory".to_string()));
        }

        let source = self
            .table
            .find(&from_path.lookup_key())
            .ok_or_else(|| Error::NotFound(from.to_string()))?;
        let moving_dir = source.is_directory();
        let from_key = source.path.clone();

        if from_path == to_path {
            return Ok(());
        }
        if moving_dir && to_path.is_within(&from_path) {
            return Err(Error::InvalidPath(format!(
                "cannot move {} into itself",
                from_path
            )));
        }
        self.check_parent(&to_path)?;

        let to_key = if moving_dir {
            to_path.dir_key()
        } else {
            to_path.lookup_key()
        };
        if let Some(target) = self.table.find(&to_key) {
            if moving_dir || target.is_directory() {
                return Err(Error::AlreadyExists(to.to_string()));
            }
            self.table.remove(&to_key, &mut self.store)?;
        }

        self.table.rename(&from_key, &to_key)?;
        debug!(from = %from_path, to = %to_path, "renamed");

        self.touch(0);
        Ok(())
    }

    /// Set a file's length, zero-filling on growth.
    pub fn truncate(&mut self, path: &str, length: u64) -> Result<()> {
        self.ensure_writable()?;
        let vfs_path = VfsPath::parse(path)?;
        let entry = self
            .table
            .find_mut(&vfs_path.lookup_key())
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(Error::IsADirectory(path.to_string()));
        }

        let old = entry.length;
        entry.truncate(length, &mut self.store, &self.cipher)?;
        debug!(path = %vfs_path, old, new = length, "truncated");

        self.touch(old.abs_diff(length));
        Ok(())
    }

    /// Read up to `size` bytes at `offset`. Reads past the end are short.
    pub fn read(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        let vfs_path = VfsPath::parse(path)?;
        let entry = self
            .table
            .find(&vfs_path.lookup_key())
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(Error::IsADirectory(path.to_string()));
        }
        if offset >= entry.length {
            return Ok(Vec::new());
        }

        let block_size = u64::from(self.store.block_size());
        let end = offset.saturating_add(size as u64).min(entry.length);
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;

        while pos < end {
            let slot = (pos / block_size) as usize;
            let within = (pos % block_size) as usize;
            let n = (block_size - within as u64).min(end - pos) as usize;
            let block = entry.blocks.get(slot).ok_or_else(|| {
                Error::CorruptChain(format!("{} has no block {}", path, slot))
            })?;

            let plaintext = block.load(&self.store, &self.cipher)?;
            out.extend_from_slice(&plaintext[within..within + n]);
            pos += n as u64;
        }

        Ok(out)
    }

    /// Write `data` at `offset`, growing the file as needed.
    pub fn write(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        let vfs_path = VfsPath::parse(path)?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= i64::MAX as u64)
            .ok_or_else(|| Error::InvalidPath(format!("write past the largest file size: {}", path)))?;

        let block_size = self.store.block_size() as usize;
        let entry = self
            .table
            .find_mut(&vfs_path.lookup_key())
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(Error::IsADirectory(path.to_string()));
        }

        entry.ensure_length(end, &mut self.store, &self.cipher)?;

        let mut written = 0;
        while written < data.len() {
            let pos = offset + written as u64;
            let slot = (pos / block_size as u64) as usize;
            let within = (pos % block_size as u64) as usize;
            let n = (block_size - within).min(data.len() - written);
            let block = entry.blocks.get_mut(slot).ok_or_else(|| {
                Error::CorruptChain(format!("{} has no block {}", path, slot))
            })?;

            let mut plaintext = if n == block_size {
                vec![0u8; block_size]
            } else {
                block.load(&self.store, &self.cipher)?
            };
            plaintext[within..within + n].copy_from_slice(&data[written..written + n]);

            if let Err(e) = block.store(&mut self.store, &self.cipher, &plaintext) {
                self.write_failed = true;
                error!(path = %vfs_path, block = block.index, error = %e, "data write failed, volume is now read-only");
                return Err(e);
            }
            written += n;
        }

        self.touch(data.len() as u64);
        Ok(data.len())
    }

    /// Account for a mutation and flush if a threshold was crossed.
    ///
    /// The mutation has already been applied, so a failed flush is only
    /// logged; the state stays dirty and the next flush retries.
    fn touch(&mut self, bytes: u64) {
        if self.flush.record(bytes, Instant::now()) == FlushDecision::Immediate {
            if let Err(e) = self.flush() {
                error!(error = %e, "directory flush failed, will retry");
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.flush.begin_flush() {
            return Ok(());
        }
        self.save()
    }

    fn save(&mut self) -> Result<()> {
        match chain::save(
            &mut self.store,
            &self.cipher,
            &self.table,
            self.start,
            &self.journal,
            self.durable,
        ) {
            Ok(chain) => {
                self.journal = chain;
                Ok(())
            }
            Err(e) => {
                self.flush.flush_failed();
                Err(e)
            }
        }
    }

    /// Write the directory now, dirty or not.
    pub fn sync(&mut self) -> Result<()> {
        self.flush.begin_flush();
        self.save()
    }

    /// Run the deferred flush if its deadline passed. Returns whether it
    /// fired.
    pub fn tick(&mut self) -> Result<bool> {
        self.tick_at(Instant::now())
    }

    /// [`ChaffVfs::tick`] against an explicit clock.
    pub fn tick_at(&mut self, now: Instant) -> Result<bool> {
        if !self.flush.poll(now) {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Final forced flush, then hand back the device.
    pub fn unmount(mut self) -> Result<D> {
        self.sync()?;
        info!(
            start = self.start,
            chain_blocks = self.journal.len(),
            faults = self.store.faults(),
            "unmounted branch"
        );
        Ok(self.store.into_device())
    }

    /// Give back the device without flushing, as if the process died.
    pub fn into_device(self) -> D {
        self.store.into_device()
    }

    /// Walk the on-disk chain of the active branch.
    pub fn walk_chain(&self) -> Result<ChainWalk> {
        chain::walk(&self.store, &self.cipher, self.start)
    }

    /// A block exactly as stored on disk.
    pub fn raw_block(&self, index: u32) -> Result<Vec<u8>> {
        self.store.read(index)
    }

    /// Get VFS info.
    pub fn info(&self) -> VfsInfo {
        VfsInfo {
            block_size: self.store.block_size(),
            block_count: self.store.block_count(),
            used_blocks: self.store.used_blocks(),
            free_blocks: self.store.free_blocks(),
            reserved_blocks: self.store.reserved_blocks(),
            chain_blocks: self.journal.len(),
            file_count: self.table.file_count(),
            dir_count: self.table.dir_count(),
            total_file_size: self.table.total_size(),
            read_only: self.is_read_only(),
            faults: self.store.faults(),
        }
    }
}

/// Mark every block of a locked branch as reserved.
fn reserve_branch<D: BlockDevice>(store: &mut BlockStore<D>, branch: &Branch) -> Result<()> {
    if store.is_used(branch.start) {
        return Err(Error::InvalidBranch(format!(
            "start block {} is already used by another branch",
            branch.start
        )));
    }

    let loaded = chain::load(store, &branch.cipher, branch.start, LoadMode::MarkOnly).map_err(
        |e| match e {
            Error::CorruptChain(reason) => Error::InvalidBranch(format!(
                "no directory at block {}: {}",
                branch.start, reason
            )),
            other => other,
        },
    )?;

    for &index in loaded.chain_blocks.iter().chain(&loaded.data_blocks) {
        store.mark_reserved(index)?;
    }
    debug!(
        start = branch.start,
        chain_blocks = loaded.chain_blocks.len(),
        data_blocks = loaded.data_blocks.len(),
        "reserved locked branch"
    );
    Ok(())
}
