//! VFS types: directory entries, block references, listings.

use crate::crypto::BlockCipher;
use crate::error::{Error, Result};
use crate::storage::{BlockDevice, BlockStore};
use crate::vfs::path::lookup_form;
use serde::{Deserialize, Serialize};

/// Number of blocks needed to hold `length` bytes.
pub fn blocks_for_length(length: u64, block_size: u32) -> usize {
    length.div_ceil(u64::from(block_size)) as usize
}

/// One data block of a file together with the IV it was encrypted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub index: u32,
    pub iv: u64,
}

impl BlockRef {
    /// Read and decrypt the block.
    pub fn load<D: BlockDevice>(&self, store: &BlockStore<D>, cipher: &BlockCipher) -> Result<Vec<u8>> {
        let ciphertext = store.read(self.index)?;
        cipher.decrypt_block(&ciphertext, self.index, self.iv)
    }

    /// Encrypt `plaintext` under a fresh IV and write it. The reference
    /// picks up the new IV only once the write went through.
    pub fn store<D: BlockDevice>(
        &mut self,
        store: &mut BlockStore<D>,
        cipher: &BlockCipher,
        plaintext: &[u8],
    ) -> Result<()> {
        let (ciphertext, iv) = cipher.encrypt_block(plaintext, self.index, store.rng())?;
        store.write(self.index, &ciphertext)?;
        self.iv = iv;
        Ok(())
    }
}

/// A file or directory in a branch's flat table.
///
/// Directories are recognised by the trailing `/` of their path and never
/// own data blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub length: u64,
    pub blocks: Vec<BlockRef>,
}

impl Entry {
    /// An empty entry stored under `path`.
    pub fn new(path: String) -> Self {
        Self {
            path,
            length: 0,
            blocks: Vec::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory()
    }

    /// The path without the directory marker.
    pub fn lookup_path(&self) -> &str {
        lookup_form(&self.path)
    }

    /// Last path component, empty for the root.
    pub fn name(&self) -> &str {
        let path = self.lookup_path();
        path.rsplit('/').next().unwrap_or(path)
    }

    /// Grow the file to `new_length` bytes.
    ///
    /// The bytes between the old and the new end read back as zeros. Blocks
    /// allocated by a call that fails are released again and the entry is
    /// left as it was. Shrinking is not done here; see [`Entry::truncate`].
    pub fn ensure_length<D: BlockDevice>(
        &mut self,
        new_length: u64,
        store: &mut BlockStore<D>,
        cipher: &BlockCipher,
    ) -> Result<()> {
        if self.is_directory() {
            return Err(Error::IsADirectory(self.path.clone()));
        }
        if new_length <= self.length {
            return Ok(());
        }

        let block_size = store.block_size();
        let tail = (self.length % u64::from(block_size)) as usize;
        if tail != 0 {
            if let Some(last) = self.blocks.last_mut() {
                let mut plaintext = last.load(store, cipher)?;
                plaintext[tail..].fill(0);
                last.store(store, cipher, &plaintext)?;
            }
        }

        let kept = self.blocks.len();
        let needed = blocks_for_length(new_length, block_size);
        let zeros = vec![0u8; block_size as usize];

        while self.blocks.len() < needed {
            let grown = store.allocate(false).and_then(|index| {
                let mut block = BlockRef { index, iv: 0 };
                match block.store(store, cipher, &zeros) {
                    Ok(()) => Ok(block),
                    Err(e) => {
                        store.free(index)?;
                        Err(e)
                    }
                }
            });
            match grown {
                Ok(block) => self.blocks.push(block),
                Err(e) => {
                    self.release_from(kept, store)?;
                    return Err(e);
                }
            }
        }

        self.length = new_length;
        Ok(())
    }

    /// Set the length to exactly `new_length`, growing with zeros or
    /// shredding and freeing the blocks past the new end.
    pub fn truncate<D: BlockDevice>(
        &mut self,
        new_length: u64,
        store: &mut BlockStore<D>,
        cipher: &BlockCipher,
    ) -> Result<()> {
        if self.is_directory() {
            return Err(Error::IsADirectory(self.path.clone()));
        }
        if new_length >= self.length {
            return self.ensure_length(new_length, store, cipher);
        }

        let kept = blocks_for_length(new_length, store.block_size());
        self.release_from(kept, store)?;
        self.length = new_length;
        Ok(())
    }

    /// Shred and free every data block.
    pub fn release<D: BlockDevice>(&mut self, store: &mut BlockStore<D>) -> Result<()> {
        self.release_from(0, store)?;
        self.length = 0;
        Ok(())
    }

    fn release_from<D: BlockDevice>(&mut self, keep: usize, store: &mut BlockStore<D>) -> Result<()> {
        while self.blocks.len() > keep {
            if let Some(block) = self.blocks.pop() {
                store.shred(block.index)?;
                store.free(block.index)?;
            }
        }
        Ok(())
    }
}

/// A directory entry for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Name of the entry.
    pub name: String,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

impl DirEntry {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            name: entry.name().to_string(),
            is_dir: entry.is_directory(),
            size: entry.length,
        }
    }
}

/// Attributes of a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStat {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Data blocks held by the file.
    pub blocks: usize,
}

impl EntryStat {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            path: entry.lookup_path().to_string(),
            is_dir: entry.is_directory(),
            size: entry.length,
            blocks: entry.blocks.len(),
        }
    }
}
