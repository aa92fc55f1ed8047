//! On-disk directory chain.
//!
//! A branch's directory lives in a linked chain of pool blocks starting at
//! the branch-start block. Each chain block is laid out as
//!
//! ```text
//! filler (8, plaintext) | signature (8) | records ...
//! ```
//!
//! The filler is random and doubles as the IV under which bytes `8..` of
//! the block are encrypted, so a chain block looks like any other block.
//! A record is
//!
//! ```text
//! path_len (4) | path | length (8) | n (4) | list_offset (4)
//!   | n × { index (4) | iv (4) } | next_block (4) | next_offset (4) | pad (8)
//! ```
//!
//! with all integers big-endian. A file with more blocks than fit into one
//! record is split into continuation records carrying the same path and a
//! `list_offset` telling where their references go. `(0, 0)` as the next
//! pointer ends the chain. No record ever sits at offset 0, so block 0 can
//! still be linked as a continuation block.
//!
//! Saving buffers the whole chain, allocates every block it needs up front,
//! writes the continuation blocks and then the start block last. A crash
//! before the start block is written leaves the previous chain intact.

use crate::crypto::BlockCipher;
use crate::error::{Error, Result};
use crate::storage::{BlockDevice, BlockStore};
use crate::vfs::table::DirectoryTable;
use crate::vfs::types::{blocks_for_length, BlockRef, Entry};
use rand::RngCore;
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Marker right after the filler of every chain block.
pub const SIGNATURE: &[u8; 8] = b"ChaffV00";

/// Filler plus signature.
pub const HEADER_SIZE: usize = 16;

const FILLER_SIZE: usize = 8;

/// Size of a record without its path and block references.
pub const RECORD_OVERHEAD: usize = 4 + 8 + 4 + 4 + 4 + 4 + 8;

/// Size of one `{index, iv}` pair.
pub const BLOCK_REF_SIZE: usize = 8;

/// Longest path that still leaves room for two block references in a
/// fresh chain block.
pub fn max_path_len(block_size: u32) -> usize {
    (block_size as usize).saturating_sub(HEADER_SIZE + RECORD_OVERHEAD + 2 * BLOCK_REF_SIZE)
}

fn record_size(path_len: usize, refs: usize) -> usize {
    RECORD_OVERHEAD + path_len + refs * BLOCK_REF_SIZE
}

/// How a loaded chain is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Materialize the directory table.
    Full,
    /// Only collect the blocks the chain occupies.
    MarkOnly,
}

/// One decoded record, as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRecord {
    /// Chain block holding the record.
    pub block: u32,
    /// Byte offset of the record inside that block.
    pub offset: u32,
    pub path: Vec<u8>,
    pub length: u64,
    pub list_offset: u32,
    pub refs: Vec<BlockRef>,
    pub next_block: u32,
    pub next_offset: u32,
}

/// Everything a walk over a chain found.
#[derive(Debug, Clone, Default)]
pub struct ChainWalk {
    /// Chain blocks in the order they were visited.
    pub blocks: Vec<u32>,
    pub records: Vec<ChainRecord>,
}

impl ChainWalk {
    /// Data blocks referenced by all records.
    pub fn data_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.records
            .iter()
            .flat_map(|r| r.refs.iter().map(|b| b.index))
    }
}

/// Result of a successful load.
#[derive(Debug)]
pub struct LoadedChain {
    /// Present in [`LoadMode::Full`].
    pub table: Option<DirectoryTable>,
    pub chain_blocks: Vec<u32>,
    pub data_blocks: Vec<u32>,
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptChain(msg.into())
}

/// Read and decrypt one chain block, checking its signature.
fn open_block<D: BlockDevice>(
    store: &BlockStore<D>,
    cipher: &BlockCipher,
    index: u32,
) -> Result<Vec<u8>> {
    let mut buf = store.read(index)?;
    if buf.len() < HEADER_SIZE {
        return Err(corrupt("block smaller than a chain header"));
    }
    let iv = filler_iv(&buf);
    cipher.apply_keystream(&mut buf[FILLER_SIZE..], index, iv)?;
    if &buf[FILLER_SIZE..HEADER_SIZE] != SIGNATURE {
        return Err(corrupt(format!("no directory signature in block {}", index)));
    }
    Ok(buf)
}

fn filler_iv(buf: &[u8]) -> u64 {
    let mut filler = [0u8; FILLER_SIZE];
    filler.copy_from_slice(&buf[..FILLER_SIZE]);
    u64::from_be_bytes(filler)
}

/// Cursor over one decrypted chain block.
struct RecordReader {
    block: u32,
    buf: Vec<u8>,
    pos: usize,
}

impl RecordReader {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                corrupt(format!(
                    "record overruns block {} at offset {}",
                    self.block, self.pos
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }
}

/// Walk and validate the chain starting at `start`.
///
/// Fails with [`Error::CorruptChain`] on a missing signature, a record that
/// overruns its block, an out-of-range pointer, a chain that revisits a
/// block or a next pointer that goes backwards within a block.
pub fn walk<D: BlockDevice>(
    store: &BlockStore<D>,
    cipher: &BlockCipher,
    start: u32,
) -> Result<ChainWalk> {
    let count = store.block_count();
    let block_size = store.block_size() as usize;
    let max_path = max_path_len(store.block_size());

    let mut walk = ChainWalk {
        blocks: vec![start],
        records: Vec::new(),
    };
    let mut visited = HashSet::from([start]);
    let mut reader = RecordReader {
        block: start,
        buf: open_block(store, cipher, start)?,
        pos: HEADER_SIZE,
    };

    loop {
        let offset = reader.pos as u32;
        let path_len = reader.u32()? as usize;
        if path_len == 0 || path_len > max_path {
            return Err(corrupt(format!(
                "path length {} in block {} at offset {}",
                path_len, reader.block, offset
            )));
        }
        let path = reader.take(path_len)?.to_vec();
        let length = reader.u64()?;
        if length > i64::MAX as u64 {
            return Err(corrupt(format!("negative file length in block {}", reader.block)));
        }
        let n = reader.u32()? as usize;
        let list_offset = reader.u32()?;
        if n > block_size / BLOCK_REF_SIZE {
            return Err(corrupt(format!(
                "{} block references in block {}",
                n, reader.block
            )));
        }
        let mut refs = Vec::with_capacity(n);
        for _ in 0..n {
            let index = reader.u32()?;
            let iv = u64::from(reader.u32()?);
            if index >= count {
                return Err(corrupt(format!(
                    "data block {} outside the pool of {} blocks",
                    index, count
                )));
            }
            refs.push(BlockRef { index, iv });
        }
        let next_block = reader.u32()?;
        let next_offset = reader.u32()?;
        reader.take(8)?;

        trace!(
            block = reader.block,
            offset,
            path_len,
            refs = n,
            next_block,
            next_offset,
            "directory record"
        );
        walk.records.push(ChainRecord {
            block: reader.block,
            offset,
            path,
            length,
            list_offset,
            refs,
            next_block,
            next_offset,
        });

        if next_block == 0 && next_offset == 0 {
            break;
        }
        if next_block >= count {
            return Err(corrupt(format!("next block {} outside the pool", next_block)));
        }
        let next_offset = next_offset as usize;
        if next_offset < HEADER_SIZE || next_offset + RECORD_OVERHEAD > block_size {
            return Err(corrupt(format!(
                "next offset {} does not fit a record",
                next_offset
            )));
        }

        if next_block == reader.block {
            if next_offset < reader.pos {
                return Err(corrupt(format!(
                    "next pointer moves backwards in block {}",
                    next_block
                )));
            }
            reader.pos = next_offset;
        } else {
            if !visited.insert(next_block) {
                return Err(corrupt(format!("chain loops back to block {}", next_block)));
            }
            walk.blocks.push(next_block);
            reader = RecordReader {
                block: next_block,
                buf: open_block(store, cipher, next_block)?,
                pos: next_offset,
            };
        }
    }

    Ok(walk)
}

/// Load the directory chain of a branch.
///
/// Nothing is marked in the store here; the caller commits the returned
/// block lists only after the whole chain validated.
pub fn load<D: BlockDevice>(
    store: &BlockStore<D>,
    cipher: &BlockCipher,
    start: u32,
    mode: LoadMode,
) -> Result<LoadedChain> {
    let walk = walk(store, cipher, start)?;
    let data_blocks: Vec<u32> = walk.data_blocks().collect();

    let table = match mode {
        LoadMode::MarkOnly => None,
        LoadMode::Full => Some(assemble(store.block_size(), &walk)?),
    };

    debug!(
        start,
        chain_blocks = walk.blocks.len(),
        records = walk.records.len(),
        data_blocks = data_blocks.len(),
        ?mode,
        "loaded directory chain"
    );
    Ok(LoadedChain {
        table,
        chain_blocks: walk.blocks,
        data_blocks,
    })
}

/// Turn records into entries, joining continuation records.
fn assemble(block_size: u32, walk: &ChainWalk) -> Result<DirectoryTable> {
    let mut entries: Vec<Entry> = Vec::new();

    for record in &walk.records {
        let path = std::str::from_utf8(&record.path)
            .map_err(|_| corrupt(format!("path in block {} is not UTF-8", record.block)))?;
        if !path.starts_with('/') {
            return Err(corrupt(format!("relative path {:?}", path)));
        }

        match entries.last_mut() {
            Some(entry) if entry.path == path => {
                if record.list_offset as usize != entry.blocks.len() {
                    return Err(corrupt(format!(
                        "continuation of {} at block {} expected, found {}",
                        path,
                        entry.blocks.len(),
                        record.list_offset
                    )));
                }
                if record.length != entry.length {
                    return Err(corrupt(format!("length of {} changes between records", path)));
                }
                entry.blocks.extend_from_slice(&record.refs);
            }
            _ => {
                if record.list_offset != 0 {
                    return Err(corrupt(format!(
                        "{} starts at block list offset {}",
                        path, record.list_offset
                    )));
                }
                if entries.iter().any(|e| e.path == path) {
                    return Err(corrupt(format!("duplicate entry {}", path)));
                }
                entries.push(Entry {
                    path: path.to_string(),
                    length: record.length,
                    blocks: record.refs.clone(),
                });
            }
        }
    }

    for entry in &entries {
        let expected = if entry.is_directory() {
            0
        } else {
            blocks_for_length(entry.length, block_size)
        };
        if entry.blocks.len() != expected || (entry.is_directory() && entry.length != 0) {
            return Err(corrupt(format!(
                "{} has {} blocks for {} bytes",
                entry.path,
                entry.blocks.len(),
                entry.length
            )));
        }
    }

    Ok(DirectoryTable::from_entries(block_size, entries))
}

/// Chain being laid out in memory.
struct ChainWriter {
    block_size: usize,
    /// `(block index, plaintext image)`; the first one is the start block.
    blocks: Vec<(u32, Vec<u8>)>,
    pos: usize,
    /// Where the previous record's next pointer lives.
    link: Option<(usize, usize)>,
}

impl ChainWriter {
    fn new(block_size: usize, start: u32, filler: u64) -> Self {
        let mut writer = Self {
            block_size,
            blocks: Vec::new(),
            pos: 0,
            link: None,
        };
        writer.push_block(start, filler);
        writer
    }

    fn push_block(&mut self, index: u32, filler: u64) {
        let mut buf = vec![0u8; self.block_size];
        buf[..FILLER_SIZE].copy_from_slice(&filler.to_be_bytes());
        buf[FILLER_SIZE..HEADER_SIZE].copy_from_slice(SIGNATURE);
        self.blocks.push((index, buf));
        self.pos = HEADER_SIZE;
    }

    fn room(&self) -> usize {
        self.block_size - self.pos
    }

    fn put(&mut self, bytes: &[u8]) {
        let slot = self.blocks.len() - 1;
        let buf = &mut self.blocks[slot].1;
        buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Write one record at the current position and patch the previous
    /// record's next pointer to it.
    fn record(&mut self, path: &[u8], length: u64, list_offset: usize, refs: &[BlockRef]) {
        let slot = self.blocks.len() - 1;
        let here = self.blocks[slot].0;
        if let Some((link_slot, at)) = self.link {
            let buf = &mut self.blocks[link_slot].1;
            buf[at..at + 4].copy_from_slice(&here.to_be_bytes());
            buf[at + 4..at + 8].copy_from_slice(&(self.pos as u32).to_be_bytes());
        }

        self.put(&(path.len() as u32).to_be_bytes());
        self.put(path);
        self.put(&length.to_be_bytes());
        self.put(&(refs.len() as u32).to_be_bytes());
        self.put(&(list_offset as u32).to_be_bytes());
        for r in refs {
            self.put(&r.index.to_be_bytes());
            // IVs are drawn from 32 bits; the record keeps only those.
            self.put(&(r.iv as u32).to_be_bytes());
        }
        self.link = Some((slot, self.pos));
        self.put(&[0u8; 16]);
    }
}

/// Serialize `table` into a fresh chain starting at `start`.
///
/// `previous` lists the blocks of the chain currently on disk; those not
/// reused are freed once the new chain is in place. Returns the blocks of
/// the new chain. When `durable` is set the device is synced before and
/// after the start block is written.
pub fn save<D: BlockDevice>(
    store: &mut BlockStore<D>,
    cipher: &BlockCipher,
    table: &DirectoryTable,
    start: u32,
    previous: &[u32],
    durable: bool,
) -> Result<Vec<u32>> {
    let mut allocated = Vec::new();
    let result = layout(store, table, start, &mut allocated)
        .and_then(|writer| commit(store, cipher, writer, durable));

    let chain = match result {
        Ok(chain) => chain,
        Err(e) => {
            warn!(error = %e, blocks = allocated.len(), "directory save failed, keeping the previous chain");
            for index in allocated {
                store.free(index)?;
            }
            return Err(e);
        }
    };

    for &old in previous {
        if !chain.contains(&old) {
            store.shred(old)?;
            store.free(old)?;
        }
    }

    debug!(
        start,
        chain_blocks = chain.len(),
        entries = table.len(),
        "saved directory chain"
    );
    Ok(chain)
}

/// Lay the chain out in memory, allocating every continuation block.
fn layout<D: BlockDevice>(
    store: &mut BlockStore<D>,
    table: &DirectoryTable,
    start: u32,
    allocated: &mut Vec<u32>,
) -> Result<ChainWriter> {
    let block_size = store.block_size() as usize;
    let filler = store.rng().next_u64();
    let mut writer = ChainWriter::new(block_size, start, filler);

    for entry in table.entries() {
        let path = entry.path.as_bytes();
        let mut done = 0;
        loop {
            let remaining = entry.blocks.len() - done;
            let min_refs = remaining.min(1);
            if writer.room() < record_size(path.len(), min_refs) {
                let index = store.allocate(true)?;
                allocated.push(index);
                let filler = store.rng().next_u64();
                writer.push_block(index, filler);
            }

            let fit = (writer.room() - record_size(path.len(), 0)) / BLOCK_REF_SIZE;
            let n = remaining.min(fit);
            writer.record(path, entry.length, done, &entry.blocks[done..done + n]);
            done += n;

            if done >= entry.blocks.len() {
                break;
            }
        }
    }

    Ok(writer)
}

/// Encrypt and write the laid-out chain, start block last.
fn commit<D: BlockDevice>(
    store: &mut BlockStore<D>,
    cipher: &BlockCipher,
    writer: ChainWriter,
    durable: bool,
) -> Result<Vec<u32>> {
    let chain: Vec<u32> = writer.blocks.iter().map(|(index, _)| *index).collect();
    let mut blocks = writer.blocks.into_iter();
    let Some(first) = blocks.next() else {
        return Err(corrupt("empty chain"));
    };

    let mut continued = false;
    for (index, buf) in blocks {
        seal_and_write(store, cipher, index, buf)?;
        continued = true;
    }
    // The start block must not reach the disk before the blocks it links to.
    if durable && continued {
        store.sync()?;
    }
    let (start, buf) = first;
    seal_and_write(store, cipher, start, buf)?;
    if durable {
        store.sync()?;
    }
    Ok(chain)
}

fn seal_and_write<D: BlockDevice>(
    store: &mut BlockStore<D>,
    cipher: &BlockCipher,
    index: u32,
    mut buf: Vec<u8>,
) -> Result<()> {
    let iv = filler_iv(&buf);
    cipher.apply_keystream(&mut buf[FILLER_SIZE..], index, iv)?;
    store.write(index, &buf)
}
