//! Random block allocator over a shared physical pool.
//!
//! Free and used blocks are indistinguishable on disk: the pool is
//! initialized with random bytes, freed blocks are shredded with random
//! bytes, and block writes occasionally launder a free block so that the age
//! of free-space content says nothing about real write activity. Blocks of
//! other, locked branches are held as `Reserved`: they count as used but are
//! never freed, allocated or decrypted by the active branch.

use crate::config::VfsConfig;
use crate::error::{Error, Result};
use crate::storage::device::BlockDevice;
use crate::storage::random::RandomSource;
use rand::RngCore;
use tracing::{debug, warn};

/// Random probes before falling back to a linear scan.
const ALLOCATION_PROBES: u32 = 100;

/// Random probing is skipped when fewer than this many blocks are free.
const PROBE_FREE_MARGIN: u64 = 5;

/// Occupancy of one physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    /// Referenced by the active branch.
    Owned,
    /// Held for another branch whose content stays locked.
    Reserved,
}

/// Owner of the backing extent and its free/used map.
pub struct BlockStore<D: BlockDevice> {
    device: D,
    rng: RandomSource,
    block_size: u32,
    states: Vec<BlockState>,
    used: u64,
    reserved_percent: u8,
    launder_per_mille: u16,
    shred: bool,
    read_only: bool,
    sentinel: Option<u32>,
    faults: u64,
}

impl<D: BlockDevice> BlockStore<D> {
    /// Open a pool over `device`. Trailing bytes that do not form a whole
    /// block are ignored.
    pub fn open(device: D, rng: RandomSource, config: &VfsConfig) -> Result<Self> {
        let block_size = config.block_size;
        let count = device.len_bytes() / u64::from(block_size);
        if count == 0 {
            return Err(Error::Config(
                "backing store is smaller than one block; initialize it with random data first"
                    .to_string(),
            ));
        }
        let count = u32::try_from(count)
            .map_err(|_| Error::Config(format!("{} blocks exceed the 32-bit index", count)))?;

        Ok(Self {
            device,
            rng,
            block_size,
            states: vec![BlockState::Free; count as usize],
            used: 0,
            reserved_percent: config.reserved_percent,
            launder_per_mille: config.launder_per_mille,
            shred: config.shred,
            read_only: false,
            sentinel: None,
            faults: 0,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn used_blocks(&self) -> u64 {
        self.used
    }

    pub fn free_blocks(&self) -> u64 {
        u64::from(self.block_count()) - self.used
    }

    /// Blocks held for locked branches.
    pub fn reserved_blocks(&self) -> u64 {
        self.states
            .iter()
            .filter(|s| **s == BlockState::Reserved)
            .count() as u64
    }

    /// State of a block.
    pub fn state(&self, index: u32) -> Result<BlockState> {
        self.check_index(index)?;
        Ok(self.states[index as usize])
    }

    pub fn is_used(&self, index: u32) -> bool {
        self.states
            .get(index as usize)
            .is_some_and(|s| *s != BlockState::Free)
    }

    /// Whether the pool had to grow and refuses further data writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    /// Integrity faults (double free, double mark) seen so far.
    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// The active branch-start block, never handed out by the allocator.
    pub fn set_sentinel(&mut self, index: u32) {
        self.sentinel = Some(index);
    }

    pub fn rng(&mut self) -> &mut RandomSource {
        &mut self.rng
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Give back the device without touching it.
    pub fn into_device(self) -> D {
        self.device
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index as usize >= self.states.len() {
            return Err(Error::BlockOutOfRange {
                index,
                count: self.block_count(),
            });
        }
        Ok(())
    }

    fn claim(&mut self, index: u32) -> u32 {
        self.states[index as usize] = BlockState::Owned;
        self.used += 1;
        index
    }

    fn is_candidate(&self, index: u32) -> bool {
        self.states[index as usize] == BlockState::Free && Some(index) != self.sentinel
    }

    /// Allocate a random free block.
    ///
    /// Unprivileged calls fail once the pool is filled up to the reserve.
    /// Privileged calls (directory writes) never fail for lack of space: when
    /// the pool is completely full the extent grows by one block and the
    /// store turns read-only.
    pub fn allocate(&mut self, privileged: bool) -> Result<u32> {
        let count = u64::from(self.block_count());

        if !privileged && self.used * 100 >= count * (100 - u64::from(self.reserved_percent)) {
            return Err(Error::CapacityExhausted);
        }

        let mut last = 0u32;
        if self.used + PROBE_FREE_MARGIN < count {
            for _ in 0..ALLOCATION_PROBES {
                last = (self.rng.next_u64() % count) as u32;
                if self.states[last as usize] != BlockState::Free {
                    continue;
                }
                if Some(last) == self.sentinel {
                    warn!(block = last, "branch start block is not marked used");
                    continue;
                }
                return Ok(self.claim(last));
            }
        }

        let found = (last + 1..self.block_count())
            .chain(0..=last)
            .find(|&i| self.is_candidate(i));
        if let Some(index) = found {
            debug!(block = index, "allocated by linear scan");
            return Ok(self.claim(index));
        }

        if privileged {
            return self.grow();
        }

        Err(Error::CapacityExhausted)
    }

    /// Emergency expansion by one block for directory metadata.
    fn grow(&mut self) -> Result<u32> {
        let index = self.block_count();
        let new_len = (u64::from(index) + 1) * u64::from(self.block_size);
        self.device.set_len(new_len)?;
        self.states.push(BlockState::Free);
        self.read_only = true;
        warn!(
            block = index,
            "block pool exhausted, expanded the backing store to save the directory; volume is now read-only"
        );
        Ok(self.claim(index))
    }

    /// Return a block to the free pool. Freeing a free block is counted as an
    /// integrity fault; reserved blocks of other branches are never released.
    pub fn free(&mut self, index: u32) -> Result<()> {
        self.check_index(index)?;
        match self.states[index as usize] {
            BlockState::Free => {
                self.faults += 1;
                warn!(block = index, "freeing a block that is not occupied");
            }
            BlockState::Reserved => {
                self.faults += 1;
                warn!(block = index, "refusing to free a block reserved for another branch");
            }
            BlockState::Owned => {
                self.states[index as usize] = BlockState::Free;
                self.used -= 1;
            }
        }
        Ok(())
    }

    /// Mark a block as owned by the active branch.
    pub fn mark_used(&mut self, index: u32) -> Result<()> {
        self.mark(index, BlockState::Owned)
    }

    /// Mark a block as held for a locked branch.
    pub fn mark_reserved(&mut self, index: u32) -> Result<()> {
        self.mark(index, BlockState::Reserved)
    }

    fn mark(&mut self, index: u32, state: BlockState) -> Result<()> {
        self.check_index(index)?;
        if self.states[index as usize] != BlockState::Free {
            self.faults += 1;
            warn!(block = index, "marking a block twice");
            return Ok(());
        }
        self.states[index as usize] = state;
        self.used += 1;
        Ok(())
    }

    /// Overwrite a block with fresh random bytes, unless shredding is off.
    pub fn shred(&mut self, index: u32) -> Result<()> {
        if !self.shred {
            return Ok(());
        }
        let noise = self.noise();
        self.write(index, &noise)
    }

    fn noise(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; self.block_size as usize];
        self.rng.fill_bytes(&mut buf);
        buf
    }

    /// With the configured per-mille probability, overwrite one free block
    /// with random bytes.
    pub fn maybe_launder(&mut self) -> Result<()> {
        if self.read_only || self.launder_per_mille == 0 {
            return Ok(());
        }
        if self.rng.next_u32() % 1000 >= u32::from(self.launder_per_mille) {
            return Ok(());
        }

        let count = self.block_count();
        let start = self.rng.next_u32() % count;
        let target = (start..count)
            .chain(0..start)
            .find(|&i| self.states[i as usize] == BlockState::Free);

        if let Some(index) = target {
            let noise = self.noise();
            self.write_raw(index, &noise)?;
        }
        Ok(())
    }

    /// Read one block.
    pub fn read(&self, index: u32) -> Result<Vec<u8>> {
        self.check_index(index)?;
        let mut buf = vec![0u8; self.block_size as usize];
        self.device.read_exact_at(self.offset_of(index), &mut buf)?;
        Ok(buf)
    }

    /// Write one block, then maybe launder a free one.
    pub fn write(&mut self, index: u32, data: &[u8]) -> Result<()> {
        self.write_raw(index, data)?;
        self.maybe_launder()
    }

    fn write_raw(&mut self, index: u32, data: &[u8]) -> Result<()> {
        self.check_index(index)?;
        if data.len() != self.block_size as usize {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "block write of {} bytes, block size is {}",
                    data.len(),
                    self.block_size
                ),
            )));
        }
        let offset = self.offset_of(index);
        self.device.write_all_at(offset, data)
    }

    /// Durability barrier on the backing store.
    pub fn sync(&mut self) -> Result<()> {
        self.device.sync()
    }

    fn offset_of(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::device::MemoryDevice;
    use std::collections::HashSet;

    const BS: u32 = 512;

    fn store(blocks: usize, tweak: impl FnOnce(&mut VfsConfig)) -> BlockStore<MemoryDevice> {
        let mut config = VfsConfig {
            block_size: BS,
            reserved_percent: 0,
            launder_per_mille: 0,
            ..Default::default()
        };
        tweak(&mut config);
        let device = MemoryDevice::new(blocks * BS as usize);
        BlockStore::open(device, RandomSource::seeded(11), &config).unwrap()
    }

    #[test]
    fn test_open_requires_a_block() {
        let config = VfsConfig {
            block_size: BS,
            ..Default::default()
        };
        let result = BlockStore::open(MemoryDevice::new(100), RandomSource::seeded(1), &config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_allocate_never_returns_used_block() {
        let mut s = store(64, |_| {});
        let mut seen = HashSet::new();

        for _ in 0..64 {
            let index = s.allocate(false).unwrap();
            assert!(seen.insert(index), "block {} handed out twice", index);
            assert_eq!(s.state(index).unwrap(), BlockState::Owned);
        }

        assert_eq!(s.used_blocks(), 64);
        assert!(matches!(s.allocate(false), Err(Error::CapacityExhausted)));
    }

    #[test]
    fn test_allocate_skips_sentinel_and_reserved() {
        let mut s = store(16, |_| {});
        s.set_sentinel(3);
        for i in 8..16 {
            s.mark_reserved(i).unwrap();
        }

        let mut got = Vec::new();
        while let Ok(index) = s.allocate(false) {
            got.push(index);
        }

        assert!(!got.contains(&3));
        assert!(got.iter().all(|&i| i < 8));
        assert_eq!(got.len(), 7);
    }

    #[test]
    fn test_reserve_blocks_unprivileged() {
        let mut s = store(100, |c| c.reserved_percent = 10);

        for _ in 0..90 {
            s.allocate(false).unwrap();
        }
        assert!(matches!(s.allocate(false), Err(Error::CapacityExhausted)));

        let privileged = s.allocate(true).unwrap();
        assert!(privileged < 100);
        assert!(!s.is_read_only());
    }

    #[test]
    fn test_privileged_allocation_grows_pool() {
        let mut s = store(4, |_| {});
        for _ in 0..4 {
            s.allocate(true).unwrap();
        }

        let index = s.allocate(true).unwrap();

        assert_eq!(index, 4);
        assert_eq!(s.block_count(), 5);
        assert!(s.is_read_only());
        assert_eq!(s.device().len_bytes(), 5 * u64::from(BS));
        s.write(index, &vec![1u8; BS as usize]).unwrap();
    }

    #[test]
    fn test_double_free_is_a_fault_not_an_error() {
        let mut s = store(8, |_| {});
        let index = s.allocate(false).unwrap();

        s.free(index).unwrap();
        assert_eq!(s.faults(), 0);
        s.free(index).unwrap();

        assert_eq!(s.faults(), 1);
        assert_eq!(s.used_blocks(), 0);
    }

    #[test]
    fn test_double_mark_is_a_fault() {
        let mut s = store(8, |_| {});
        s.mark_used(2).unwrap();
        s.mark_used(2).unwrap();
        assert_eq!(s.faults(), 1);
        assert_eq!(s.used_blocks(), 1);
    }

    #[test]
    fn test_reserved_blocks_survive_free() {
        let mut s = store(8, |_| {});
        s.mark_reserved(5).unwrap();
        s.free(5).unwrap();

        assert_eq!(s.state(5).unwrap(), BlockState::Reserved);
        assert_eq!(s.reserved_blocks(), 1);
        assert_eq!(s.faults(), 1);
    }

    #[test]
    fn test_out_of_range() {
        let mut s = store(8, |_| {});
        assert!(matches!(
            s.free(8),
            Err(Error::BlockOutOfRange { index: 8, count: 8 })
        ));
        assert!(s.read(100).is_err());
    }

    #[test]
    fn test_shred_overwrites() {
        let mut s = store(8, |_| {});
        let original = vec![0xAAu8; BS as usize];
        s.write(1, &original).unwrap();

        s.shred(1).unwrap();

        assert_ne!(s.read(1).unwrap(), original);
    }

    #[test]
    fn test_shred_disabled() {
        let mut s = store(8, |c| c.shred = false);
        let original = vec![0xAAu8; BS as usize];
        s.write(1, &original).unwrap();

        s.shred(1).unwrap();

        assert_eq!(s.read(1).unwrap(), original);
    }

    #[test]
    fn test_laundering_only_touches_free_blocks() {
        let mut s = store(8, |c| c.launder_per_mille = 1000);
        let pattern = vec![0x11u8; BS as usize];
        let zero = vec![0u8; BS as usize];

        for i in 0..4 {
            s.mark_used(i).unwrap();
        }
        for i in 0..4 {
            s.write_raw(i, &pattern).unwrap();
        }

        for _ in 0..20 {
            s.write(0, &pattern).unwrap();
        }

        for i in 0..4 {
            assert_eq!(s.read(i).unwrap(), pattern);
        }
        let laundered = (4..8).filter(|&i| s.read(i).unwrap() != zero).count();
        assert!(laundered > 0);
    }

    #[test]
    fn test_no_laundering_when_read_only() {
        let mut s = store(4, |c| c.launder_per_mille = 1000);
        s.set_read_only();
        s.mark_used(0).unwrap();

        s.write(0, &vec![1u8; BS as usize]).unwrap();

        let zero = vec![0u8; BS as usize];
        assert!((1..4).all(|i| s.read(i).unwrap() == zero));
    }

    #[test]
    fn test_rejects_partial_block_write() {
        let mut s = store(4, |_| {});
        assert!(s.write(0, &[0u8; 10]).is_err());
    }
}
