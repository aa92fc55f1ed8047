//! Storage layer for the shared block pool.
//!
//! This module handles:
//! - Positioned reads and writes on the backing extent
//! - The random allocator and its free/used map
//! - Shredding freed blocks and laundering free space

mod block_store;
mod device;
mod random;

pub use block_store::{BlockState, BlockStore};
pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use random::RandomSource;
