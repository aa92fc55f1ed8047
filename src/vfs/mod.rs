//! Virtual File System over a deniable block pool.
//!
//! Each passphrase selects a branch: a start block and a key. The active
//! branch's directory is held in memory as a flat table and written back as
//! an encrypted chain of pool blocks.

mod branch;
pub mod chain;
mod flush;
mod operations;
mod path;
mod table;
mod types;

pub use branch::{split_passphrases, start_block, Branch};
pub use chain::{ChainRecord, ChainWalk, LoadMode};
pub use flush::{FlushController, FlushDecision};
pub use operations::{ChaffVfs, MountReport, VfsInfo};
pub use path::VfsPath;
pub use table::DirectoryTable;
pub use types::{blocks_for_length, BlockRef, DirEntry, Entry, EntryStat};
