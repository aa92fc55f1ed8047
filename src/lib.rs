//! Chaff Virtual File System
//!
//! A deniable file system that scatters encrypted blocks at random positions
//! of a backing file pre-filled with random data. Without a passphrase, the
//! blocks a branch owns cannot be told apart from free space.
//!
//! # Features
//!
//! - **Random placement**: Blocks are allocated at random positions in a shared pool
//! - **Per-block AES**: Each block is encrypted under its own IV with an Argon2-derived key
//! - **Branches**: Several passphrases can share one pool; locked branches are reserved, never decrypted
//! - **Free-space laundering**: Freed blocks are shredded and free blocks are churned in the background
//! - **Crash-safe directory**: The directory chain is rewritten in full, its first block last
//!
//! # Architecture
//!
//! ```text
//! ChaffVfs → DirectoryTable → chain (save/load) → BlockCipher → BlockStore → BlockDevice
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use chaff_vfs::storage::MemoryDevice;
//! use chaff_vfs::vfs::ChaffVfs;
//! use chaff_vfs::VfsConfig;
//!
//! let mut rng = rand::thread_rng();
//! let device = MemoryDevice::random(256 * 8192, &mut rng);
//!
//! // The leading digits pick the branch-start block.
//! let mut vfs = ChaffVfs::mount(device, VfsConfig::default(), &["17 my passphrase"]).unwrap();
//!
//! vfs.create_file("/secret.txt").unwrap();
//! vfs.write("/secret.txt", 0, b"Hidden data").unwrap();
//!
//! let data = vfs.read("/secret.txt", 0, 64).unwrap();
//! assert_eq!(data, b"Hidden data");
//!
//! let device = vfs.unmount().unwrap();
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod vfs;

pub use config::VfsConfig;
pub use error::{Error, Result};
pub use vfs::ChaffVfs;
