//! Error types for the Chaff VFS.

use thiserror::Error;

/// Result type alias for Chaff VFS operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Chaff VFS operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free block left under the reserved-space quota.
    #[error("No space left in the block pool")]
    CapacityExhausted,

    /// The volume entered read-only state.
    #[error("Volume is read-only")]
    ReadOnly,

    /// Path does not fit into a single directory record.
    #[error("Path too long: {len} bytes, maximum is {max}")]
    PathTooLong { len: usize, max: usize },

    /// Directory chain failed structural validation while loading.
    #[error("Corrupt directory chain: {0}")]
    CorruptChain(String),

    /// Entry not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    /// Not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Is a directory.
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// Directory still has children.
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Invalid path format.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Block index outside the pool.
    #[error("Block {index} is outside the pool of {count} blocks")]
    BlockOutOfRange { index: u32, count: u32 },

    /// Cipher initialization or keystream failure.
    #[error("Cipher error: {0}")]
    Crypto(String),

    /// Key derivation error.
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// A passphrase could not be mounted as a branch.
    #[error("Invalid branch: {0}")]
    InvalidBranch(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// The errno a file system protocol adapter should report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(_) | Error::CorruptChain(_) | Error::Crypto(_) => libc::EIO,
            Error::CapacityExhausted => libc::ENOSPC,
            Error::ReadOnly => libc::EROFS,
            Error::PathTooLong { .. } => libc::ENAMETOOLONG,
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::InvalidPath(_)
            | Error::BlockOutOfRange { .. }
            | Error::KeyDerivation(_)
            | Error::InvalidBranch(_)
            | Error::Config(_) => libc::EINVAL,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
