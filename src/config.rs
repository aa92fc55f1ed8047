//! Configuration constants and types for Chaff VFS.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Default randomness source.
pub const DEFAULT_RANDOM_SOURCE: &str = "/dev/urandom";

/// Dirty bytes that force an immediate flush.
pub const DEFAULT_MAX_DIRTY_BYTES: u64 = 1_000_000;

/// Mutating calls that force an immediate flush.
pub const DEFAULT_MAX_DIRTY_CALLS: u64 = 1000;

/// Idle seconds before a deferred flush fires.
pub const DEFAULT_DIRTY_TIMEOUT_SECS: u64 = 5;

/// Share of the pool kept free for the directory, in percent.
pub const DEFAULT_RESERVED_PERCENT: u8 = 5;

/// Chance per block write that one free block is laundered, per mille.
pub const DEFAULT_LAUNDER_PER_MILLE: u16 = 5;

/// Key derivation defaults.
pub mod kdf_params {
    /// Argon2 time cost (iterations).
    pub const ITERATIONS: u32 = 3;

    /// Memory cost in KiB (64 MB).
    pub const MEMORY_KIB: u32 = 65536;

    /// Built-in salt. Not a secret, may be overridden.
    pub const SALT: &str = "ChaffVfs_m2slLmqisccCaqnzpwkkkemsdffnqpalstteqkleeqwelfs";
}

/// Block cipher used for every block of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherAlgorithm {
    Aes128,
    Aes192,
    Aes256,
    /// Raw passthrough, for non-deniable test and debug volumes only.
    None,
}

impl CipherAlgorithm {
    /// Key length in bytes, zero for passthrough.
    pub fn key_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes128 => 16,
            CipherAlgorithm::Aes192 => 24,
            CipherAlgorithm::Aes256 => 32,
            CipherAlgorithm::None => 0,
        }
    }
}

impl FromStr for CipherAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes128" | "aes-128" => Ok(CipherAlgorithm::Aes128),
            "aes192" | "aes-192" => Ok(CipherAlgorithm::Aes192),
            "aes256" | "aes-256" => Ok(CipherAlgorithm::Aes256),
            "none" => Ok(CipherAlgorithm::None),
            other => Err(Error::Config(format!("unknown cipher: {}", other))),
        }
    }
}

/// Length-preserving stream mode wrapped around the block cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherMode {
    Ofb,
    Ctr,
}

impl FromStr for CipherMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ofb" | "nofb" => Ok(CipherMode::Ofb),
            "ctr" => Ok(CipherMode::Ctr),
            other => Err(Error::Config(format!("unknown cipher mode: {}", other))),
        }
    }
}

/// Argon2 flavour used for key stretching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfHash {
    Argon2id,
    Argon2i,
    Argon2d,
}

impl FromStr for KdfHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "argon2id" => Ok(KdfHash::Argon2id),
            "argon2i" => Ok(KdfHash::Argon2i),
            "argon2d" => Ok(KdfHash::Argon2d),
            other => Err(Error::Config(format!("unknown KDF hash: {}", other))),
        }
    }
}

/// Cipher selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherConfig {
    pub algorithm: CipherAlgorithm,
    pub mode: CipherMode,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            algorithm: CipherAlgorithm::Aes256,
            mode: CipherMode::Ofb,
        }
    }
}

/// Passphrase stretching parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfConfig {
    pub hash: KdfHash,
    pub iterations: u32,
    pub memory_kib: u32,
    pub salt: String,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            hash: KdfHash::Argon2id,
            iterations: kdf_params::ITERATIONS,
            memory_kib: kdf_params::MEMORY_KIB,
            salt: kdf_params::SALT.to_string(),
        }
    }
}

/// Configuration for mounting a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Size of every block in the pool.
    pub block_size: u32,

    /// Raw byte stream used for allocation, IVs, shredding and laundering.
    /// `None` falls back to the thread-local generator.
    pub random_source: Option<PathBuf>,

    /// Bytes written since the last flush that force a flush.
    pub max_dirty_bytes: u64,

    /// Mutating calls since the last flush that force a flush.
    pub max_dirty_calls: u64,

    /// Idle interval of the deferred flush.
    pub dirty_timeout_secs: u64,

    /// Overwrite blocks with random bytes when they are freed.
    pub shred: bool,

    /// Force the backing store to stable storage after each flush.
    pub sync: bool,

    /// Percentage of the pool that only directory writes may use.
    pub reserved_percent: u8,

    /// Per-mille chance that a block write launders one free block.
    pub launder_per_mille: u16,

    pub cipher: CipherConfig,

    pub kdf: KdfConfig,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            random_source: Some(PathBuf::from(DEFAULT_RANDOM_SOURCE)),
            max_dirty_bytes: DEFAULT_MAX_DIRTY_BYTES,
            max_dirty_calls: DEFAULT_MAX_DIRTY_CALLS,
            dirty_timeout_secs: DEFAULT_DIRTY_TIMEOUT_SECS,
            shred: true,
            sync: true,
            reserved_percent: DEFAULT_RESERVED_PERCENT,
            launder_per_mille: DEFAULT_LAUNDER_PER_MILLE,
            cipher: CipherConfig::default(),
            kdf: KdfConfig::default(),
        }
    }
}

impl VfsConfig {
    /// Load a configuration from a JSON file. Missing fields keep defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: VfsConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Override fields from `CHAFF_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Override fields from an arbitrary variable lookup.
    pub fn apply_vars<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("CHAFF_BLOCK_SIZE") {
            self.block_size = parse_num("CHAFF_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = var("CHAFF_RANDOM_FILE") {
            self.random_source = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Some(v) = var("CHAFF_MAX_DIRTY_BYTES") {
            self.max_dirty_bytes = parse_num("CHAFF_MAX_DIRTY_BYTES", &v)?;
        }
        if let Some(v) = var("CHAFF_MAX_DIRTY_CALLS") {
            self.max_dirty_calls = parse_num("CHAFF_MAX_DIRTY_CALLS", &v)?;
        }
        if let Some(v) = var("CHAFF_DIRTY_TIMEOUT") {
            self.dirty_timeout_secs = parse_num("CHAFF_DIRTY_TIMEOUT", &v)?;
        }
        if var("CHAFF_NO_SHRED").is_some() {
            self.shred = false;
        }
        if var("CHAFF_NO_SYNC").is_some() {
            self.sync = false;
        }
        if let Some(v) = var("CHAFF_RESERVED_PERCENT") {
            self.reserved_percent = parse_num("CHAFF_RESERVED_PERCENT", &v)?;
        }
        if let Some(v) = var("CHAFF_LAUNDER_PER_MILLE") {
            self.launder_per_mille = parse_num("CHAFF_LAUNDER_PER_MILLE", &v)?;
        }
        if let Some(v) = var("CHAFF_CIPHER") {
            self.cipher.algorithm = v.parse()?;
        }
        if let Some(v) = var("CHAFF_CIPHER_MODE") {
            self.cipher.mode = v.parse()?;
        }
        if let Some(v) = var("CHAFF_KDF_HASH") {
            self.kdf.hash = v.parse()?;
        }
        if let Some(v) = var("CHAFF_KDF_ITERATIONS") {
            self.kdf.iterations = parse_num("CHAFF_KDF_ITERATIONS", &v)?;
        }
        if let Some(v) = var("CHAFF_KDF_MEMORY") {
            self.kdf.memory_kib = parse_num("CHAFF_KDF_MEMORY", &v)?;
        }
        if let Some(v) = var("CHAFF_KDF_SALT") {
            self.kdf.salt = v;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "block size must be a power of two of at least {}",
                MIN_BLOCK_SIZE
            )));
        }
        if self.reserved_percent >= 100 {
            return Err(Error::Config(
                "reserved percent must be below 100".to_string(),
            ));
        }
        if self.launder_per_mille > 1000 {
            return Err(Error::Config(
                "launder probability is per mille and must not exceed 1000".to_string(),
            ));
        }
        if self.kdf.iterations == 0 {
            return Err(Error::Config(
                "KDF iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Idle interval before a deferred flush.
    pub fn dirty_timeout(&self) -> Duration {
        Duration::from_secs(self.dirty_timeout_secs)
    }
}

fn parse_num<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a valid number: {}", name, value)))
}
