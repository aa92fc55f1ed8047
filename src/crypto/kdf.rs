//! Argon2 passphrase stretching and locked key storage.

use crate::config::{KdfConfig, KdfHash};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::warn;
use zeroize::Zeroize;

/// Argon2 lanes. The volume is single-threaded, so one lane.
const PARALLELISM: u32 = 1;

/// Symmetric key bytes pinned in RAM and wiped on drop.
pub struct KeyMaterial {
    bytes: Box<[u8]>,
    locked: bool,
}

impl KeyMaterial {
    /// Allocate a zeroed key buffer and try to lock it into RAM.
    fn zeroed(len: usize) -> Self {
        let bytes = vec![0u8; len].into_boxed_slice();
        let locked = lock_memory(&bytes);
        Self { bytes, locked }
    }

    /// Wrap existing key bytes.
    pub fn from_bytes(key: &[u8]) -> Self {
        let mut material = Self::zeroed(key.len());
        material.bytes.copy_from_slice(key);
        material
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the buffer is pinned against swapping.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
        if self.locked {
            // SAFETY: the pointer and length describe the live boxed slice
            // that was passed to mlock in `zeroed`.
            unsafe {
                libc::munlock(self.bytes.as_ptr() as *const libc::c_void, self.bytes.len());
            }
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.bytes.len())
            .field("locked", &self.locked)
            .finish()
    }
}

fn lock_memory(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    // SAFETY: mlock only pins the pages backing a valid, live allocation.
    let ret = unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if ret != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "could not lock key material in memory"
        );
        return false;
    }
    true
}

/// Key derivation with a fixed, configurable salt.
///
/// The salt is not secret: every branch of a volume uses the same one, so a
/// passphrase alone identifies its key.
#[derive(Debug, Clone)]
pub struct KeyDerivation {
    algorithm: Algorithm,
    iterations: u32,
    memory_kib: u32,
    salt: [u8; 32],
}

impl KeyDerivation {
    /// Build from configuration. The configured salt string is folded to 32
    /// bytes with SHA-256 so salts of any length are accepted.
    pub fn new(config: &KdfConfig) -> Self {
        let algorithm = match config.hash {
            KdfHash::Argon2id => Algorithm::Argon2id,
            KdfHash::Argon2i => Algorithm::Argon2i,
            KdfHash::Argon2d => Algorithm::Argon2d,
        };
        let salt: [u8; 32] = Sha256::digest(config.salt.as_bytes()).into();
        Self {
            algorithm,
            iterations: config.iterations,
            memory_kib: config.memory_kib,
            salt,
        }
    }

    /// Get the effective salt.
    pub fn salt(&self) -> &[u8; 32] {
        &self.salt
    }

    /// Derive a `key_len`-byte key from a passphrase.
    pub fn derive_key(&self, passphrase: &str, key_len: usize) -> Result<KeyMaterial> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            PARALLELISM,
            Some(key_len),
        )
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;

        let argon2 = Argon2::new(self.algorithm, Version::V0x13, params);

        let mut key = KeyMaterial::zeroed(key_len);
        argon2
            .hash_password_into(passphrase.as_bytes(), &self.salt, &mut key.bytes)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;

        Ok(key)
    }
}
