//! Per-block AES encryption in a length-preserving stream mode.
//!
//! Every block is encrypted independently. The counter block fed to the mode
//! is built from the block's IV and its index in the pool, so a block image
//! copied to another position does not decrypt to the same plaintext and two
//! blocks never share a keystream unless both index and IV collide.

use crate::config::{CipherAlgorithm, CipherConfig, CipherMode};
use crate::crypto::kdf::{KeyDerivation, KeyMaterial};
use crate::error::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

/// Size of the counter/IV block handed to the stream mode (AES block size).
pub const NONCE_SIZE: usize = 16;

/// AES stream cipher bound to one branch key, or a raw passthrough.
#[derive(Debug)]
pub struct BlockCipher {
    keyed: Option<Keyed>,
}

#[derive(Debug)]
struct Keyed {
    algorithm: CipherAlgorithm,
    mode: CipherMode,
    key: KeyMaterial,
}

impl BlockCipher {
    /// A cipher that leaves blocks untouched.
    pub fn passthrough() -> Self {
        Self { keyed: None }
    }

    /// Create a cipher from an already derived key.
    pub fn new(config: &CipherConfig, key: KeyMaterial) -> Result<Self> {
        if config.algorithm == CipherAlgorithm::None {
            return Ok(Self::passthrough());
        }
        if key.as_bytes().len() != config.algorithm.key_len() {
            return Err(Error::Crypto(format!(
                "{:?} needs a {}-byte key, got {}",
                config.algorithm,
                config.algorithm.key_len(),
                key.as_bytes().len()
            )));
        }
        Ok(Self {
            keyed: Some(Keyed {
                algorithm: config.algorithm,
                mode: config.mode,
                key,
            }),
        })
    }

    /// Derive the branch key from a passphrase and build the cipher.
    pub fn from_passphrase(
        config: &CipherConfig,
        kdf: &KeyDerivation,
        passphrase: &str,
    ) -> Result<Self> {
        if config.algorithm == CipherAlgorithm::None {
            return Ok(Self::passthrough());
        }
        let key = kdf.derive_key(passphrase, config.algorithm.key_len())?;
        Self::new(config, key)
    }

    /// Whether this cipher is a raw passthrough.
    pub fn is_passthrough(&self) -> bool {
        self.keyed.is_none()
    }

    /// Encrypt one block under a fresh random IV.
    ///
    /// Returns the ciphertext and the IV, which the caller must keep next to
    /// the block reference. IVs are drawn from 32 bits because that is what
    /// a directory record stores.
    pub fn encrypt_block(
        &self,
        plaintext: &[u8],
        index: u32,
        rng: &mut dyn RngCore,
    ) -> Result<(Vec<u8>, u64)> {
        let mut buf = plaintext.to_vec();
        if self.is_passthrough() {
            return Ok((buf, 0));
        }
        let iv = u64::from(rng.next_u32());
        self.apply_keystream(&mut buf, index, iv)?;
        Ok((buf, iv))
    }

    /// Decrypt one block written by [`BlockCipher::encrypt_block`].
    pub fn decrypt_block(&self, ciphertext: &[u8], index: u32, iv: u64) -> Result<Vec<u8>> {
        let mut buf = ciphertext.to_vec();
        self.apply_keystream(&mut buf, index, iv)?;
        Ok(buf)
    }

    /// XOR the keystream for `(index, iv)` into `buf`. Encryption and
    /// decryption are the same operation.
    pub fn apply_keystream(&self, buf: &mut [u8], index: u32, iv: u64) -> Result<()> {
        let Some(keyed) = &self.keyed else {
            return Ok(());
        };
        let nonce = nonce_for(index, iv);
        let key = keyed.key.as_bytes();
        match (keyed.algorithm, keyed.mode) {
            (CipherAlgorithm::Aes128, CipherMode::Ofb) => {
                keystream::<ofb::Ofb<Aes128>>(key, &nonce, buf)
            }
            (CipherAlgorithm::Aes192, CipherMode::Ofb) => {
                keystream::<ofb::Ofb<Aes192>>(key, &nonce, buf)
            }
            (CipherAlgorithm::Aes256, CipherMode::Ofb) => {
                keystream::<ofb::Ofb<Aes256>>(key, &nonce, buf)
            }
            (CipherAlgorithm::Aes128, CipherMode::Ctr) => {
                keystream::<ctr::Ctr32BE<Aes128>>(key, &nonce, buf)
            }
            (CipherAlgorithm::Aes192, CipherMode::Ctr) => {
                keystream::<ctr::Ctr32BE<Aes192>>(key, &nonce, buf)
            }
            (CipherAlgorithm::Aes256, CipherMode::Ctr) => {
                keystream::<ctr::Ctr32BE<Aes256>>(key, &nonce, buf)
            }
            (CipherAlgorithm::None, _) => Ok(()),
        }
    }
}

/// Counter block layout: `iv (8, BE) | index (4, BE) | zero (4)`.
/// The trailing zero word is the CTR block counter.
fn nonce_for(index: u32, iv: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&iv.to_be_bytes());
    nonce[8..12].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn keystream<C>(key: &[u8], nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) -> Result<()>
where
    C: KeyIvInit + StreamCipher,
{
    let mut cipher =
        C::new_from_slices(key, nonce).map_err(|e| Error::Crypto(e.to_string()))?;
    cipher
        .try_apply_keystream(buf)
        .map_err(|e| Error::Crypto(e.to_string()))
}
