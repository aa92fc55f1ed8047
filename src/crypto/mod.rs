//! Cryptographic operations for Chaff VFS.
//!
//! This module provides:
//! - Per-block AES encryption in OFB or CTR mode, keyed per branch
//! - Argon2 passphrase stretching into locked key memory

mod cipher;
mod kdf;

pub use cipher::{BlockCipher, NONCE_SIZE};
pub use kdf::{KeyDerivation, KeyMaterial};
