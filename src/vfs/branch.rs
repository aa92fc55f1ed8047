//! Passphrase to branch mapping.
//!
//! A branch is a start block plus the key derived from its passphrase.
//! Leading decimal digits of a passphrase name its start block directly;
//! any other passphrase hashes to one. The hashed position depends on the
//! pool size, so a pool that grew must be mounted with a numbered
//! passphrase to find such a branch again.

use crate::config::CipherConfig;
use crate::crypto::{BlockCipher, KeyDerivation};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// An unlocked branch.
#[derive(Debug)]
pub struct Branch {
    pub start: u32,
    pub cipher: BlockCipher,
}

impl Branch {
    /// Locate the branch-start block and derive the key for `passphrase`.
    pub fn unlock(
        passphrase: &str,
        block_count: u32,
        cipher: &CipherConfig,
        kdf: &KeyDerivation,
    ) -> Result<Self> {
        let start = start_block(passphrase, block_count)?;
        let cipher = BlockCipher::from_passphrase(cipher, kdf, passphrase)?;
        Ok(Self { start, cipher })
    }
}

/// Branch-start block for a passphrase.
pub fn start_block(passphrase: &str, block_count: u32) -> Result<u32> {
    if passphrase.is_empty() {
        return Err(Error::InvalidBranch("empty passphrase".to_string()));
    }
    if block_count == 0 {
        return Err(Error::InvalidBranch("empty block pool".to_string()));
    }

    let digits_end = passphrase
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(passphrase.len());
    let digits = &passphrase[..digits_end];

    if digits.is_empty() {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        return Ok((u64::from_be_bytes(head) % u64::from(block_count)) as u32);
    }

    match digits.parse::<u64>() {
        Ok(n) if n < u64::from(block_count) => Ok(n as u32),
        _ => Err(Error::InvalidBranch(format!(
            "start block {} is outside the pool of {} blocks",
            digits, block_count
        ))),
    }
}

/// Split a comma-separated passphrase list. Empty items are dropped and
/// every item is wiped from memory when dropped.
pub fn split_passphrases(list: &str) -> Vec<Zeroizing<String>> {
    list.split(',')
        .filter(|p| !p.is_empty())
        .map(|p| Zeroizing::new(p.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_passphrase() {
        assert_eq!(start_block("2sK1m49se", 100).unwrap(), 2);
        assert_eq!(start_block("42", 100).unwrap(), 42);
        assert_eq!(start_block("0abc", 1).unwrap(), 0);
    }

    #[test]
    fn test_numbered_out_of_range() {
        assert!(matches!(
            start_block("100x", 100),
            Err(Error::InvalidBranch(_))
        ));
        assert!(start_block("99999999999999999999999x", 100).is_err());
    }

    #[test]
    fn test_hashed_passphrase_is_stable() {
        let a = start_block("correct horse", 1000).unwrap();
        let b = start_block("correct horse", 1000).unwrap();
        assert_eq!(a, b);
        assert!(a < 1000);
        assert_ne!(
            start_block("battery staple", 1_000_000).unwrap(),
            start_block("correct horse", 1_000_000).unwrap()
        );
    }

    #[test]
    fn test_empty_passphrase() {
        assert!(start_block("", 10).is_err());
    }

    #[test]
    fn test_split_passphrases() {
        let split = split_passphrases("7hidden,3 public,,");
        let items: Vec<&str> = split.iter().map(|p| p.as_str()).collect();
        assert_eq!(items, vec!["7hidden", "3 public"]);
        assert!(split_passphrases(",").is_empty());
    }

    #[test]
    fn test_split_passphrases_are_zeroizable() {
        let mut split: Vec<Zeroizing<String>> = split_passphrases("1first,2second");
        let mut last = split.pop().unwrap();
        zeroize::Zeroize::zeroize(&mut *last);
        assert!(last.is_empty());
        assert_eq!(split[0].as_str(), "1first");
    }
}
