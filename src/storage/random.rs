//! Raw randomness for allocation, IVs, shredding and laundering.

use crate::config::VfsConfig;
use crate::error::Result;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::warn;

/// Random byte stream shared by every consumer in one volume.
pub struct RandomSource {
    inner: Box<dyn RngCore>,
}

impl RandomSource {
    /// Stream bytes from a file such as `/dev/urandom`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            inner: Box::new(FileRng {
                reader: BufReader::new(file),
            }),
        })
    }

    /// Deterministic generator, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Box::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The thread-local OS-seeded generator.
    pub fn thread() -> Self {
        Self {
            inner: Box::new(rand::thread_rng()),
        }
    }

    /// Open the source named by the configuration.
    pub fn from_config(config: &VfsConfig) -> Result<Self> {
        match &config.random_source {
            Some(path) => Self::from_path(path),
            None => Ok(Self::thread()),
        }
    }
}

impl RngCore for RandomSource {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

/// Reads raw bytes from a random device.
struct FileRng {
    reader: BufReader<File>,
}

impl RngCore for FileRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_ne_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_ne_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if let Err(e) = self.reader.read_exact(dest) {
            warn!(error = %e, "random source failed, falling back to the thread generator");
            rand::thread_rng().fill_bytes(dest);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.reader.read_exact(dest).map_err(rand::Error::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_seeded_is_deterministic() {
        let mut a = RandomSource::seeded(7);
        let mut b = RandomSource::seeded(7);
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_file_source_streams_bytes() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [1u8, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut source = RandomSource::from_path(file.path()).unwrap();
        let mut buf = [0u8; 4];
        source.fill_bytes(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);

        let mut rest = [0u8; 4];
        assert!(source.try_fill_bytes(&mut rest).is_ok());
        assert_eq!(rest, [5, 6, 7, 8]);

        assert!(source.try_fill_bytes(&mut rest).is_err());
    }

    #[test]
    fn test_missing_path_is_error() {
        assert!(RandomSource::from_path(Path::new("/nonexistent/random")).is_err());
    }
}
