//! Positioned I/O on the backing extent.
//!
//! The pool is addressed with explicit offsets only, so there is no shared
//! seek cursor between block accesses.

use crate::error::Result;
use rand::RngCore;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Byte-addressed backing store for the block pool.
pub trait BlockDevice {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush written data to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Resize the backing extent.
    fn set_len(&mut self, len: u64) -> Result<()>;
}

/// Transient conditions that are retried instead of reported.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// File or raw device opened read-write.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    /// Open an existing backing file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Create a backing file of `len` bytes filled with random data, so that
    /// blocks never written by any branch look like encrypted ones.
    pub fn create_random(path: &Path, len: u64, rng: &mut dyn RngCore) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut chunk = vec![0u8; 1 << 16];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            rng.fill_bytes(&mut chunk[..n]);
            file.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;

        Ok(Self { file, len })
    }
}

impl BlockDevice for FileDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.file.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at offset {}", offset),
                    )
                    .into())
                }
                Ok(n) => {
                    buf = &mut std::mem::take(&mut buf)[n..];
                    offset += n as u64;
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_all_at(&mut self, mut offset: u64, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.file.write_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write at offset {}", offset),
                    )
                    .into())
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.len = self.len.max(offset);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }
}

/// In-memory backing store for tests and throwaway volumes.
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    data: Vec<u8>,
    syncs: u64,
}

impl MemoryDevice {
    /// Zero-filled device.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            syncs: 0,
        }
    }

    /// Device filled from `rng`, like a freshly initialized volume.
    pub fn random(len: usize, rng: &mut dyn RngCore) -> Self {
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        Self { data, syncs: 0 }
    }

    /// Wrap an existing image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, syncs: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Number of durability barriers issued.
    pub fn sync_count(&self) -> u64 {
        self.syncs
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflows"))?;
        let end = start + len;
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "access out of bounds: offset={} len={} device_len={}",
                    offset,
                    len,
                    self.data.len()
                ),
            ));
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryDevice {
    fn len_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.syncs += 1;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length overflows"))?;
        self.data.resize(len, 0);
        Ok(())
    }
}
