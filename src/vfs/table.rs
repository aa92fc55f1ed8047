//! The in-memory directory of one branch.
//!
//! A flat, ordered list of entries keyed by full path. The table always
//! holds the root directory `/`. Lookups are linear scans; order is kept
//! stable so that saving twice without changes lays out the same records.

use crate::error::{Error, Result};
use crate::storage::{BlockDevice, BlockStore};
use crate::vfs::chain::max_path_len;
use crate::vfs::path::lookup_form;
use crate::vfs::types::Entry;

/// Key of the root directory.
pub const ROOT: &str = "/";

/// Flat path-keyed directory table.
#[derive(Debug, Clone)]
pub struct DirectoryTable {
    block_size: u32,
    entries: Vec<Entry>,
}

impl DirectoryTable {
    /// A table holding only the root directory.
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            entries: vec![Entry::new(ROOT.to_string())],
        }
    }

    /// Build a table from loaded entries, adding the root if it is missing.
    pub fn from_entries(block_size: u32, mut entries: Vec<Entry>) -> Self {
        if !entries.iter().any(|e| e.path == ROOT) {
            entries.insert(0, Entry::new(ROOT.to_string()));
        }
        Self {
            block_size,
            entries,
        }
    }

    /// Longest key that fits into one directory record.
    pub fn max_path_len(&self) -> usize {
        max_path_len(self.block_size)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, path: &str) -> Option<usize> {
        let wanted = lookup_form(path);
        self.entries.iter().position(|e| e.lookup_path() == wanted)
    }

    /// Find an entry. A trailing slash on either side is ignored, so `/a`
    /// finds both the file `/a` and the directory `/a/`.
    pub fn find(&self, path: &str) -> Option<&Entry> {
        self.position(path).map(|i| &self.entries[i])
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Entry> {
        self.position(path).map(move |i| &mut self.entries[i])
    }

    /// Append a new empty entry. `key` ends with `/` for directories.
    pub fn create(&mut self, key: String) -> Result<&mut Entry> {
        self.check_len(&key)?;
        if self.position(&key).is_some() {
            return Err(Error::AlreadyExists(key));
        }
        self.entries.push(Entry::new(key));
        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }

    /// Remove an entry, shredding and freeing its blocks.
    pub fn remove<D: BlockDevice>(&mut self, path: &str, store: &mut BlockStore<D>) -> Result<Entry> {
        let Some(i) = self.position(path) else {
            return Err(Error::NotFound(path.to_string()));
        };
        if self.entries[i].path == ROOT {
            return Err(Error::InvalidPath("cannot remove the root directory".to_string()));
        }
        let mut entry = self.entries.remove(i);
        entry.release(store)?;
        Ok(entry)
    }

    /// Entries directly below the directory stored as `dir_key`.
    pub fn children<'a>(&'a self, dir_key: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries.iter().filter(move |e| {
            e.path != dir_key
                && e
                    .path
                    .strip_prefix(dir_key)
                    .is_some_and(|rest| !rest.trim_end_matches('/').contains('/'))
        })
    }

    /// Whether anything lives below the directory stored as `dir_key`.
    pub fn has_children(&self, dir_key: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.path != dir_key && e.path.starts_with(dir_key))
    }

    /// Rename one entry, and for a directory every entry below it.
    ///
    /// `from_key` and `to_key` are full keys of the same kind. Nothing is
    /// changed unless every new key fits.
    pub fn rename(&mut self, from_key: &str, to_key: &str) -> Result<()> {
        let Some(i) = self.position(from_key) else {
            return Err(Error::NotFound(from_key.to_string()));
        };
        let moving_dir = self.entries[i].is_directory();

        let renamed: Vec<(usize, String)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(j, e)| {
                if j == i {
                    Some((j, to_key.to_string()))
                } else if moving_dir {
                    e.path
                        .strip_prefix(from_key)
                        .map(|rest| (j, format!("{}{}", to_key, rest)))
                } else {
                    None
                }
            })
            .collect();

        for (_, key) in &renamed {
            self.check_len(key)?;
        }
        for (j, key) in renamed {
            self.entries[j].path = key;
        }
        Ok(())
    }

    fn check_len(&self, key: &str) -> Result<()> {
        let max = self.max_path_len();
        if key.len() > max {
            return Err(Error::PathTooLong {
                len: key.len(),
                max,
            });
        }
        Ok(())
    }

    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_file()).count()
    }

    pub fn dir_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_directory()).count()
    }

    /// Total size of all files.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.length).sum()
    }

    /// Number of data blocks referenced by all files.
    pub fn data_blocks(&self) -> usize {
        self.entries.iter().map(|e| e.blocks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VfsConfig;
    use crate::crypto::BlockCipher;
    use crate::storage::{MemoryDevice, RandomSource};

    const BS: u32 = 512;

    fn table_with(paths: &[&str]) -> DirectoryTable {
        let mut table = DirectoryTable::new(BS);
        for p in paths {
            table.create(p.to_string()).unwrap();
        }
        table
    }

    #[test]
    fn test_new_has_root() {
        let table = DirectoryTable::new(BS);
        assert_eq!(table.len(), 1);
        assert!(table.find("/").unwrap().is_directory());
    }

    #[test]
    fn test_from_entries_adds_root() {
        let table = DirectoryTable::from_entries(BS, vec![Entry::new("/a".to_string())]);
        assert_eq!(table.entries()[0].path, "/");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_find_ignores_trailing_slash() {
        let table = table_with(&["/docs/", "/file"]);
        assert_eq!(table.find("/docs").unwrap().path, "/docs/");
        assert_eq!(table.find("/docs/").unwrap().path, "/docs/");
        assert_eq!(table.find("/file/").unwrap().path, "/file");
        assert!(table.find("/nope").is_none());
    }

    #[test]
    fn test_create_duplicate() {
        let mut table = table_with(&["/a"]);
        assert!(matches!(
            table.create("/a/".to_string()),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_create_path_too_long() {
        let mut table = DirectoryTable::new(BS);
        let max = table.max_path_len();
        let long = format!("/{}", "x".repeat(max));

        assert!(matches!(
            table.create(long),
            Err(Error::PathTooLong { .. })
        ));
        table.create(format!("/{}", "x".repeat(max - 1))).unwrap();
    }

    #[test]
    fn test_children() {
        let table = table_with(&["/a/", "/a/b", "/a/c/", "/a/c/d", "/ab"]);

        let mut top: Vec<&str> = table.children("/").map(|e| e.name()).collect();
        top.sort();
        assert_eq!(top, vec!["a", "ab"]);

        let mut below_a: Vec<&str> = table.children("/a/").map(|e| e.name()).collect();
        below_a.sort();
        assert_eq!(below_a, vec!["b", "c"]);

        assert!(table.has_children("/a/c/"));
        assert!(!table.has_children("/ab/"));
    }

    #[test]
    fn test_rename_moves_descendants() {
        let mut table = table_with(&["/a/", "/a/b", "/a/c/", "/a/c/d", "/ab"]);

        table.rename("/a/", "/z/").unwrap();

        let paths: Vec<&str> = table.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/z/", "/z/b", "/z/c/", "/z/c/d", "/ab"]);
    }

    #[test]
    fn test_rename_checks_every_new_key() {
        let mut table = table_with(&["/a/", "/a/long-name"]);
        let max = table.max_path_len();
        let target = format!("/{}/", "y".repeat(max - 8));

        assert!(matches!(
            table.rename("/a/", &target),
            Err(Error::PathTooLong { .. })
        ));
        assert!(table.find("/a/long-name").is_some());
    }

    #[test]
    fn test_remove_frees_blocks() {
        let config = VfsConfig {
            block_size: BS,
            reserved_percent: 0,
            launder_per_mille: 0,
            ..Default::default()
        };
        let mut store = BlockStore::open(
            MemoryDevice::new(8 * BS as usize),
            RandomSource::seeded(3),
            &config,
        )
        .unwrap();
        let cipher = BlockCipher::passthrough();
        let mut table = DirectoryTable::new(BS);
        table
            .create("/f".to_string())
            .unwrap()
            .ensure_length(3 * BS as u64, &mut store, &cipher)
            .unwrap();
        assert_eq!(store.used_blocks(), 3);

        let removed = table.remove("/f", &mut store).unwrap();

        assert_eq!(removed.path, "/f");
        assert_eq!(store.used_blocks(), 0);
        assert!(table.find("/f").is_none());
        assert!(matches!(table.remove("/f", &mut store), Err(Error::NotFound(_))));
        assert!(matches!(table.remove("/", &mut store), Err(Error::InvalidPath(_))));
    }
}
