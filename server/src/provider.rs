//! The storage boundary: everything the server needs from an archive.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive not found at {0}")]
    Missing(PathBuf),
    #[error("archive io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt archive manifest: {0}")]
    Manifest(#[from] bincode::Error),
    #[error("{0}")]
    Unavailable(String),
}

/// Checksum and version of one index, in index order within a version table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexVersion {
    pub crc: u32,
    pub version: u32,
}

/// Read access to archived entries.
///
/// Implementations are called from several worker threads at once and must
/// not assume any ordering between calls.
pub trait DataProvider: Send + Sync {
    /// Returns the stored container for an entry, or `None` if it does not exist.
    fn fetch_entry(&self, index: u8, entry: u16) -> Result<Option<Bytes>, ArchiveError>;

    /// Per-index checksums and versions, ordered by index. Read once at startup.
    fn version_table(&self) -> Result<Vec<IndexVersion>, ArchiveError>;
}

/// An archive held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryArchive {
    entries: HashMap<(u8, u16), Bytes>,
    versions: BTreeMap<u8, IndexVersion>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: u8, entry: u16, container: impl Into<Bytes>) {
        if index != u8::MAX {
            self.versions.entry(index).or_default();
        }
        self.entries.insert((index, entry), container.into());
    }

    pub fn set_version(&mut self, index: u8, crc: u32, version: u32) {
        self.versions.insert(index, IndexVersion { crc, version });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DataProvider for MemoryArchive {
    fn fetch_entry(&self, index: u8, entry: u16) -> Result<Option<Bytes>, ArchiveError> {
        Ok(self.entries.get(&(index, entry)).cloned())
    }

    /// Indices without a recorded version fill the gaps with zeroes.
    fn version_table(&self) -> Result<Vec<IndexVersion>, ArchiveError> {
        let count = self
            .versions
            .keys()
            .next_back()
            .map_or(0, |last| usize::from(*last) + 1);
        Ok((0..count)
            .map(|index| {
                self.versions
                    .get(&(index as u8))
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_archive_fetch() {
        let mut archive = MemoryArchive::new();
        assert!(archive.is_empty());

        archive.insert(2, 10, vec![0, 0, 0, 0, 1, 42]);
        assert_eq!(archive.len(), 1);

        let data = archive.fetch_entry(2, 10).unwrap().unwrap();
        assert_eq!(&data[..], &[0, 0, 0, 0, 1, 42]);
        assert!(archive.fetch_entry(2, 11).unwrap().is_none());
        assert!(archive.fetch_entry(3, 10).unwrap().is_none());
    }

    #[test]
    fn test_memory_archive_version_table_fills_gaps() {
        let mut archive = MemoryArchive::new();
        archive.set_version(0, 0xAA, 1);
        archive.set_version(3, 0xDD, 4);

        let table = archive.version_table().unwrap();
        assert_eq!(
            table,
            vec![
                IndexVersion { crc: 0xAA, version: 1 },
                IndexVersion::default(),
                IndexVersion::default(),
                IndexVersion { crc: 0xDD, version: 4 },
            ]
        );
    }

    #[test]
    fn test_empty_archive_has_empty_table() {
        assert!(MemoryArchive::new().version_table().unwrap().is_empty());
    }
}
