//! Resolves entry requests to stored containers.

use crate::provider::{ArchiveError, DataProvider, IndexVersion};
use crate::versions::encode_reference_table;
use bytes::Bytes;
use shared::{REFERENCE_ENTRY, REFERENCE_INDEX};
use std::sync::Arc;

/// Serves the reference table itself and forwards everything else to the
/// archive.
pub struct FileStore {
    provider: Arc<dyn DataProvider>,
    reference_table: Bytes,
}

impl FileStore {
    pub fn new(provider: Arc<dyn DataProvider>, indices: &[IndexVersion]) -> Self {
        Self {
            provider,
            reference_table: encode_reference_table(indices),
        }
    }

    /// Reads the archive's version table once and builds the store around it.
    pub fn open(provider: Arc<dyn DataProvider>) -> Result<(Self, Vec<IndexVersion>), ArchiveError> {
        let indices = provider.version_table()?;
        Ok((Self::new(provider, &indices), indices))
    }

    pub fn fetch(&self, index: u8, entry: u16) -> Result<Option<Bytes>, ArchiveError> {
        if index == REFERENCE_INDEX && entry == REFERENCE_ENTRY {
            return Ok(Some(self.reference_table.clone()));
        }
        self.provider.fetch_entry(index, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryArchive;

    #[test]
    fn test_reference_table_request() {
        let mut archive = MemoryArchive::new();
        archive.set_version(0, 0xABCD, 3);
        let (files, indices) = FileStore::open(Arc::new(archive)).unwrap();
        assert_eq!(indices.len(), 1);

        let data = files.fetch(255, 255).unwrap().unwrap();
        assert_eq!(data, encode_reference_table(&indices));
    }

    #[test]
    fn test_entries_come_from_provider() {
        let mut archive = MemoryArchive::new();
        archive.insert(1, 2, vec![0, 0, 0, 0, 0]);
        archive.insert(255, 3, vec![0, 0, 0, 0, 1, 8]);
        let (files, _) = FileStore::open(Arc::new(archive)).unwrap();

        assert_eq!(&files.fetch(1, 2).unwrap().unwrap()[..], &[0, 0, 0, 0, 0]);
        assert_eq!(&files.fetch(255, 3).unwrap().unwrap()[..], &[0, 0, 0, 0, 1, 8]);
        assert!(files.fetch(1, 3).unwrap().is_none());
    }
}
