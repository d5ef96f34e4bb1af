//! A [`DataProvider`] backed by a directory tree.
//!
//! ```text
//! <root>/<index>/<entry>   stored containers
//! <root>/255/<index>       reference table of each index
//! <root>/versions.bin      bincode manifest of index versions
//! ```

use crate::provider::{ArchiveError, DataProvider, IndexVersion};
use bytes::Bytes;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "versions.bin";
const REFERENCE_DIR: &str = "255";

/// Index versions kept alongside the entry files.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub versions: BTreeMap<u8, u32>,
}

#[derive(Debug)]
pub struct DirectoryArchive {
    root: PathBuf,
    versions: Vec<IndexVersion>,
}

impl DirectoryArchive {
    /// Opens an archive and computes its version table.
    ///
    /// Fails with [`ArchiveError::Missing`] when the reference table
    /// directory is absent.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let root = root.into();
        let references = root.join(REFERENCE_DIR);
        if !references.is_dir() {
            return Err(ArchiveError::Missing(root));
        }

        let manifest = read_manifest(&root)?;
        let mut crcs = BTreeMap::new();
        for dir_entry in fs::read_dir(&references).map_err(|source| io_error(&references, source))? {
            let dir_entry = dir_entry.map_err(|source| io_error(&references, source))?;
            let Some(index) = dir_entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u8>().ok())
                .filter(|index| *index != u8::MAX)
            else {
                continue;
            };
            let path = dir_entry.path();
            let data = fs::read(&path).map_err(|source| io_error(&path, source))?;
            crcs.insert(index, crc32fast::hash(&data));
        }

        let count = crcs
            .keys()
            .chain(manifest.versions.keys())
            .max()
            .map_or(0, |last| usize::from(*last) + 1);
        let versions: Vec<IndexVersion> = (0..count)
            .map(|index| {
                let index = index as u8;
                IndexVersion {
                    crc: crcs.get(&index).copied().unwrap_or(0),
                    version: manifest.versions.get(&index).copied().unwrap_or(0),
                }
            })
            .collect();

        info!(
            "Opened archive at {} with {} indices",
            root.display(),
            versions.len()
        );
        Ok(Self { root, versions })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, index: u8, entry: u16) -> PathBuf {
        entry_path(&self.root, index, entry)
    }
}

impl DataProvider for DirectoryArchive {
    fn fetch_entry(&self, index: u8, entry: u16) -> Result<Option<Bytes>, ArchiveError> {
        let path = self.entry_path(index, entry);
        match fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    fn version_table(&self) -> Result<Vec<IndexVersion>, ArchiveError> {
        Ok(self.versions.clone())
    }
}

/// Lays out a new archive on disk.
#[derive(Debug)]
pub struct ArchiveBuilder {
    root: PathBuf,
    manifest: Manifest,
}

impl ArchiveBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let root = root.into();
        let references = root.join(REFERENCE_DIR);
        fs::create_dir_all(&references).map_err(|source| io_error(&references, source))?;
        Ok(Self {
            root,
            manifest: Manifest::default(),
        })
    }

    pub fn entry(&mut self, index: u8, entry: u16, container: &[u8]) -> Result<&mut Self, ArchiveError> {
        let path = entry_path(&self.root, index, entry);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        fs::write(&path, container).map_err(|source| io_error(&path, source))?;
        Ok(self)
    }

    pub fn version(&mut self, index: u8, version: u32) -> &mut Self {
        self.manifest.versions.insert(index, version);
        self
    }

    /// Writes the manifest and opens the finished archive.
    pub fn finish(self) -> Result<DirectoryArchive, ArchiveError> {
        let path = self.root.join(MANIFEST_FILE);
        let encoded = bincode::serialize(&self.manifest)?;
        fs::write(&path, encoded).map_err(|source| io_error(&path, source))?;
        DirectoryArchive::open(self.root)
    }
}

fn entry_path(root: &Path, index: u8, entry: u16) -> PathBuf {
    root.join(index.to_string()).join(entry.to_string())
}

fn read_manifest(root: &Path) -> Result<Manifest, ArchiveError> {
    let path = root.join(MANIFEST_FILE);
    match fs::read(&path) {
        Ok(data) => Ok(bincode::deserialize(&data)?),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No manifest at {}, index versions default to 0", path.display());
            Ok(Manifest::default())
        }
        Err(source) => Err(io_error(&path, source)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}
