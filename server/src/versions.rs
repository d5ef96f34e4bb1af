//! Version information sent to clients.

use crate::provider::IndexVersion;
use bytes::{BufMut, Bytes, BytesMut};
use shared::Compression;
use std::sync::Arc;

/// The values written after the success byte of a handshake.
///
/// Immutable once built and cheap to share between sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTable {
    keys: Arc<[u32]>,
}

impl VersionTable {
    pub fn new(keys: Vec<u32>) -> Self {
        Self { keys: keys.into() }
    }

    /// One checksum per index, in index order.
    pub fn from_indices(indices: &[IndexVersion]) -> Self {
        Self::new(indices.iter().map(|index| index.crc).collect())
    }

    /// Uses the configured keys when there are any, otherwise the archive's checksums.
    pub fn resolve(configured: &[u32], indices: &[IndexVersion]) -> Self {
        if configured.is_empty() {
            Self::from_indices(indices)
        } else {
            Self::new(configured.to_vec())
        }
    }

    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Handshake success reply: the status byte followed by every key.
    pub fn encode_handshake(&self, status: u8) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.keys.len() * 4);
        buf.put_u8(status);
        for key in self.keys.iter() {
            buf.put_u32(*key);
        }
        buf.freeze()
    }
}

/// Encodes the reference table served for index 255, entry 255 as an
/// uncompressed container of `crc, version` pairs.
pub fn encode_reference_table(indices: &[IndexVersion]) -> Bytes {
    let length = indices.len() * 8;
    let mut buf = BytesMut::with_capacity(5 + length);
    buf.put_u8(Compression::None as u8);
    buf.put_u32(length as u32);
    for index in indices {
        buf.put_u32(index.crc);
        buf.put_u32(index.version);
    }
    buf.freeze()
}
