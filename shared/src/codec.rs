//! Archive containers and the block framing used to stream them.
//!
//! A response is a 4 byte header (`index`, `entry`, `flags`) followed by the
//! container minus its compression byte, which travels in `flags`. The byte
//! stream is cut into [`BLOCK_SIZE`] blocks and every block after the first
//! starts with [`BLOCK_MARKER`].

use crate::Priority;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const BLOCK_SIZE: usize = 512;
pub const BLOCK_MARKER: u8 = 0xFF;
pub const RESPONSE_HEADER_SIZE: usize = 4;
/// Set in the flags byte of responses to normal priority requests.
pub const PREFETCH_FLAG: u8 = 0x80;
/// Largest container length the codec accepts.
pub const MAX_CONTAINER_LENGTH: usize = 64 * 1024 * 1024;

/// Compression byte plus the length field, the smallest possible container.
const MIN_CONTAINER_SIZE: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("container truncated: {len} bytes")]
    Truncated { len: usize },
    #[error("unknown compression type {0}")]
    UnknownCompression(u8),
    #[error("container length {length} exceeds the {} byte limit", MAX_CONTAINER_LENGTH)]
    TooLarge { length: usize },
    #[error("container declares {declared} bytes but only {available} are stored")]
    LengthMismatch { declared: usize, available: usize },
    #[error("expected block marker at offset {offset}, found {found:#04x}")]
    MissingMarker { offset: usize, found: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Bzip2 = 1,
    Gzip = 2,
}

impl Compression {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Bzip2),
            2 => Some(Self::Gzip),
            _ => None,
        }
    }

    /// Length fields that precede the data: the stored length, plus the
    /// decompressed length for compressed containers.
    pub fn header_len(self) -> usize {
        match self {
            Self::None => 4,
            Self::Bzip2 | Self::Gzip => 8,
        }
    }
}

/// A validated view over a stored container.
#[derive(Debug, Clone, Copy)]
pub struct Container<'a> {
    compression: Compression,
    body: &'a [u8],
}

impl<'a> Container<'a> {
    /// Validates `data` and trims anything past the declared length, such as
    /// a version trailer.
    pub fn parse(data: &'a [u8]) -> Result<Self, CodecError> {
        if data.len() < MIN_CONTAINER_SIZE {
            return Err(CodecError::Truncated { len: data.len() });
        }
        let compression =
            Compression::from_u8(data[0]).ok_or(CodecError::UnknownCompression(data[0]))?;
        let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        if length > MAX_CONTAINER_LENGTH {
            return Err(CodecError::TooLarge { length });
        }

        let declared = length + compression.header_len();
        let available = data.len() - 1;
        if declared > available {
            return Err(CodecError::LengthMismatch {
                declared,
                available,
            });
        }

        Ok(Self {
            compression,
            body: &data[1..1 + declared],
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Everything after the compression byte, up to the declared length.
    pub fn body(&self) -> &'a [u8] {
        self.body
    }
}

/// Number of bytes `content` header and payload bytes occupy once block
/// markers are inserted.
pub fn wire_len(content: usize) -> usize {
    if content <= BLOCK_SIZE {
        content
    } else {
        let rest = content - BLOCK_SIZE;
        content + rest.div_ceil(BLOCK_SIZE - 1)
    }
}

/// Frames a container as a response. Every returned frame is exactly
/// [`BLOCK_SIZE`] bytes except possibly the last.
pub fn encode_response(
    index: u8,
    entry: u16,
    container: &Container<'_>,
    priority: Priority,
) -> Vec<Bytes> {
    encode_frames(index, entry, container.compression(), container.body(), priority)
}

/// Frames the empty container sent for entries that cannot be served.
pub fn encode_missing(index: u8, entry: u16, priority: Priority) -> Vec<Bytes> {
    encode_frames(index, entry, Compression::None, &[0; 4], priority)
}

fn encode_frames(
    index: u8,
    entry: u16,
    compression: Compression,
    body: &[u8],
    priority: Priority,
) -> Vec<Bytes> {
    let mut flags = compression as u8;
    if priority == Priority::Normal {
        flags |= PREFETCH_FLAG;
    }

    let total = wire_len(RESPONSE_HEADER_SIZE + body.len());
    let mut wire = BytesMut::with_capacity(total);
    let mut frames = Vec::with_capacity(total.div_ceil(BLOCK_SIZE));

    wire.put_u8(index);
    wire.put_u16(entry);
    wire.put_u8(flags);

    let mut remaining = body;
    loop {
        let take = remaining.len().min(BLOCK_SIZE - wire.len());
        wire.put_slice(&remaining[..take]);
        remaining = &remaining[take..];
        frames.push(wire.split().freeze());
        if remaining.is_empty() {
            break;
        }
        wire.put_u8(BLOCK_MARKER);
    }
    frames
}

/// A reassembled response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub index: u8,
    pub entry: u16,
    pub priority: Priority,
    pub compression: Compression,
    /// The container as stored, compression byte included, without trailer.
    pub container: Bytes,
}

impl Response {
    /// True for the empty container the server sends for unavailable entries.
    pub fn is_missing(&self) -> bool {
        self.compression == Compression::None && self.container[1..] == [0, 0, 0, 0]
    }

    /// The container's data after its length fields.
    pub fn data(&self) -> &[u8] {
        &self.container[1 + self.compression.header_len()..]
    }
}

/// Incremental response decoder.
///
/// Feed it a buffer that grows as bytes arrive; it consumes one complete
/// response at a time and leaves partial data in place.
#[derive(Debug, Default)]
pub struct ResponseDecoder;

impl ResponseDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Response>, CodecError> {
        // Header plus the length field, both always inside the first block.
        if buf.len() < RESPONSE_HEADER_SIZE + 4 {
            return Ok(None);
        }

        let flags = buf[3];
        let compression = Compression::from_u8(flags & !PREFETCH_FLAG)
            .ok_or(CodecError::UnknownCompression(flags & !PREFETCH_FLAG))?;
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if length > MAX_CONTAINER_LENGTH {
            return Err(CodecError::TooLarge { length });
        }

        let body_len = length + compression.header_len();
        let total = wire_len(RESPONSE_HEADER_SIZE + body_len);
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let wire = buf.split_to(total);
        let mut container = BytesMut::with_capacity(1 + body_len);
        container.put_u8(compression as u8);

        let mut offset = RESPONSE_HEADER_SIZE;
        let mut block_end = BLOCK_SIZE.min(total);
        loop {
            container.put_slice(&wire[offset..block_end]);
            if block_end == total {
                break;
            }
            if wire[block_end] != BLOCK_MARKER {
                return Err(CodecError::MissingMarker {
                    offset: block_end,
                    found: wire[block_end],
                });
            }
            offset = block_end + 1;
            block_end = (block_end + BLOCK_SIZE).min(total);
        }

        let priority = if flags & PREFETCH_FLAG != 0 {
            Priority::Normal
        } else {
            Priority::Urgent
        };

        Ok(Some(Response {
            index: wire[0],
            entry: u16::from_be_bytes([wire[1], wire[2]]),
            priority,
            compression,
            container: container.freeze(),
        }))
    }
}
