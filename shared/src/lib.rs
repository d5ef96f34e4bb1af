//! Wire protocol shared by the file server and cache clients.
//!
//! Every multi-byte integer on the wire is big-endian. "Medium" values are
//! three bytes wide.

use bytes::{BufMut, Bytes, BytesMut};

pub mod codec;

pub use codec::{
    encode_missing, encode_response, wire_len, CodecError, Compression, Container, Response,
    ResponseDecoder, BLOCK_MARKER, BLOCK_SIZE, MAX_CONTAINER_LENGTH, PREFETCH_FLAG,
    RESPONSE_HEADER_SIZE,
};

pub const SYNCHRONISE: u8 = 15;
pub const ACKNOWLEDGE: u8 = 6;
pub const PREFETCH_REQUEST: u8 = 0;
pub const PRIORITY_REQUEST: u8 = 1;
pub const STATUS_LOGGED_IN: u8 = 2;
pub const STATUS_LOGGED_OUT: u8 = 3;
pub const DISCONNECT: u8 = 7;

/// Token a client sends with its acknowledge message.
pub const ACKNOWLEDGE_TOKEN: u32 = 3;
/// Token a client sends with either status update.
pub const STATUS_TOKEN: u32 = 0;

/// Index and entry of the reference table listing every index's crc and version.
pub const REFERENCE_INDEX: u8 = 255;
pub const REFERENCE_ENTRY: u16 = 255;

/// Single-byte replies written by the server during the handshake and on rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    GameUpdated = 6,
    BadSessionId = 10,
    RejectSession = 11,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            6 => Some(Self::GameUpdated),
            10 => Some(Self::BadSessionId),
            11 => Some(Self::RejectSession),
            _ => None,
        }
    }
}

/// Service class of a chunk request.
///
/// Urgent requests are what the client needs right now; normal requests are
/// background prefetch traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Urgent,
    Normal,
}

impl Priority {
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            PRIORITY_REQUEST => Some(Self::Urgent),
            PREFETCH_REQUEST => Some(Self::Normal),
            _ => None,
        }
    }

    pub fn opcode(self) -> u8 {
        match self {
            Self::Urgent => PRIORITY_REQUEST,
            Self::Normal => PREFETCH_REQUEST,
        }
    }
}

/// Messages a client sends once the handshake is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Entry {
        index: u8,
        entry: u16,
        priority: Priority,
    },
    LoggedIn {
        token: u32,
    },
    LoggedOut {
        token: u32,
    },
    Disconnect,
}

impl Request {
    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Request::Entry {
                index,
                entry,
                priority,
            } => {
                buf.put_u8(priority.opcode());
                buf.put_u8(index);
                buf.put_u16(entry);
            }
            Request::LoggedIn { token } => {
                buf.put_u8(STATUS_LOGGED_IN);
                put_medium(buf, token);
            }
            Request::LoggedOut { token } => {
                buf.put_u8(STATUS_LOGGED_OUT);
                put_medium(buf, token);
            }
            Request::Disconnect => buf.put_u8(DISCONNECT),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Bytes a client sends to open the handshake.
pub fn synchronise_bytes(revision: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(SYNCHRONISE);
    buf.put_u32(revision);
    buf.freeze()
}

/// Bytes a client sends to acknowledge a successful handshake.
pub fn acknowledge_bytes(token: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(ACKNOWLEDGE);
    put_medium(&mut buf, token);
    buf.freeze()
}

/// Writes the low 24 bits of `value`.
pub fn put_medium(buf: &mut BytesMut, value: u32) {
    buf.put_uint(u64::from(value & 0x00ff_ffff), 3);
}

pub fn medium_from_bytes(bytes: [u8; 3]) -> u32 {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}
