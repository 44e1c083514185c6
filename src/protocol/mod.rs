//! Binary wire protocol.
//!
//! Every frame is a fixed 24-byte big-endian header followed by a body made of
//! extras, key and value, in that order.
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!   +---------------+---------------+---------------+---------------+
//!  0| Magic         | Opcode        | Key length                    |
//!   +---------------+---------------+---------------+---------------+
//!  4| Extras length | Data type     | vbucket id / status           |
//!   +---------------+---------------+---------------+---------------+
//!  8| Total body length                                             |
//!   +---------------+---------------+---------------+---------------+
//! 12| Opaque (sequence number)                                      |
//!   +---------------+---------------+---------------+---------------+
//! 16| CAS                                                           |
//!   |                                                               |
//!   +---------------+---------------+---------------+---------------+
//! ```
//!
//! - [`packet`] - Frame encode/decode
//! - [`codec`] - Stream reassembly over arbitrary chunk boundaries
//! - [`extras`] - Per-command extras layouts
//! - [`response`] - Opcode-shaped response bodies and change-feed events

pub mod codec;
pub mod extras;
pub mod packet;
pub mod response;

pub use codec::{DecodeResult, PacketDecoder};
pub use packet::{Magic, Packet, PacketError};
pub use response::{FeedEvent, ResponseBody};

/// Request magic byte.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Response magic byte.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Fixed header size.
pub const HEADER_SIZE: usize = 24;

/// Largest key the server accepts.
pub const MAX_KEY_LENGTH: usize = 250;

/// Binary protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    FeedOpen = 0x50,
    FeedAddStream = 0x51,
    FeedCloseStream = 0x52,
    FeedStreamRequest = 0x53,
    FeedFailoverLog = 0x54,
    FeedStreamEnd = 0x55,
    FeedSnapshotMarker = 0x56,
    FeedMutation = 0x57,
    FeedDeletion = 0x58,
    FeedExpiration = 0x59,
    FeedFlush = 0x5a,
    FeedSetVbucketState = 0x5b,
    GetReplica = 0x83,
    Observe = 0x92,
    EvictKey = 0x93,
    GetLocked = 0x94,
    UnlockKey = 0x95,
    GetClusterConfig = 0xb5,
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        opcode as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let opcode = match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x09 => Opcode::GetQ,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            0x0c => Opcode::GetK,
            0x0d => Opcode::GetKQ,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x10 => Opcode::Stat,
            0x11 => Opcode::SetQ,
            0x12 => Opcode::AddQ,
            0x13 => Opcode::ReplaceQ,
            0x14 => Opcode::DeleteQ,
            0x15 => Opcode::IncrementQ,
            0x16 => Opcode::DecrementQ,
            0x17 => Opcode::QuitQ,
            0x18 => Opcode::FlushQ,
            0x19 => Opcode::AppendQ,
            0x1a => Opcode::PrependQ,
            0x1c => Opcode::Touch,
            0x1d => Opcode::Gat,
            0x1e => Opcode::GatQ,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            0x50 => Opcode::FeedOpen,
            0x51 => Opcode::FeedAddStream,
            0x52 => Opcode::FeedCloseStream,
            0x53 => Opcode::FeedStreamRequest,
            0x54 => Opcode::FeedFailoverLog,
            0x55 => Opcode::FeedStreamEnd,
            0x56 => Opcode::FeedSnapshotMarker,
            0x57 => Opcode::FeedMutation,
            0x58 => Opcode::FeedDeletion,
            0x59 => Opcode::FeedExpiration,
            0x5a => Opcode::FeedFlush,
            0x5b => Opcode::FeedSetVbucketState,
            0x83 => Opcode::GetReplica,
            0x92 => Opcode::Observe,
            0x93 => Opcode::EvictKey,
            0x94 => Opcode::GetLocked,
            0x95 => Opcode::UnlockKey,
            0xb5 => Opcode::GetClusterConfig,
            _ => return Err(value),
        };
        Ok(opcode)
    }
}

impl Opcode {
    /// Check if this is a quiet (no-response-on-success) opcode.
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            Opcode::GetQ
                | Opcode::GetKQ
                | Opcode::SetQ
                | Opcode::AddQ
                | Opcode::ReplaceQ
                | Opcode::DeleteQ
                | Opcode::IncrementQ
                | Opcode::DecrementQ
                | Opcode::QuitQ
                | Opcode::FlushQ
                | Opcode::AppendQ
                | Opcode::PrependQ
                | Opcode::GatQ
        )
    }

    /// Get the non-quiet version of this opcode.
    pub fn to_non_quiet(&self) -> Self {
        match self {
            Opcode::GetQ => Opcode::Get,
            Opcode::GetKQ => Opcode::GetK,
            Opcode::SetQ => Opcode::Set,
            Opcode::AddQ => Opcode::Add,
            Opcode::ReplaceQ => Opcode::Replace,
            Opcode::DeleteQ => Opcode::Delete,
            Opcode::IncrementQ => Opcode::Increment,
            Opcode::DecrementQ => Opcode::Decrement,
            Opcode::QuitQ => Opcode::Quit,
            Opcode::FlushQ => Opcode::Flush,
            Opcode::AppendQ => Opcode::Append,
            Opcode::PrependQ => Opcode::Prepend,
            Opcode::GatQ => Opcode::Gat,
            _ => *self,
        }
    }

    /// Get the quiet version of this opcode, if one exists.
    pub fn to_quiet(&self) -> Option<Self> {
        let quiet = match self {
            Opcode::Get => Opcode::GetQ,
            Opcode::GetK => Opcode::GetKQ,
            Opcode::Set => Opcode::SetQ,
            Opcode::Add => Opcode::AddQ,
            Opcode::Replace => Opcode::ReplaceQ,
            Opcode::Delete => Opcode::DeleteQ,
            Opcode::Increment => Opcode::IncrementQ,
            Opcode::Decrement => Opcode::DecrementQ,
            Opcode::Quit => Opcode::QuitQ,
            Opcode::Flush => Opcode::FlushQ,
            Opcode::Append => Opcode::AppendQ,
            Opcode::Prepend => Opcode::PrependQ,
            Opcode::Gat => Opcode::GatQ,
            _ => return None,
        };
        Some(quiet)
    }

    /// True for opcodes the server sends unsolicited on an open change feed.
    pub fn is_feed_event(&self) -> bool {
        matches!(
            self,
            Opcode::FeedStreamEnd
                | Opcode::FeedSnapshotMarker
                | Opcode::FeedMutation
                | Opcode::FeedDeletion
                | Opcode::FeedExpiration
        )
    }
}

/// Binary protocol response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    /// No error.
    Success = 0x0000,
    /// Key not found.
    KeyNotFound = 0x0001,
    /// Key exists (CAS conflict).
    KeyExists = 0x0002,
    /// Value too large.
    ValueTooLarge = 0x0003,
    /// Invalid arguments.
    InvalidArguments = 0x0004,
    /// Item not stored.
    NotStored = 0x0005,
    /// Incr/decr on non-numeric value.
    DeltaBadval = 0x0006,
    /// Partition is owned by another server.
    NotMyVbucket = 0x0007,
    /// Authentication error.
    AuthError = 0x0020,
    /// Authentication continue.
    AuthContinue = 0x0021,
    /// Range error.
    Erange = 0x0022,
    /// Unknown command.
    UnknownCommand = 0x0081,
    /// Out of memory.
    OutOfMemory = 0x0082,
    /// Not supported.
    NotSupported = 0x0083,
    /// Internal error.
    InternalError = 0x0084,
    /// Busy.
    Busy = 0x0085,
    /// Temporary failure.
    TemporaryFailure = 0x0086,
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        status as u16
    }
}

impl TryFrom<u16> for Status {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let status = match value {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::NotStored,
            0x0006 => Status::DeltaBadval,
            0x0007 => Status::NotMyVbucket,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0022 => Status::Erange,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            _ => return Err(value),
        };
        Ok(status)
    }
}

/// Compare-and-swap token.
///
/// Carried as a full `u64` and never narrowed; the 32-bit halves are exposed
/// for callers that store the token split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cas(pub u64);

impl Cas {
    /// Build a token from its high and low 32-bit halves.
    pub fn from_halves(high: u32, low: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    pub fn high(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn low(&self) -> u32 {
        self.0 as u32
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Cas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Cas {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
