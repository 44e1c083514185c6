//! Error types and status mapping.
//!
//! Operations surface a [`ClientError`] whose [`ErrorKind`] is the stable,
//! application-visible classification. Server statuses that the router can
//! recover from on its own (wrong partition owner, busy, internal error) never
//! reach the application; [`classify_status`] decides which is which.

use crate::client::OpResult;
use crate::protocol::{PacketError, Status};
use std::collections::BTreeMap;
use thiserror::Error;

/// Application-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Counter operation against a non-numeric value.
    BadDelta,
    /// Value exceeds the server's item size limit.
    ValueTooBig,
    /// Range error reported by the server.
    BadRange,
    /// Key already exists, or CAS mismatch.
    KeyExists,
    /// Key does not exist, or the value was not stored.
    KeyNotFound,
    /// Transport closed before a response arrived.
    NetworkError,
    /// No response within the operation timeout.
    Timeout,
    /// Authentication against the bucket failed.
    BucketNotFound,
    /// Invalid key, options or value.
    InvalidArguments,
    /// At least one key in a multi operation failed.
    PartialFailure,
    /// The server spoke something this client cannot interpret.
    ProtocolError,
    /// The server is temporarily unable to serve the request.
    TemporaryFailure,
}

impl ErrorKind {
    /// Stable numeric code for this kind.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::BadDelta => 1,
            ErrorKind::ValueTooBig => 2,
            ErrorKind::BadRange => 3,
            ErrorKind::KeyExists => 4,
            ErrorKind::KeyNotFound => 5,
            ErrorKind::NetworkError => 6,
            ErrorKind::Timeout => 7,
            ErrorKind::BucketNotFound => 8,
            ErrorKind::InvalidArguments => 9,
            ErrorKind::PartialFailure => 10,
            ErrorKind::ProtocolError => 13,
            ErrorKind::TemporaryFailure => 14,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::BadDelta => "non-numeric server-side value for incr or decr",
            ErrorKind::ValueTooBig => "object too big",
            ErrorKind::BadRange => "invalid range",
            ErrorKind::KeyExists => "key already exists",
            ErrorKind::KeyNotFound => "key not found",
            ErrorKind::NetworkError => "network error",
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::BucketNotFound => "bucket not found or authentication failed",
            ErrorKind::InvalidArguments => "invalid arguments",
            ErrorKind::PartialFailure => "one or more keys failed",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::TemporaryFailure => "temporary failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A single-key operation failed.
    #[error("{kind}{}", key_suffix(.key))]
    Operation {
        kind: ErrorKind,
        key: Option<String>,
    },

    /// A multi operation where at least one key failed. Every key's outcome is kept.
    #[error("{failed} of {} keys failed", .results.len())]
    PartialFailure {
        results: BTreeMap<String, Result<OpResult, ClientError>>,
        failed: usize,
    },

    /// Client configuration was rejected.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// The engine task is gone.
    #[error("client has shut down")]
    Shutdown,
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(key) => format!(" (key: {})", key),
        None => String::new(),
    }
}

impl ClientError {
    pub fn new(kind: ErrorKind) -> Self {
        Self::Operation { kind, key: None }
    }

    pub fn for_key(kind: ErrorKind, key: impl Into<String>) -> Self {
        Self::Operation {
            kind,
            key: Some(key.into()),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Application-visible classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Operation { kind, .. } => *kind,
            ClientError::PartialFailure { .. } => ErrorKind::PartialFailure,
            ClientError::Config { .. } => ErrorKind::InvalidArguments,
            ClientError::Shutdown => ErrorKind::NetworkError,
        }
    }

    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ClientError::Operation { key, .. } => key.as_deref(),
            _ => None,
        }
    }
}

impl From<PacketError> for ClientError {
    fn from(_: PacketError) -> Self {
        Self::new(ErrorKind::ProtocolError)
    }
}

/// Result type using ClientError.
pub type ClientResult<T> = Result<T, ClientError>;

/// What the router does with a non-success response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    /// Put the operation back on the waiting list. `invalidate` also clears
    /// the partition slot and marks the topology stale.
    Reschedule { invalidate: bool },
    /// Complete the operation with this error.
    Fail(ErrorKind),
}

/// Map a raw status word to the router's reaction.
pub fn classify_status(status: u16) -> StatusAction {
    let Ok(status) = Status::try_from(status) else {
        return StatusAction::Fail(ErrorKind::ProtocolError);
    };
    match status {
        Status::NotMyVbucket => StatusAction::Reschedule { invalidate: true },
        Status::Busy | Status::InternalError => StatusAction::Reschedule { invalidate: false },
        Status::Success => StatusAction::Fail(ErrorKind::ProtocolError),
        Status::KeyNotFound | Status::NotStored => StatusAction::Fail(ErrorKind::KeyNotFound),
        Status::KeyExists => StatusAction::Fail(ErrorKind::KeyExists),
        Status::ValueTooLarge => StatusAction::Fail(ErrorKind::ValueTooBig),
        Status::InvalidArguments => StatusAction::Fail(ErrorKind::InvalidArguments),
        Status::DeltaBadval => StatusAction::Fail(ErrorKind::BadDelta),
        Status::AuthError | Status::AuthContinue => StatusAction::Fail(ErrorKind::BucketNotFound),
        Status::Erange => StatusAction::Fail(ErrorKind::BadRange),
        Status::UnknownCommand | Status::NotSupported => {
            StatusAction::Fail(ErrorKind::ProtocolError)
        }
        Status::OutOfMemory | Status::TemporaryFailure => {
            StatusAction::Fail(ErrorKind::TemporaryFailure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorKind::BadDelta.code(), 1);
        assert_eq!(ErrorKind::NetworkError.code(), 6);
        assert_eq!(ErrorKind::PartialFailure.code(), 10);
        assert_eq!(ErrorKind::ProtocolError.code(), 13);
        assert_eq!(ErrorKind::TemporaryFailure.code(), 14);
    }

    #[test]
    fn test_recoverable_statuses_reschedule() {
        assert_eq!(
            classify_status(0x0007),
            StatusAction::Reschedule { invalidate: true }
        );
        assert_eq!(
            classify_status(0x0085),
            StatusAction::Reschedule { invalidate: false }
        );
        assert_eq!(
            classify_status(0x0084),
            StatusAction::Reschedule { invalidate: false }
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert_eq!(
            classify_status(0x0005),
            StatusAction::Fail(ErrorKind::KeyNotFound)
        );
        assert_eq!(
            classify_status(0x0006),
            StatusAction::Fail(ErrorKind::BadDelta)
        );
        assert_eq!(
            classify_status(0x0020),
            StatusAction::Fail(ErrorKind::BucketNotFound)
        );
        assert_eq!(
            classify_status(0x0086),
            StatusAction::Fail(ErrorKind::TemporaryFailure)
        );
        assert_eq!(
            classify_status(0x7777),
            StatusAction::Fail(ErrorKind::ProtocolError)
        );
    }

    #[test]
    fn test_display_includes_key() {
        let err = ClientError::for_key(ErrorKind::KeyNotFound, "user:1");
        assert_eq!(err.to_string(), "key not found (key: user:1)");
        assert_eq!(err.key(), Some("user:1"));
        assert_eq!(ClientError::Shutdown.kind(), ErrorKind::NetworkError);
    }
}
