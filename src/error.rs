//! Typed error hierarchy for gosh-swarm
//!
//! Every error carries enough context to decide how the transfer core
//! recovers from it. Nothing in this crate treats an error as fatal to the
//! process: [`TransferError::class`] maps each error onto the recovery
//! taxonomy the state machine acts upon.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the transfer core
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-related errors (connection, timeout, reset, etc.)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// The remote served something other than what was asked for
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// The remote refused service (rate limiting, banning)
    #[error("Refused by peer ({status}): {message}")]
    Refused { status: u16, message: String },

    /// Overlap bytes at the resume point differ from what is on disk
    #[error("Resume mismatch at offset {offset}")]
    ResumeMismatch { offset: u64 },

    /// Local storage errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Resource limits exceeded
    #[error("Resource limit exceeded: {resource} (limit: {limit})")]
    ResourceLimit {
        resource: &'static str,
        limit: usize,
    },

    /// Unknown source, peer or file
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Persistence record could not be parsed
    #[error("Malformed record at line {line}: {message}")]
    Record { line: usize, message: String },

    /// Service is shutting down
    #[error("Transfer service is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused
    ConnectionRefused,
    /// Connection reset
    ConnectionReset,
    /// Connect attempt timed out
    ConnectTimeout,
    /// No header received in time
    HeaderTimeout,
    /// No body data received in time
    DataStall,
    /// Push request got no reverse connection in time
    PushTimeout,
    /// Peer is neither reachable directly nor via push
    Unreachable,
    /// Remote closed the connection early
    EarlyEof,
    /// Server returned an error status we retry on
    HttpStatus(u16),
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Advertised content hash differs from ours
    HashMismatch,
    /// Advertised file size differs from ours
    SizeMismatch,
    /// Served range differs from the requested range
    RangeMismatch,
    /// Response could not be interpreted
    InvalidResponse,
    /// Remote no longer has the file
    FileNotFound,
    /// No range left to request for this file
    NothingLeft,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Seek, read or write failed
    Io,
    /// Open/create failed
    Open,
}

/// Recovery taxonomy applied by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with growing backoff; beyond the cap the peer is unavailable
    Transient,
    /// Drop from the mesh, stop with error, do not retry
    ProtocolMismatch,
    /// Peer is refusing us; hold the whole peer
    Refusal,
    /// Overlap bytes differ; apply the resume mismatch policy
    ResumeMismatch,
    /// Local disk trouble; stop with error
    LocalIo,
    /// Caller mistakes and internal bugs; surfaced, never retried
    Usage,
}

impl TransferError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Refused { .. } => true,
            Self::ResumeMismatch { .. } => true,
            _ => false,
        }
    }

    /// Map the error onto the recovery taxonomy
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network { .. } => FailureClass::Transient,
            Self::Protocol { .. } => FailureClass::ProtocolMismatch,
            Self::Refused { .. } => FailureClass::Refusal,
            Self::ResumeMismatch { .. } => FailureClass::ResumeMismatch,
            Self::Storage { .. } => FailureClass::LocalIo,
            _ => FailureClass::Usage,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = !matches!(kind, NetworkErrorKind::HttpStatus(404 | 410));
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input("config", format!("JSON error: {}", err))
    }
}
