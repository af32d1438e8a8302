//! File-layer error types.
//!
//! Backends translate their native failures into [`FsError`]; callers branch
//! on [`FsError::kind`] rather than on individual variants.

use std::io;

use polyfs_types::{Address, AddressError, Capability};
use thiserror::Error;

/// Coarse classification callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The address string could not be parsed. Never retried.
    MalformedAddress,
    /// No backend registered for the scheme. Never retried.
    UnknownScheme,
    /// The handle does not support the operation.
    Unsupported,
    /// Credentials required or rejected; re-prompt and retry.
    Authentication,
    /// Backend, network or local I/O failure. Idempotent reads may be retried.
    IoFailure,
    /// Rename/copy precondition violated.
    InvalidTarget,
}

/// File-layer error type.
#[derive(Debug, Error)]
pub enum FsError {
    /// Address could not be parsed.
    #[error(transparent)]
    MalformedAddress(#[from] AddressError),

    /// No backend registered for this scheme.
    #[error("no backend registered for scheme {0:?}")]
    UnknownScheme(String),

    /// Capability not implemented by this handle.
    #[error("{operation} is not supported by {address}")]
    Unsupported {
        operation: Capability,
        address: String,
    },

    /// Credentials are needed for this address.
    #[error("authentication required for {0}")]
    AuthenticationRequired(Box<Address>),

    /// Credentials were rejected.
    #[error("authentication rejected for {address}: {reason}")]
    AuthenticationRejected {
        address: Box<Address>,
        reason: String,
    },

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Rename/copy target is invalid (e.g. a descendant of the source).
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Remote or helper-process failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// A bounded wait ran out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Create an Unsupported error.
    pub fn unsupported(operation: Capability, address: &Address) -> Self {
        Self::Unsupported {
            operation,
            address: address.to_string(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an InvalidTarget error.
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    /// Create a Backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a Timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an AuthenticationRequired error.
    pub fn auth_required(address: &Address) -> Self {
        Self::AuthenticationRequired(Box::new(address.without_credentials()))
    }

    /// Create an AuthenticationRejected error.
    pub fn auth_rejected(address: &Address, reason: impl Into<String>) -> Self {
        Self::AuthenticationRejected {
            address: Box::new(address.without_credentials()),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::MalformedAddress(_) => ErrorKind::MalformedAddress,
            FsError::UnknownScheme(_) => ErrorKind::UnknownScheme,
            FsError::Unsupported { .. } => ErrorKind::Unsupported,
            FsError::AuthenticationRequired(_) | FsError::AuthenticationRejected { .. } => {
                ErrorKind::Authentication
            }
            FsError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            FsError::NotFound(_)
            | FsError::AlreadyExists(_)
            | FsError::NotADirectory(_)
            | FsError::Backend(_)
            | FsError::Timeout(_)
            | FsError::Io(_) => ErrorKind::IoFailure,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind() == ErrorKind::Unsupported
    }

    /// The address to re-prompt credentials for, if this is an auth failure.
    pub fn auth_address(&self) -> Option<&Address> {
        match self {
            FsError::AuthenticationRequired(a) => Some(a),
            FsError::AuthenticationRejected { address, .. } => Some(address),
            _ => None,
        }
    }
}

/// Convert FsError to std::io::Error for compatibility.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Io(e) => e,
            FsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            FsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            FsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            FsError::Unsupported { .. } => io::Error::new(io::ErrorKind::Unsupported, e.to_string()),
            FsError::AuthenticationRequired(_) | FsError::AuthenticationRejected { .. } => {
                io::Error::new(io::ErrorKind::PermissionDenied, e.to_string())
            }
            FsError::MalformedAddress(_) | FsError::InvalidTarget(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
            FsError::Timeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            other => io::Error::other(other.to_string()),
        }
    }
}

/// File-layer result type.
pub type FsResult<T> = Result<T, FsError>;
