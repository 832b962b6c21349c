//! Error types shared by the protocol codec, the storage and the clients.

use crate::placement::ShardId;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::PathBuf;

pub type ShardResult<T> = Result<T, ShardError>;

/// An error that can occur while transferring or storing a file.
#[derive(Debug)]
#[non_exhaustive]
pub enum ShardError {
    /// A length or size field on the wire is out of range. The message cannot be recovered.
    ProtocolViolation(&'static str),
    /// The peer closed the connection (or failed) before the expected number of bytes arrived.
    ShortRead {
        /// Number of bytes that were expected.
        expected: u64,
        /// Number of bytes actually received.
        received: u64,
    },
    /// The requested file does not exist.
    NotFound,
    /// A storage node could not be connected to.
    UnreachablePeer {
        /// The shard owned by the node.
        shard: ShardId,
        /// The underlying connection error.
        error: io::Error,
    },
    /// The file name has no extension the placement policy knows about.
    UnsupportedType(String),
    /// The operation is not supported for the given file type.
    UnsupportedOperation(String),
    /// A logical path is malformed or escapes the storage root.
    InvalidPath(String),
    /// A local I/O error, optionally on a specific path.
    Io {
        /// The underlying error.
        error: io::Error,
        /// The path the operation was performed on, if any.
        path: Option<PathBuf>,
    },
}

impl ShardError {
    pub fn short_read(expected: u64, received: u64) -> Self {
        Self::ShortRead { expected, received }
    }

    /// Whether the error leaves the connection it occurred on unusable.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_) | Self::ShortRead { .. })
    }
}

impl Display for ShardError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::ShortRead { expected, received } => {
                write!(f, "short read: received {received} of {expected} bytes")
            }
            Self::NotFound => write!(f, "file not found"),
            Self::UnreachablePeer { shard, error } => {
                write!(f, "cannot reach storage node {shard}: {error}")
            }
            Self::UnsupportedType(name) => write!(f, "unsupported file type: {name}"),
            Self::UnsupportedOperation(what) => write!(f, "unsupported operation: {what}"),
            Self::InvalidPath(path) => write!(f, "invalid path: {path}"),
            Self::Io {
                error,
                path: Some(path),
            } => write!(f, "I/O error on path {}: {error}", path.display()),
            Self::Io { error, path: None } => write!(f, "I/O error: {error}"),
        }
    }
}

impl std::error::Error for ShardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnreachablePeer { error, .. } | Self::Io { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for ShardError {
    fn from(error: io::Error) -> Self {
        Self::Io { error, path: None }
    }
}

impl From<ShardError> for io::Error {
    fn from(value: ShardError) -> Self {
        let kind = match value {
            ShardError::Io { error, .. } => return error,
            ShardError::ProtocolViolation(_) => io::ErrorKind::InvalidData,
            ShardError::ShortRead { .. } => io::ErrorKind::UnexpectedEof,
            ShardError::NotFound => io::ErrorKind::NotFound,
            ShardError::UnreachablePeer { .. } => io::ErrorKind::ConnectionRefused,
            ShardError::UnsupportedType(_) | ShardError::UnsupportedOperation(_) => {
                io::ErrorKind::Unsupported
            }
            ShardError::InvalidPath(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, value)
    }
}

/// Attaches a filesystem path to I/O errors.
pub trait WithPath<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> ShardResult<T>;
}

impl<T> WithPath<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> ShardResult<T> {
        self.map_err(|error| ShardError::Io {
            error,
            path: Some(path.into()),
        })
    }
}
