//! Error types for the sync engine.

use datasync_protocol::{FrameError, ProtocolError, Status};
use std::path::PathBuf;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The ingestion service answered with an error status.
    #[error("service error: {0}")]
    Status(Status),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid message or capture header).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local file I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The progress directory, or a marker in it, could not be created or read.
    #[error("progress directory unusable at {path:?}: {source}")]
    ProgressDir {
        /// Directory or marker file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The manager was built outside a tokio runtime.
    #[error("no async runtime: {0}")]
    NoRuntime(String),

    /// Not connected to the service.
    #[error("not connected to server")]
    NotConnected,

    /// The upload was cancelled.
    #[error("upload cancelled")]
    Cancelled,
}

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or service-side failure; retried with backoff.
    Transient,
    /// The request can never succeed as sent; not retried.
    Permanent,
    /// A local file could not be opened, read, deleted or marked.
    LocalIo,
    /// Cooperative cancellation; not a failure.
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Status(status) if status.is_retryable() => ErrorKind::Transient,
            SyncError::Status(_) => ErrorKind::Permanent,
            SyncError::Transport { retryable: true, .. } => ErrorKind::Transient,
            SyncError::Transport { .. } => ErrorKind::Permanent,
            SyncError::NotConnected => ErrorKind::Transient,
            SyncError::Protocol(_) | SyncError::NoRuntime(_) => ErrorKind::Permanent,
            SyncError::Io(_) | SyncError::ProgressDir { .. } => ErrorKind::LocalIo,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Returns true if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<Status> for SyncError {
    fn from(status: Status) -> Self {
        SyncError::Status(status)
    }
}

impl From<FrameError> for SyncError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Protocol(e @ ProtocolError::EncodingFailed { .. }) => SyncError::Protocol(e),
            FrameError::Protocol(e @ ProtocolError::ChunkTooLarge { .. }) => SyncError::Protocol(e),
            // A broken socket or a garbled reply says nothing about the request itself.
            other => SyncError::transport_retryable(other.to_string()),
        }
    }
}
