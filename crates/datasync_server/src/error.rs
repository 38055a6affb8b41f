//! Error types for the ingestion server.

use datasync_protocol::{ProtocolError, Status};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the ingestion server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The client broke the upload protocol or sent unusable metadata.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A message violated protocol limits.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if resending the same upload cannot succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServerError::InvalidRequest(_) | ServerError::Protocol(_))
    }

    /// Returns true if the failure is on the server's side.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_) | ServerError::Io(_))
    }

    /// Converts to the status sent back to the client.
    pub fn to_status(&self) -> Status {
        if self.is_client_error() {
            Status::invalid_argument(self.to_string())
        } else {
            Status::internal(self.to_string())
        }
    }
}
