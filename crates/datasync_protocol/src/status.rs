//! Status codes returned by the ingestion service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical status codes carried in error responses.
///
/// The set mirrors the gRPC status codes so that a service fronted by a
/// gRPC gateway can map its errors one to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// The operation was cancelled.
    Cancelled,
    /// Unknown error.
    Unknown,
    /// The request was malformed and will never succeed as sent.
    InvalidArgument,
    /// A deadline expired before the operation completed.
    DeadlineExceeded,
    /// Some requested entity was not found.
    NotFound,
    /// The caller lacks permission.
    PermissionDenied,
    /// A quota or buffer was exhausted.
    ResourceExhausted,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The operation was aborted.
    Aborted,
    /// Internal service error.
    Internal,
    /// The service is currently unavailable.
    Unavailable,
    /// The request lacks valid credentials.
    Unauthenticated,
}

impl StatusCode {
    /// Returns true if a request failing with this code may succeed when resent.
    ///
    /// Only `InvalidArgument` is permanent: the request itself is wrong.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StatusCode::InvalidArgument)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::DeadlineExceeded => "deadline exceeded",
            StatusCode::NotFound => "not found",
            StatusCode::PermissionDenied => "permission denied",
            StatusCode::ResourceExhausted => "resource exhausted",
            StatusCode::FailedPrecondition => "failed precondition",
            StatusCode::Aborted => "aborted",
            StatusCode::Internal => "internal",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// An error status returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Status code.
    pub code: StatusCode,
    /// Human readable message.
    pub message: String,
}

impl Status {
    /// Creates a new status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an `InvalidArgument` status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// Creates an `Internal` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// Creates an `Unavailable` status.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    /// Returns true if the request may succeed when resent.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
