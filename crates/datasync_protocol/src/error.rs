//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or validating protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a message to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A data chunk exceeds the maximum chunk size.
    #[error("chunk of {len} bytes exceeds maximum of {max} bytes")]
    ChunkTooLarge {
        /// Size of the offending chunk.
        len: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A frame on the wire was malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The capture-file header could not be parsed.
    #[error("invalid capture header: {message}")]
    InvalidCaptureHeader {
        /// Description of the header error.
        message: String,
    },

    /// The capture file was written by an unknown format version.
    #[error("unsupported capture format version {0}")]
    UnsupportedVersion(u8),
}

impl ProtocolError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid capture header error.
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidCaptureHeader {
            message: message.into(),
        }
    }
}

/// Errors raised while reading or writing framed messages.
#[derive(Error, Debug)]
pub enum FrameError {
    /// I/O error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame payload was not a valid message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
