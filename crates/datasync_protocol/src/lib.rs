//! # datasync protocol
//!
//! Upload protocol types and codecs for datasync.
//!
//! This crate provides:
//! - Upload stream messages (`UploadRequest`, `UploadResponse`)
//! - Status codes and their retry classification
//! - The capture-file header format
//! - A length-delimited CBOR frame codec
//!
//! ## Upload stream
//!
//! 1. `Metadata`: destination part and file description
//! 2. `Chunk`*: file data, each at most [`MAX_CHUNK_SIZE`] bytes, in order
//! 3. `Complete`: chunk and byte totals
//!
//! The service answers with a single `Ack` or `Error`. A failed stream is
//! resent from the start, so the service must accept full duplicates.
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod capture;
mod error;
mod frame;
mod messages;
mod status;

pub use error::{FrameError, ProtocolError, ProtocolResult};
pub use frame::{ClientCodec, MessageCodec, ServerCodec, MAX_FRAME_LEN};
pub use messages::{
    from_cbor, to_cbor, CaptureMetadata, DataType, UploadMetadata, UploadRequest, UploadResponse,
};
pub use status::{Status, StatusCode};

/// Maximum number of data bytes carried by one chunk (32 KiB).
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;
