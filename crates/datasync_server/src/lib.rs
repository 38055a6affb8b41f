//! # Datasync Server
//!
//! Reference ingestion service for datasync uploads.
//!
//! This crate provides:
//! - A TCP listener speaking the length-delimited CBOR upload protocol
//! - Per-stream validation (metadata first, chunk limits, matching totals)
//! - Atomic storage of each received file under `<store_dir>/<part_id>/`
//!
//! # Error mapping
//!
//! Anything the client got wrong is answered with `InvalidArgument`, which
//! clients treat as permanent. Storage failures are answered with
//! `Internal`, which clients retry.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, StoredUpload, UploadHandler};
pub use server::IngestServer;
