//! # Datasync Engine
//!
//! Crash-resilient upload of locally captured files to a remote ingestion
//! service.
//!
//! This crate provides:
//! - `SyncManager`: one background task per file, deduplicated by path
//! - `RetryExecutor`: cancellable exponential backoff without an attempt limit
//! - `ProgressTracker`: durable per-file progress marks
//! - `Uploader`: chunked, restart-from-zero transmission of one file
//! - Client abstraction with a TCP implementation and a scripted mock
//!
//! ## Delivery model
//!
//! Uploads are at-least-once. A file is deleted only after the service has
//! acknowledged all of it, and its progress mark is cleared only after that.
//! A crash at any point leaves the mark on disk, so the next process knows
//! the file may have been partially or fully delivered.
//!
//! ## Example
//!
//! ```no_run
//! use datasync_engine::{SyncConfig, SyncManager, TcpClient};
//! use std::sync::Arc;
//!
//! # async fn run() -> datasync_engine::SyncResult<()> {
//! let client = Arc::new(TcpClient::new("10.0.0.5:7070".parse().unwrap()));
//! let manager = SyncManager::new(SyncConfig::new("arm-1", "/var/lib/datasync/progress"), client)?;
//!
//! manager.sync(["/data/capture/front-0001.capture"]);
//! // ...
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capture;
mod config;
mod error;
mod manager;
mod progress;
mod retry;
mod tcp;
mod transport;
mod uploader;

pub use capture::{classify, CaptureWriter, FileKind};
pub use config::{RetryPolicy, StaleMarkPolicy, SyncConfig, MIN_RETRY_WAIT};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use manager::{SyncManager, SyncSession, SyncStats};
pub use progress::{marker_name, MarkRecord, ProgressTracker};
pub use retry::{RetryExecutor, RetryPhase, RetryState};
pub use tcp::TcpClient;
pub use transport::{DataSyncClient, MockClient, MockOutcome, RecordedUpload, UploadStream};
pub use uploader::{UploadReceipt, Uploader};
