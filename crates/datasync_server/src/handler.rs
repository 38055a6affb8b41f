//! Per-stream upload handling.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use datasync_protocol::{UploadMetadata, UploadRequest, UploadResponse};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A file the server has fully received and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    /// Part the data was attributed to.
    pub part_id: String,
    /// Name the client gave the file.
    pub file_name: String,
    /// Where the data was written.
    pub path: PathBuf,
    /// Number of chunks received.
    pub chunks: u64,
    /// Number of data bytes received.
    pub bytes: u64,
    /// Whether the upload carried capture metadata.
    pub structured: bool,
}

/// State shared by every connection.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    received: RwLock<Vec<StoredUpload>>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            received: RwLock::new(Vec::new()),
        }
    }

    /// Returns every completed upload, oldest first.
    pub fn received(&self) -> Vec<StoredUpload> {
        self.received.read().clone()
    }

    fn record(&self, upload: StoredUpload) {
        self.received.write().push(upload);
    }
}

enum Session {
    AwaitingMetadata,
    Receiving(Receiving),
    Finished,
}

struct Receiving {
    metadata: UploadMetadata,
    temp: PathBuf,
    target: PathBuf,
    file: File,
    chunks: u64,
    bytes: u64,
}

/// Handles the messages of one upload stream.
///
/// Data is written to a temporary file next to its destination and renamed
/// into place only when the client's `Complete` totals match what arrived.
pub struct UploadHandler {
    context: Arc<HandlerContext>,
    session: Session,
}

impl UploadHandler {
    /// Creates a handler for a new stream.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self {
            context,
            session: Session::AwaitingMetadata,
        }
    }

    /// Returns true once the stream has been acknowledged.
    pub fn is_finished(&self) -> bool {
        matches!(self.session, Session::Finished)
    }

    /// Processes the next message.
    ///
    /// Returns `Some(response)` once the stream is complete. Any error ends
    /// the stream; call [`abort`](Self::abort) to discard partial data.
    pub async fn handle(&mut self, request: UploadRequest) -> ServerResult<Option<UploadResponse>> {
        request.validate()?;

        match request {
            UploadRequest::Metadata(metadata) => match self.session {
                Session::AwaitingMetadata => {
                    self.begin(metadata).await?;
                    Ok(None)
                }
                Session::Receiving(_) => {
                    Err(ServerError::InvalidRequest("metadata sent twice".into()))
                }
                Session::Finished => Err(after_completion()),
            },
            UploadRequest::Chunk(data) => match &mut self.session {
                Session::Receiving(rx) => {
                    rx.file.write_all(&data).await?;
                    rx.chunks += 1;
                    rx.bytes += data.len() as u64;
                    Ok(None)
                }
                Session::AwaitingMetadata => Err(metadata_first()),
                Session::Finished => Err(after_completion()),
            },
            UploadRequest::Complete { chunks, bytes } => match self.session {
                Session::Receiving(_) => self.finish(chunks, bytes).await.map(Some),
                Session::AwaitingMetadata => Err(metadata_first()),
                Session::Finished => Err(after_completion()),
            },
        }
    }

    /// Discards any partially received data.
    pub async fn abort(&mut self) {
        if let Session::Receiving(rx) = std::mem::replace(&mut self.session, Session::Finished) {
            drop(rx.file);
            if let Err(e) = fs::remove_file(&rx.temp).await {
                warn!(temp = %rx.temp.display(), error = %e, "failed to remove partial upload");
            }
            debug!(file = %rx.metadata.file_name, bytes = rx.bytes, "upload aborted");
        }
    }

    async fn begin(&mut self, metadata: UploadMetadata) -> ServerResult<()> {
        check_component("part id", &metadata.part_id)?;
        check_component("file name", &metadata.file_name)?;

        let dir = self.context.config.store_dir.join(&metadata.part_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ServerError::Internal(format!("create {}: {}", dir.display(), e)))?;

        let target = dir.join(&metadata.file_name);
        let temp = dir.join(format!(".{}.{}.part", metadata.file_name, Uuid::new_v4()));
        let file = File::create(&temp).await?;

        debug!(
            part_id = %metadata.part_id,
            file = %metadata.file_name,
            structured = metadata.is_structured(),
            "upload started"
        );
        self.session = Session::Receiving(Receiving {
            metadata,
            temp,
            target,
            file,
            chunks: 0,
            bytes: 0,
        });
        Ok(())
    }

    async fn finish(&mut self, chunks: u64, bytes: u64) -> ServerResult<UploadResponse> {
        let Session::Receiving(rx) = &mut self.session else {
            return Err(ServerError::Internal("finish without an open upload".into()));
        };
        if rx.chunks != chunks || rx.bytes != bytes {
            return Err(ServerError::InvalidRequest(format!(
                "client reported {} chunks/{} bytes, received {}/{}",
                chunks, bytes, rx.chunks, rx.bytes
            )));
        }

        rx.file.flush().await?;
        rx.file.sync_all().await?;
        fs::rename(&rx.temp, &rx.target).await?;

        let Session::Receiving(rx) = std::mem::replace(&mut self.session, Session::Finished) else {
            return Err(ServerError::Internal("upload state changed".into()));
        };
        info!(
            part_id = %rx.metadata.part_id,
            file = %rx.metadata.file_name,
            chunks = rx.chunks,
            bytes = rx.bytes,
            "upload stored"
        );
        self.context.record(StoredUpload {
            structured: rx.metadata.is_structured(),
            part_id: rx.metadata.part_id,
            file_name: rx.metadata.file_name,
            path: rx.target,
            chunks: rx.chunks,
            bytes: rx.bytes,
        });

        Ok(UploadResponse::Ack {
            chunks: rx.chunks,
            bytes: rx.bytes,
        })
    }
}

fn metadata_first() -> ServerError {
    ServerError::InvalidRequest("first message must carry metadata".into())
}

fn after_completion() -> ServerError {
    ServerError::InvalidRequest("message after completion".into())
}

/// Rejects names that could escape the store directory.
fn check_component(what: &str, value: &str) -> ServerResult<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0'])
        || Path::new(value).is_absolute();
    if bad {
        return Err(ServerError::InvalidRequest(format!(
            "unusable {}: {:?}",
            what, value
        )));
    }
    Ok(())
}
