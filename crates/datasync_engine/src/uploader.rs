//! Chunked transmission of one file.

use crate::capture::{classify, read_up_to, FileKind};
use crate::error::{SyncError, SyncResult};
use crate::transport::DataSyncClient;
use bytes::Bytes;
use datasync_protocol::{UploadMetadata, UploadRequest, UploadResponse, MAX_CHUNK_SIZE};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Summary of an acknowledged upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Number of chunks sent.
    pub chunks: u64,
    /// Number of data bytes sent.
    pub bytes: u64,
    /// Whether the file carried capture metadata.
    pub structured: bool,
}

/// Sends files to the ingestion service.
#[derive(Clone)]
pub struct Uploader {
    client: Arc<dyn DataSyncClient>,
    part_id: String,
}

impl Uploader {
    /// Creates an uploader that attributes data to `part_id`.
    pub fn new(client: Arc<dyn DataSyncClient>, part_id: impl Into<String>) -> Self {
        Self {
            client,
            part_id: part_id.into(),
        }
    }

    /// Returns the destination part id.
    pub fn part_id(&self) -> &str {
        &self.part_id
    }

    /// Uploads the whole of `file`, which was opened from `path`.
    ///
    /// Always starts from the beginning of the file. Every step that can
    /// block (reading, sending, waiting for the reply) returns
    /// [`SyncError::Cancelled`] as soon as `cancel` fires. Any failure
    /// abandons the stream; nothing is kept for the next attempt.
    pub async fn upload(
        &self,
        file: &mut File,
        path: &Path,
        cancel: &CancellationToken,
    ) -> SyncResult<UploadReceipt> {
        let kind = until_cancelled(cancel, classify(file)).await?;
        let structured = matches!(kind, FileKind::Structured(_));
        let metadata = self.metadata_for(path, kind);

        let mut stream = until_cancelled(cancel, self.client.open_upload()).await?;
        until_cancelled(cancel, stream.send(UploadRequest::Metadata(metadata))).await?;

        let mut chunks = 0u64;
        let mut bytes = 0u64;
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            let n = until_cancelled(cancel, async {
                read_up_to(&mut *file, &mut buf).await.map_err(SyncError::from)
            })
            .await?;
            if n == 0 {
                break;
            }

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            until_cancelled(cancel, stream.send(UploadRequest::Chunk(chunk))).await?;
            chunks += 1;
            bytes += n as u64;

            if n < MAX_CHUNK_SIZE {
                break;
            }
        }

        until_cancelled(cancel, stream.send(UploadRequest::Complete { chunks, bytes })).await?;
        let response = until_cancelled(cancel, stream.close_and_recv()).await?;

        match response {
            UploadResponse::Ack {
                chunks: acked_chunks,
                bytes: acked_bytes,
            } if acked_chunks == chunks && acked_bytes == bytes => {
                debug!(path = %path.display(), chunks, bytes, "upload acknowledged");
                Ok(UploadReceipt {
                    chunks,
                    bytes,
                    structured,
                })
            }
            UploadResponse::Ack {
                chunks: acked_chunks,
                bytes: acked_bytes,
            } => Err(SyncError::transport_retryable(format!(
                "service acknowledged {} chunks/{} bytes, sent {}/{}",
                acked_chunks, acked_bytes, chunks, bytes
            ))),
            UploadResponse::Error(status) => Err(SyncError::Status(status)),
        }
    }

    fn metadata_for(&self, path: &Path, kind: FileKind) -> UploadMetadata {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match kind {
            FileKind::Structured(capture) => {
                UploadMetadata::structured(self.part_id.clone(), file_name, capture)
            }
            FileKind::Arbitrary => {
                let extension = path
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                UploadMetadata::arbitrary(self.part_id.clone(), file_name, extension)
            }
        }
    }
}

/// Runs `fut` unless `cancel` fires first.
async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureWriter;
    use crate::transport::{MockClient, MockOutcome};
    use datasync_protocol::{CaptureMetadata, DataType, Status};
    use std::time::Duration;
    use tempfile::tempdir;

    fn uploader(client: &MockClient) -> Uploader {
        Uploader::new(Arc::new(client.clone()), "part-1")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn arbitrary_file_is_chunked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data = pattern(MAX_CHUNK_SIZE * 2 + 100);
        std::fs::write(&path, &data).unwrap();

        let client = MockClient::new();
        let mut file = File::open(&path).await.unwrap();
        let receipt = uploader(&client)
            .upload(&mut file, &path, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.chunks, 3);
        assert_eq!(receipt.bytes, data.len() as u64);
        assert!(!receipt.structured);

        let upload = &client.acked()[0];
        assert_eq!(upload.chunk_sizes, vec![MAX_CHUNK_SIZE, MAX_CHUNK_SIZE, 100]);
        assert_eq!(upload.data, data);
        assert!(upload.completed);

        let meta = upload.metadata.as_ref().unwrap();
        assert_eq!(meta.part_id, "part-1");
        assert_eq!(meta.file_name, "blob.bin");
        assert_eq!(meta.file_extension, ".bin");
        assert_eq!(meta.data_type, DataType::File);
        assert!(meta.capture.is_none());
    }

    #[tokio::test]
    async fn exact_multiple_of_chunk_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("even.bin");
        std::fs::write(&path, pattern(MAX_CHUNK_SIZE * 2)).unwrap();

        let client = MockClient::new();
        let mut file = File::open(&path).await.unwrap();
        let receipt = uploader(&client)
            .upload(&mut file, &path, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.chunks, 2);
        assert_eq!(client.acked()[0].chunk_sizes, vec![MAX_CHUNK_SIZE; 2]);
    }

    #[tokio::test]
    async fn empty_file_sends_metadata_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let client = MockClient::new();
        let mut file = File::open(&path).await.unwrap();
        let receipt = uploader(&client)
            .upload(&mut file, &path, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.chunks, 0);
        let upload = &client.acked()[0];
        assert!(upload.metadata.is_some());
        assert!(upload.chunk_sizes.is_empty());
        assert_eq!(upload.metadata.as_ref().unwrap().file_extension, "");
    }

    #[tokio::test]
    async fn structured_file_sends_capture_metadata_and_data_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arm1.capture");
        let capture = CaptureMetadata::new("arm", "arm1", "EndPosition", DataType::TabularSensor)
            .with_file_extension(".dat");
        let data = pattern(MAX_CHUNK_SIZE + 7);

        let mut writer = CaptureWriter::create(&path, &capture).await.unwrap();
        writer.write(&data).await.unwrap();
        writer.finish().await.unwrap();

        let client = MockClient::new();
        let mut file = File::open(&path).await.unwrap();
        let receipt = uploader(&client)
            .upload(&mut file, &path, &CancellationToken::new())
            .await
            .unwrap();

        assert!(receipt.structured);
        assert_eq!(receipt.bytes, data.len() as u64);

        let upload = &client.acked()[0];
        assert_eq!(upload.data, data);
        let meta = upload.metadata.as_ref().unwrap();
        assert_eq!(meta.capture.as_ref(), Some(&capture));
        assert_eq!(meta.data_type, DataType::TabularSensor);
        assert_eq!(meta.file_extension, ".dat");
    }

    #[tokio::test]
    async fn reupload_starts_from_the_beginning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("again.bin");
        let data = pattern(MAX_CHUNK_SIZE + 1);
        std::fs::write(&path, &data).unwrap();

        let client = MockClient::new();
        let up = uploader(&client);
        let mut file = File::open(&path).await.unwrap();
        up.upload(&mut file, &path, &CancellationToken::new())
            .await
            .unwrap();
        up.upload(&mut file, &path, &CancellationToken::new())
            .await
            .unwrap();

        let acked = client.acked();
        assert_eq!(acked.len(), 2);
        assert_eq!(acked[0].data, data);
        assert_eq!(acked[1].data, data);
    }

    #[tokio::test]
    async fn rejection_surfaces_status() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"x").unwrap();

        let client = MockClient::with_outcomes([MockOutcome::Reject(Status::invalid_argument(
            "bad part",
        ))]);
        let mut file = File::open(&path).await.unwrap();
        let err = uploader(&client)
            .upload(&mut file, &path, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Status(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn stalled_send_unblocks_on_cancel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stall.bin");
        std::fs::write(&path, b"data").unwrap();

        let client = MockClient::with_outcomes([MockOutcome::Stall]);
        let up = uploader(&client);
        let token = CancellationToken::new();

        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.cancel();
        });

        let mut file = File::open(&path).await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            up.upload(&mut file, &path, &token),
        )
        .await
        .expect("upload did not observe cancellation");
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
