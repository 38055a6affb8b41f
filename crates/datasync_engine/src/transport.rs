//! Client abstraction for the ingestion service.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use datasync_protocol::{Status, UploadMetadata, UploadRequest, UploadResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A connection to the ingestion service.
///
/// Implementations must be safe to share between concurrent uploads; each
/// call to [`open_upload`](Self::open_upload) starts an independent stream.
#[async_trait]
pub trait DataSyncClient: Send + Sync {
    /// Opens a new upload stream.
    async fn open_upload(&self) -> SyncResult<Box<dyn UploadStream>>;

    /// Releases the connection. Later calls to `open_upload` fail.
    async fn close(&self) -> SyncResult<()>;
}

/// One client-streaming upload.
#[async_trait]
pub trait UploadStream: Send {
    /// Sends the next message.
    async fn send(&mut self, request: UploadRequest) -> SyncResult<()>;

    /// Finishes sending and waits for the service's reply.
    async fn close_and_recv(self: Box<Self>) -> SyncResult<UploadResponse>;
}

/// Scripted behavior of one mock upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Accept the upload.
    Ack,
    /// Reply with an error status.
    Reject(Status),
    /// Drop the connection on the first send.
    Disconnect,
    /// Never complete the first send.
    Stall,
    /// Panic on the first send.
    Panic,
}

/// Everything a mock stream received during one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedUpload {
    /// The opening metadata message.
    pub metadata: Option<UploadMetadata>,
    /// Concatenated chunk payloads.
    pub data: Vec<u8>,
    /// Size of each chunk, in order.
    pub chunk_sizes: Vec<usize>,
    /// Whether a `Complete` message arrived.
    pub completed: bool,
    /// Whether the attempt was acknowledged.
    pub acked: bool,
}

#[derive(Debug)]
struct MockState {
    outcomes: Mutex<VecDeque<MockOutcome>>,
    uploads: Mutex<Vec<RecordedUpload>>,
    attempts: AtomicUsize,
    closed: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

/// An in-memory client for testing.
///
/// Attempts consume scripted outcomes in order and fall back to
/// [`MockOutcome::Ack`] once the script is empty.
#[derive(Debug, Clone)]
pub struct MockClient {
    state: Arc<MockState>,
}

impl MockClient {
    /// Creates a mock that acknowledges every upload.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                outcomes: Mutex::new(VecDeque::new()),
                uploads: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                gate: Mutex::new(None),
            }),
        }
    }

    /// Creates a mock with a scripted sequence of outcomes.
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        let client = Self::new();
        client.state.outcomes.lock().extend(outcomes);
        client
    }

    /// Appends an outcome to the script.
    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.state.outcomes.lock().push_back(outcome);
    }

    /// Holds every reply until [`release`](Self::release) is called.
    pub fn hold(&self) {
        *self.state.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Lets `n` held replies through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.state.gate.lock().as_ref() {
            gate.add_permits(n);
        }
    }

    /// Number of upload streams opened.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Every attempt recorded so far.
    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.state.uploads.lock().clone()
    }

    /// Only the acknowledged attempts.
    pub fn acked(&self) -> Vec<RecordedUpload> {
        self.state
            .uploads
            .lock()
            .iter()
            .filter(|u| u.acked)
            .cloned()
            .collect()
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSyncClient for MockClient {
    async fn open_upload(&self) -> SyncResult<Box<dyn UploadStream>> {
        if self.is_closed() {
            return Err(SyncError::NotConnected);
        }
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .state
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(MockOutcome::Ack);
        let index = {
            let mut uploads = self.state.uploads.lock();
            uploads.push(RecordedUpload::default());
            uploads.len() - 1
        };
        Ok(Box::new(MockStream {
            state: Arc::clone(&self.state),
            index,
            outcome,
            sent: 0,
        }))
    }

    async fn close(&self) -> SyncResult<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockStream {
    state: Arc<MockState>,
    index: usize,
    outcome: MockOutcome,
    sent: usize,
}

#[async_trait]
impl UploadStream for MockStream {
    async fn send(&mut self, request: UploadRequest) -> SyncResult<()> {
        self.sent += 1;
        if self.sent == 1 {
            match self.outcome {
                MockOutcome::Disconnect => {
                    return Err(SyncError::transport_retryable("mock connection reset"))
                }
                MockOutcome::Stall => std::future::pending::<()>().await,
                MockOutcome::Panic => panic!("mock stream panicked"),
                MockOutcome::Ack | MockOutcome::Reject(_) => {}
            }
        }

        let mut uploads = self.state.uploads.lock();
        let record = &mut uploads[self.index];
        match request {
            UploadRequest::Metadata(metadata) => record.metadata = Some(metadata),
            UploadRequest::Chunk(data) => {
                record.chunk_sizes.push(data.len());
                record.data.extend_from_slice(&data);
            }
            UploadRequest::Complete { .. } => record.completed = true,
        }
        Ok(())
    }

    async fn close_and_recv(self: Box<Self>) -> SyncResult<UploadResponse> {
        let gate = self.state.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| SyncError::transport_retryable("mock gate closed"))?
                .forget();
        }

        if let MockOutcome::Reject(status) = &self.outcome {
            return Ok(UploadResponse::Error(status.clone()));
        }

        let mut uploads = self.state.uploads.lock();
        let record = &mut uploads[self.index];
        record.acked = true;
        Ok(UploadResponse::Ack {
            chunks: record.chunk_sizes.len() as u64,
            bytes: record.data.len() as u64,
        })
    }
}
