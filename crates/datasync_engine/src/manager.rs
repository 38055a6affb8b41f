//! Scheduling of per-file upload tasks.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::progress::ProgressTracker;
use crate::retry::RetryExecutor;
use crate::transport::DataSyncClient;
use crate::uploader::Uploader;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Counters describing the manager's work since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Tasks spawned.
    pub scheduled: u64,
    /// Tasks whose upload was acknowledged.
    pub succeeded: u64,
    /// Tasks stopped by `close`.
    pub cancelled: u64,
    /// Tasks that gave up on a permanent or local error, or panicked.
    pub abandoned: u64,
    /// Upload attempts across all tasks.
    pub attempts: u64,
}

/// What one call to [`SyncManager::sync`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    /// Identifier used in log output for this call.
    pub id: Uuid,
    /// Paths that got a new upload task.
    pub accepted: Vec<PathBuf>,
    /// Paths left alone: already in flight, unmarkable, or the manager is closed.
    pub skipped: Vec<PathBuf>,
}

/// How an upload task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Succeeded,
    Cancelled,
    Abandoned,
}

struct Inner {
    config: SyncConfig,
    client: Arc<dyn DataSyncClient>,
    uploader: Uploader,
    retry: RetryExecutor,
    progress: ProgressTracker,
    reclaimed: Vec<PathBuf>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    handle: Handle,
    /// Set once by `close`. `sync` holds the read side while it marks and
    /// spawns, so no task can be added after `close` has closed the tracker.
    closed: RwLock<bool>,
    stats: RwLock<SyncStats>,
}

/// Uploads files in the background, one task per path, and deletes each
/// file once the service has acknowledged it.
///
/// A path is never uploaded by two tasks at once, and its progress mark
/// outlives the process until the upload is confirmed.
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    /// Creates a manager on the current tokio runtime.
    ///
    /// Prepares the progress directory and applies the configured
    /// stale-mark policy to anything a previous process left behind.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NoRuntime`] outside a tokio runtime and
    /// [`SyncError::ProgressDir`] if the progress directory is unusable.
    pub fn new(config: SyncConfig, client: Arc<dyn DataSyncClient>) -> SyncResult<Self> {
        let handle = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;

        let progress = ProgressTracker::new(&config.progress_dir);
        let reclaimed = progress.initialize(config.stale_marks)?;
        if !reclaimed.is_empty() {
            info!(
                count = reclaimed.len(),
                policy = ?config.stale_marks,
                "found progress marks from a previous run"
            );
        }

        let uploader = Uploader::new(Arc::clone(&client), config.part_id.clone());
        let retry = RetryExecutor::new(config.retry.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                uploader,
                retry,
                progress,
                reclaimed,
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                handle,
                closed: RwLock::new(false),
                stats: RwLock::new(SyncStats::default()),
            }),
        })
    }

    /// Starts uploading every path that is not already in flight.
    ///
    /// Returns immediately; uploads continue in the background until they
    /// succeed, fail permanently, or [`close`](Self::close) is called.
    /// Marking a path writes its marker synchronously before the task is
    /// spawned.
    pub fn sync<I, P>(&self, paths: I) -> SyncSession
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut session = SyncSession {
            id: Uuid::new_v4(),
            accepted: Vec::new(),
            skipped: Vec::new(),
        };

        let closed = self.inner.closed.read();
        if *closed {
            session.skipped = paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
            warn!(session = %session.id, count = session.skipped.len(), "sync called after close");
            return session;
        }

        for path in paths {
            let path = path.as_ref().to_path_buf();
            match self.inner.progress.try_mark(&path) {
                Ok(true) => {
                    self.spawn_upload(path.clone());
                    session.accepted.push(path);
                }
                Ok(false) => {
                    debug!(path = %path.display(), "already in progress");
                    session.skipped.push(path);
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to mark file");
                    session.skipped.push(path);
                }
            }
        }
        drop(closed);

        debug!(
            session = %session.id,
            accepted = session.accepted.len(),
            skipped = session.skipped.len(),
            "sync scheduled"
        );
        session
    }

    /// Cancels all uploads, waits for every task to finish, then closes the
    /// client.
    ///
    /// Interrupted uploads keep their progress marks. Later or concurrent
    /// calls do not close anything again, but still return only once every
    /// task has finished.
    pub async fn close(&self) {
        let first = {
            let mut closed = self.inner.closed.write();
            !std::mem::replace(&mut *closed, true)
        };
        if !first {
            self.inner.tasks.wait().await;
            return;
        }

        info!(active = self.inner.tasks.len(), "closing sync manager");
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if let Err(e) = self.inner.client.close().await {
            warn!(error = %e, "failed to close client");
        }
        info!("sync manager closed");
    }

    /// Returns true if `path` has an upload in flight or a blocked mark.
    pub fn in_progress(&self, path: impl AsRef<Path>) -> bool {
        self.inner.progress.in_progress(path.as_ref())
    }

    /// Returns every marked path, sorted.
    pub fn pending(&self) -> Vec<PathBuf> {
        self.inner.progress.pending()
    }

    /// Returns the paths found in stale marks at startup.
    pub fn reclaimed(&self) -> &[PathBuf] {
        &self.inner.reclaimed
    }

    /// Releases a mark so the path can be synced again.
    ///
    /// Meant for marks kept by [`StaleMarkPolicy::Block`](crate::StaleMarkPolicy::Block)
    /// or left by a permanently failed upload. Clearing a path whose upload is
    /// still running allows a duplicate upload.
    pub fn clear(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        self.inner.progress.clear(path.as_ref())
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> SyncStats {
        *self.inner.stats.read()
    }

    /// Number of tasks that have not finished.
    pub fn active_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Returns the destination part id.
    pub fn part_id(&self) -> &str {
        &self.inner.config.part_id
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }

    fn spawn_upload(&self, path: PathBuf) {
        self.inner.stats.write().scheduled += 1;

        let inner = Arc::clone(&self.inner);
        let span = info_span!("upload", path = %path.display());
        let task = async move {
            let outcome = match AssertUnwindSafe(run_upload(&inner, &path)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    error!(panic = panic_message(&*panic), "upload task panicked");
                    TaskOutcome::Abandoned
                }
            };

            let mut stats = inner.stats.write();
            match outcome {
                TaskOutcome::Succeeded => stats.succeeded += 1,
                TaskOutcome::Cancelled => stats.cancelled += 1,
                TaskOutcome::Abandoned => stats.abandoned += 1,
            }
        };

        self.inner
            .tasks
            .spawn_on(task.instrument(span), &self.inner.handle);
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn run_upload(inner: &Inner, path: &Path) -> TaskOutcome {
    let result = inner
        .retry
        .run(&inner.cancel, move || async move {
            inner.stats.write().attempts += 1;
            let mut file = File::open(path).await?;
            inner.uploader.upload(&mut file, path, &inner.cancel).await
        })
        .await;

    match result {
        Ok(receipt) => {
            info!(chunks = receipt.chunks, bytes = receipt.bytes, "upload complete");
            if let Err(e) = tokio::fs::remove_file(path).await {
                error!(error = %e, "failed to delete uploaded file");
            }
            if let Err(e) = inner.progress.unmark(path) {
                error!(error = %e, "failed to clear progress mark");
            }
            TaskOutcome::Succeeded
        }
        Err(SyncError::Cancelled) => {
            debug!("upload cancelled");
            TaskOutcome::Cancelled
        }
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "upload abandoned");
            TaskOutcome::Abandoned
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
