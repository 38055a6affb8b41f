//! Sync command implementation.

use datasync_engine::{StaleMarkPolicy, SyncConfig, SyncManager, TcpClient};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Extension of files a capture process is still writing.
const IN_PROGRESS_EXTENSION: &str = "prog";

/// Options for the sync command.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Directory scanned for files to upload.
    pub capture_dir: PathBuf,
    /// Directory for durable progress marks.
    pub progress_dir: PathBuf,
    /// Part id the data is attributed to.
    pub part_id: String,
    /// Address of the ingestion service.
    pub server: SocketAddr,
    /// Time between directory scans.
    pub interval: Duration,
    /// Keep stale marks instead of reclaiming them.
    pub block_stale: bool,
}

/// Runs the sync command until Ctrl-C.
pub fn run(options: SyncOptions) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(sync_loop(options))
}

async fn sync_loop(options: SyncOptions) -> Result<(), Box<dyn std::error::Error>> {
    let policy = if options.block_stale {
        StaleMarkPolicy::Block
    } else {
        StaleMarkPolicy::Reclaim
    };
    let config = SyncConfig::new(options.part_id.clone(), &options.progress_dir)
        .with_stale_marks(policy);
    let client = Arc::new(TcpClient::new(options.server));
    let manager = SyncManager::new(config, client)?;

    for path in manager.reclaimed() {
        info!(path = %path.display(), ?policy, "previous run left this file marked");
    }
    info!(
        capture_dir = %options.capture_dir.display(),
        server = %options.server,
        part_id = %options.part_id,
        "syncing"
    );

    let mut ticker = tokio::time::interval(options.interval);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            _ = ticker.tick() => {
                match scan_capture_dir(&options.capture_dir) {
                    Ok(paths) if !paths.is_empty() => {
                        let session = manager.sync(&paths);
                        if !session.accepted.is_empty() {
                            info!(
                                session = %session.id,
                                accepted = session.accepted.len(),
                                "scheduled uploads"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(dir = %options.capture_dir.display(), error = %e, "scan failed"),
                }
            }
        }
    }

    info!("interrupted, waiting for uploads to stop");
    manager.close().await;

    let stats = manager.stats();
    println!(
        "uploaded {}, interrupted {}, abandoned {}, attempts {}",
        stats.succeeded, stats.cancelled, stats.abandoned, stats.attempts
    );
    let pending = manager.pending();
    if !pending.is_empty() {
        println!("{} file(s) still marked in {}", pending.len(), options.progress_dir.display());
    }
    Ok(())
}

/// Lists regular files in `dir` that are ready to upload, sorted.
///
/// Hidden files and files still being written are skipped.
pub fn scan_capture_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let in_progress = path.extension().and_then(|e| e.to_str()) == Some(IN_PROGRESS_EXTENSION);
        if !hidden && !in_progress {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
