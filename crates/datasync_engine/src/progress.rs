//! Crash-resilient tracking of in-flight uploads.
//!
//! Every path with an upload in flight has an entry in an in-memory set and
//! a marker file in the progress directory:
//!
//! ```text
//! <progress_dir>/
//! ├─ 3f1c...9a.mark    # CBOR { path, marked_at_ms }, named sha256(path)
//! └─ 77b0...e2.mark
//! ```
//!
//! Markers are written through a temporary file and renamed into place, so a
//! crash never leaves a half-written marker under its final name.

use crate::config::StaleMarkPolicy;
use crate::error::{SyncError, SyncResult};
use datasync_protocol::{from_cbor, to_cbor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const MARK_EXTENSION: &str = "mark";
const TEMP_EXTENSION: &str = "tmp";

/// Durable record stored in a marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRecord {
    /// Path of the file being uploaded.
    pub path: PathBuf,
    /// Wall-clock time the mark was written, in milliseconds since the epoch.
    pub marked_at_ms: u64,
}

/// Records which paths currently have an upload in flight.
///
/// `try_mark` is the only way to claim a path: the membership check, the
/// marker write and the insert happen under one lock, so two callers can
/// never both claim the same path.
#[derive(Debug)]
pub struct ProgressTracker {
    dir: PathBuf,
    marks: Mutex<HashSet<PathBuf>>,
}

impl ProgressTracker {
    /// Creates a tracker rooted at `dir`. Call [`initialize`](Self::initialize)
    /// before use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            marks: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the progress directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensures the progress directory exists and applies `policy` to any
    /// markers left by a previous process.
    ///
    /// Returns the paths found in those markers: reclaimed paths under
    /// [`StaleMarkPolicy::Reclaim`], blocked paths under
    /// [`StaleMarkPolicy::Block`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ProgressDir`] if the directory cannot be created
    /// or read.
    pub fn initialize(&self, policy: StaleMarkPolicy) -> SyncResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir).map_err(|e| self.dir_error(e))?;

        let mut found = Vec::new();
        for (marker, record) in self.scan(true)? {
            match (policy, record) {
                (StaleMarkPolicy::Reclaim, Some(record)) => {
                    warn!(path = %record.path.display(), "reclaiming stale progress mark");
                    remove_if_exists(&marker)?;
                    found.push(record.path);
                }
                (StaleMarkPolicy::Block, Some(record)) => {
                    info!(path = %record.path.display(), "keeping stale progress mark");
                    self.marks.lock().insert(record.path.clone());
                    found.push(record.path);
                }
                (_, None) => {
                    warn!(marker = %marker.display(), "removing corrupt progress mark");
                    remove_if_exists(&marker)?;
                }
            }
        }

        found.sort();
        Ok(found)
    }

    /// Returns true if `path` has an upload in flight.
    pub fn in_progress(&self, path: &Path) -> bool {
        self.marks.lock().contains(path)
    }

    /// Claims `path` for upload.
    ///
    /// Returns `Ok(false)` without touching disk if the path is already
    /// claimed, `Ok(true)` once the marker is durable.
    ///
    /// Writing the marker is blocking file I/O (create, fsync, rename) done
    /// under the tracker's lock. Each call costs one small synchronous write,
    /// so async callers run it inline rather than on a blocking pool.
    pub fn try_mark(&self, path: &Path) -> SyncResult<bool> {
        let mut marks = self.marks.lock();
        if marks.contains(path) {
            return Ok(false);
        }
        self.write_marker(path)?;
        marks.insert(path.to_path_buf());
        debug!(path = %path.display(), "marked in progress");
        Ok(true)
    }

    /// Releases `path` after its upload is confirmed.
    ///
    /// Removes the marker first; the in-memory entry is only dropped once the
    /// marker is gone, so memory and disk never disagree about a live mark.
    /// Like [`try_mark`](Self::try_mark), this blocks on file I/O.
    pub fn unmark(&self, path: &Path) -> SyncResult<()> {
        let mut marks = self.marks.lock();
        remove_if_exists(&self.marker_path(path))?;
        marks.remove(path);
        debug!(path = %path.display(), "unmarked");
        Ok(())
    }

    /// Manually releases a path blocked by a stale mark.
    pub fn clear(&self, path: &Path) -> SyncResult<()> {
        info!(path = %path.display(), "clearing progress mark");
        self.unmark(path)
    }

    /// Returns the currently marked paths, sorted.
    pub fn pending(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.marks.lock().iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Returns the marker file used for `path`.
    pub fn marker_path(&self, path: &Path) -> PathBuf {
        self.dir.join(marker_name(path))
    }

    /// Reads every marker record in `dir` without modifying anything.
    ///
    /// Safe to call on the progress directory of a running manager: temp
    /// files from marks being written are left alone, and markers that do
    /// not decode are skipped.
    pub fn read_markers(dir: &Path) -> SyncResult<Vec<MarkRecord>> {
        let tracker = Self::new(dir);
        let mut records: Vec<MarkRecord> =
            tracker.scan(false)?.into_iter().filter_map(|(_, r)| r).collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    /// Lists marker files, decoding each one. A record of `None` means the
    /// marker could be read but not decoded. Leftover temp files are removed
    /// only when `cleanup` is set.
    fn scan(&self, cleanup: bool) -> SyncResult<Vec<(PathBuf, Option<MarkRecord>)>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| self.dir_error(e))?;

        let mut markers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.dir_error(e))?;
            let file = entry.path();
            match file.extension().and_then(|e| e.to_str()) {
                Some(MARK_EXTENSION) => {
                    let bytes = fs::read(&file).map_err(|source| SyncError::ProgressDir {
                        path: file.clone(),
                        source,
                    })?;
                    let record = from_cbor::<MarkRecord>(&bytes).ok();
                    markers.push((file, record));
                }
                Some(TEMP_EXTENSION) if cleanup => {
                    debug!(file = %file.display(), "removing partial marker");
                    remove_if_exists(&file)?;
                }
                _ => {}
            }
        }
        Ok(markers)
    }

    fn write_marker(&self, path: &Path) -> SyncResult<()> {
        let record = MarkRecord {
            path: path.to_path_buf(),
            marked_at_ms: now_ms(),
        };
        let bytes = to_cbor(&record)?;

        let marker = self.marker_path(path);
        let temp = marker.with_extension(TEMP_EXTENSION);
        {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &marker)?;
        Ok(())
    }

    fn dir_error(&self, source: io::Error) -> SyncError {
        SyncError::ProgressDir {
            path: self.dir.clone(),
            source,
        }
    }
}

/// Deterministic marker file name for `path`.
pub fn marker_name(path: &Path) -> String {
    let digest = Sha256::digest(path.as_os_str().as_encoded_bytes());
    format!("{:x}.{}", digest, MARK_EXTENSION)
}

fn remove_if_exists(file: &Path) -> SyncResult<()> {
    match fs::remove_file(file) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn tracker_in(dir: &Path) -> ProgressTracker {
        let tracker = ProgressTracker::new(dir.join("progress"));
        tracker.initialize(StaleMarkPolicy::Reclaim).unwrap();
        tracker
    }

    #[test]
    fn initialize_creates_nested_dir() {
        let dir = tempdir().unwrap();
        let progress = dir.path().join("a").join("b").join("progress");
        let tracker = ProgressTracker::new(&progress);

        assert!(tracker.initialize(StaleMarkPolicy::Reclaim).unwrap().is_empty());
        assert!(progress.is_dir());
    }

    #[test]
    fn initialize_fails_on_unusable_dir() {
        let dir = tempdir().unwrap();
        let not_a_dir = dir.path().join("file");
        fs::write(&not_a_dir, b"x").unwrap();

        let tracker = ProgressTracker::new(&not_a_dir);
        let result = tracker.initialize(StaleMarkPolicy::Reclaim);
        assert!(matches!(result, Err(SyncError::ProgressDir { .. })));
    }

    #[test]
    fn mark_is_check_and_set() {
        let dir = tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        let path = Path::new("/data/a.dat");

        assert!(!tracker.in_progress(path));
        assert!(tracker.try_mark(path).unwrap());
        assert!(tracker.in_progress(path));
        assert!(!tracker.try_mark(path).unwrap());
        assert!(tracker.marker_path(path).exists());
    }

    #[test]
    fn unmark_removes_memory_and_disk() {
        let dir = tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        let path = Path::new("/data/a.dat");

        tracker.try_mark(path).unwrap();
        tracker.unmark(path).unwrap();

        assert!(!tracker.in_progress(path));
        assert!(!tracker.marker_path(path).exists());
        // Unmarking twice is harmless.
        tracker.unmark(path).unwrap();
    }

    #[test]
    fn concurrent_marks_admit_one_winner() {
        let dir = tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        let path = Path::new("/data/contended.dat");
        let winners = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    if tracker.try_mark(path).unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn marks_survive_a_crash_and_are_reclaimed() {
        let dir = tempdir().unwrap();
        let progress = dir.path().join("progress");
        let path = Path::new("/data/a.dat");

        {
            let tracker = ProgressTracker::new(&progress);
            tracker.initialize(StaleMarkPolicy::Reclaim).unwrap();
            tracker.try_mark(path).unwrap();
            // dropped without unmark: simulated crash
        }

        let restarted = ProgressTracker::new(&progress);
        assert!(restarted.marker_path(path).exists());
        assert!(!restarted.in_progress(path));

        let reclaimed = restarted.initialize(StaleMarkPolicy::Reclaim).unwrap();
        assert_eq!(reclaimed, vec![PathBuf::from("/data/a.dat")]);
        assert!(!restarted.marker_path(path).exists());
        assert!(restarted.try_mark(path).unwrap());
    }

    #[test]
    fn block_policy_keeps_stale_marks() {
        let dir = tempdir().unwrap();
        let progress = dir.path().join("progress");
        let path = Path::new("/data/a.dat");

        {
            let tracker = ProgressTracker::new(&progress);
            tracker.initialize(StaleMarkPolicy::Block).unwrap();
            tracker.try_mark(path).unwrap();
        }

        let restarted = ProgressTracker::new(&progress);
        let blocked = restarted.initialize(StaleMarkPolicy::Block).unwrap();
        assert_eq!(blocked, vec![PathBuf::from("/data/a.dat")]);
        assert!(restarted.in_progress(path));
        assert!(!restarted.try_mark(path).unwrap());

        restarted.clear(path).unwrap();
        assert!(!restarted.in_progress(path));
        assert!(!restarted.marker_path(path).exists());
    }

    #[test]
    fn corrupt_markers_and_temp_files_are_removed() {
        let dir = tempdir().unwrap();
        let progress = dir.path().join("progress");
        fs::create_dir_all(&progress).unwrap();
        fs::write(progress.join("garbage.mark"), b"\xff\xff").unwrap();
        fs::write(progress.join("partial.tmp"), b"").unwrap();
        fs::write(progress.join("README"), b"keep me").unwrap();

        let tracker = ProgressTracker::new(&progress);
        assert!(tracker.initialize(StaleMarkPolicy::Block).unwrap().is_empty());
        assert!(!progress.join("garbage.mark").exists());
        assert!(!progress.join("partial.tmp").exists());
        assert!(progress.join("README").exists());
    }

    #[test]
    fn read_markers_leaves_the_directory_untouched() {
        let dir = tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        tracker.try_mark(Path::new("/data/a.dat")).unwrap();

        // A mark halfway through being written by a live tracker.
        let writing = tracker.marker_path(Path::new("/data/b.dat")).with_extension("tmp");
        fs::write(&writing, b"").unwrap();
        let garbage = tracker.dir().join("garbage.mark");
        fs::write(&garbage, b"\xff\xff").unwrap();

        let records = ProgressTracker::read_markers(tracker.dir()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, PathBuf::from("/data/a.dat"));
        assert!(writing.exists());
        assert!(garbage.exists());
    }

    #[test]
    fn unreadable_marker_fails_initialize_and_is_kept() {
        let dir = tempdir().unwrap();
        let progress = dir.path().join("progress");
        // Reading a directory fails with an I/O error, unlike a corrupt file.
        let odd = progress.join("odd.mark");
        fs::create_dir_all(&odd).unwrap();

        let tracker = ProgressTracker::new(&progress);
        match tracker.initialize(StaleMarkPolicy::Block) {
            Err(SyncError::ProgressDir { path, .. }) => assert_eq!(path, odd),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(odd.is_dir());
    }

    #[test]
    fn read_markers_lists_records() {
        let dir = tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        tracker.try_mark(Path::new("/data/b.dat")).unwrap();
        tracker.try_mark(Path::new("/data/a.dat")).unwrap();

        let records = ProgressTracker::read_markers(tracker.dir()).unwrap();
        let paths: Vec<&Path> = records.iter().map(|r| r.path.as_path()).collect();
        assert_eq!(paths, vec![Path::new("/data/a.dat"), Path::new("/data/b.dat")]);
        assert!(records.iter().all(|r| r.marked_at_ms > 0));
        assert_eq!(
            tracker.pending(),
            vec![PathBuf::from("/data/a.dat"), PathBuf::from("/data/b.dat")]
        );
    }

    proptest! {
        #[test]
        fn marker_names_are_deterministic(a in "[a-z/._]{1,40}", b in "[a-z/._]{1,40}") {
            let na = marker_name(Path::new(&a));
            prop_assert_eq!(&na, &marker_name(Path::new(&a)));
            prop_assert!(na.ends_with(".mark"));
            if a != b {
                prop_assert_ne!(na, marker_name(Path::new(&b)));
            }
        }
    }
}
