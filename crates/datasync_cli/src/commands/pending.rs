//! Pending command implementation.

use datasync_engine::ProgressTracker;
use serde::Serialize;
use std::path::Path;

/// One marked path.
#[derive(Debug, Serialize)]
pub struct PendingEntry {
    /// Marked file.
    pub path: String,
    /// When the mark was written, in milliseconds since the epoch.
    pub marked_at_ms: u64,
    /// Whether the file still exists.
    pub exists: bool,
}

/// Lists progress marks without modifying them.
pub fn run(progress_dir: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !progress_dir.is_dir() {
        return Err(format!("No progress directory at {:?}", progress_dir).into());
    }

    let entries = collect(progress_dir)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            if entries.is_empty() {
                println!("No pending uploads.");
            }
            for entry in &entries {
                let note = if entry.exists { "" } else { " (missing)" };
                println!("{}  {}{}", entry.marked_at_ms, entry.path, note);
            }
        }
    }
    Ok(())
}

fn collect(progress_dir: &Path) -> Result<Vec<PendingEntry>, Box<dyn std::error::Error>> {
    Ok(ProgressTracker::read_markers(progress_dir)?
        .into_iter()
        .map(|record| PendingEntry {
            exists: record.path.exists(),
            path: record.path.display().to_string(),
            marked_at_ms: record.marked_at_ms,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_engine::StaleMarkPolicy;
    use tempfile::tempdir;

    #[test]
    fn lists_marked_paths() {
        let dir = tempdir().unwrap();
        let progress = dir.path().join("progress");
        let present = dir.path().join("present.dat");
        std::fs::write(&present, b"x").unwrap();

        let tracker = ProgressTracker::new(&progress);
        tracker.initialize(StaleMarkPolicy::Reclaim).unwrap();
        tracker.try_mark(&present).unwrap();
        tracker.try_mark(&dir.path().join("zz-gone.dat")).unwrap();

        let entries = collect(&progress).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].exists);
        assert!(!entries[1].exists);
        assert!(progress.read_dir().unwrap().count() == 2);
    }
}
