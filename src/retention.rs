//! Time-based pruning of archive entries and their files.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::Archive;

/// Totals reported after a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub files_deleted: usize,
    /// Bytes reclaimed by deleted files.
    pub space_freed: u64,
    #[serde(skip)]
    pub entries_removed: usize,
}

/// Removes entries downloaded more than `retention_days` ago, deleting their
/// files from disk.
///
/// Returns `None` when retention is disabled (`None` or a non-positive value).
pub fn prune(archive: &mut Archive, retention_days: Option<i64>) -> Option<CleanupSummary> {
    prune_with(archive, retention_days, Utc::now(), delete_file)
}

/// Deletes `path` and returns the number of bytes it held.
pub fn delete_file(path: &Path) -> io::Result<u64> {
    let len = fs::metadata(path)?.len();
    fs::remove_file(path)?;
    Ok(len)
}

/// [`prune`] with an explicit clock and file deleter.
///
/// An entry survives when its date is missing or unparseable, or when its file
/// could not be inspected or removed for lack of permission. A file that is
/// already gone is not an error.
pub fn prune_with<F>(
    archive: &mut Archive,
    retention_days: Option<i64>,
    now: DateTime<Utc>,
    mut delete: F,
) -> Option<CleanupSummary>
where
    F: FnMut(&Path) -> io::Result<u64>,
{
    let days = retention_days.filter(|days| *days > 0)?;
    let Some(cutoff) = TimeDelta::try_days(days).and_then(|delta| now.checked_sub_signed(delta))
    else {
        warn!(retention_days = days, "retention period out of range, skipping cleanup");
        return None;
    };

    info!(retention_days = days, cutoff = %cutoff, "pruning old downloads");

    let mut summary = CleanupSummary::default();
    let mut expired = Vec::new();
    for (video_id, entry) in archive.iter() {
        match entry.downloaded_at() {
            Some(downloaded_at) if downloaded_at < cutoff => {
                expired.push((video_id.clone(), entry.file_path.clone()));
            }
            Some(_) => {}
            None => {
                warn!(
                    video_id = %video_id,
                    download_date = entry.download_date.as_deref().unwrap_or(""),
                    "missing or unreadable download date, keeping entry"
                );
            }
        }
    }

    for (video_id, file_path) in expired {
        if let Some(file_path) = file_path.as_deref().filter(|path| !path.is_empty()) {
            let path = Path::new(file_path);
            match delete(path) {
                Ok(freed) => {
                    summary.files_deleted += 1;
                    summary.space_freed += freed;
                    info!(video_id = %video_id, path = %path.display(), "deleted expired download");
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    info!(video_id = %video_id, path = %path.display(), "file already gone");
                }
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(video_id = %video_id, path = %path.display(), error = %err,
                        "permission denied on file, keeping archive entry");
                    continue;
                }
                Err(err) => {
                    warn!(video_id = %video_id, path = %path.display(), error = %err,
                        "could not delete file, dropping archive entry anyway");
                }
            }
        }
        archive.remove(&video_id);
        summary.entries_removed += 1;
    }

    Some(summary)
}
