//! JSON archive of completed downloads.
//!
//! The archive is the only durable state: a single pretty-printed JSON object
//! mapping a video id to the metadata recorded when its download finished.
//! Every write replaces the whole document atomically (temp file in the same
//! directory, then rename) so a reader never sees a half-written file.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Metadata stored for one completed download.
///
/// Every field is optional on disk so archives written by older versions (or
/// by hand) still load; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    #[serde(default)]
    pub title: Option<String>,
    /// Source-provided `YYYYMMDD` date, `None` when the source did not know it.
    #[serde(default)]
    pub upload_date: Option<String>,
    /// RFC 3339 completion timestamp. Written once, never updated.
    #[serde(default)]
    pub download_date: Option<String>,
    #[serde(default, rename = "filepath")]
    pub file_path: Option<String>,
}

impl ArchiveEntry {
    pub fn completed(
        title: Option<String>,
        upload_date: Option<String>,
        file_path: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            title,
            upload_date,
            download_date: Some(format_timestamp(completed_at)),
            file_path,
        }
    }

    /// Parses `download_date`. Accepts RFC 3339 as well as the naive ISO form
    /// (interpreted as UTC) found in hand-edited archives.
    pub fn downloaded_at(&self) -> Option<DateTime<Utc>> {
        self.download_date.as_deref().and_then(parse_timestamp)
    }
}

/// A completed download as reported to the webhook and in the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedDownload {
    pub video_id: String,
    pub title: Option<String>,
    pub upload_date: Option<String>,
    pub download_date: Option<String>,
    pub filepath: Option<String>,
}

impl CompletedDownload {
    pub fn from_entry(video_id: &str, entry: &ArchiveEntry) -> Self {
        Self {
            video_id: video_id.to_owned(),
            title: entry.title.clone(),
            upload_date: entry.upload_date.clone(),
            download_date: entry.download_date.clone(),
            filepath: entry.file_path.clone(),
        }
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(datetime.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// In-memory view of the archive document.
///
/// Entries are append-only: `record` never overwrites, the only in-place
/// change is `correct_file_path`, and `remove` exists for retention pruning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Archive {
    entries: BTreeMap<String, ArchiveEntry>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, video_id: &str) -> bool {
        self.entries.contains_key(video_id)
    }

    pub fn get(&self, video_id: &str) -> Option<&ArchiveEntry> {
        self.entries.get(video_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArchiveEntry)> {
        self.entries.iter()
    }

    /// Inserts `entry` unless the id is already archived. Returns whether the
    /// archive changed.
    pub fn record(&mut self, video_id: &str, entry: ArchiveEntry) -> bool {
        if self.entries.contains_key(video_id) {
            return false;
        }
        self.entries.insert(video_id.to_owned(), entry);
        true
    }

    /// Points an existing entry at its renamed file.
    pub fn correct_file_path(&mut self, video_id: &str, file_path: String) -> bool {
        match self.entries.get_mut(video_id) {
            Some(entry) if entry.file_path.as_deref() != Some(file_path.as_str()) => {
                entry.file_path = Some(file_path);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, video_id: &str) -> Option<ArchiveEntry> {
        self.entries.remove(video_id)
    }
}

impl FromIterator<(String, ArchiveEntry)> for Archive {
    fn from_iter<I: IntoIterator<Item = (String, ArchiveEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Reads and atomically rewrites the archive file.
///
/// No cross-process lock is taken; only one sync run should use a given path
/// at a time.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    path: PathBuf,
}

impl ArchiveStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns an empty archive when the file does not exist yet.
    pub fn load(&self) -> Result<Archive> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Archive::new()),
            Err(err) => return Err(SyncError::Io(err)),
        };
        serde_json::from_str(&raw).map_err(|source| SyncError::CorruptArchive {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, archive: &Archive) -> Result<()> {
        self.write_atomic(archive).map_err(|source| SyncError::Persistence {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), entries = archive.len(), "archive saved");
        Ok(())
    }

    fn write_atomic(&self, archive: &Archive) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut payload = serde_json::to_vec_pretty(archive).map_err(io::Error::other)?;
        payload.push(b'\n');

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&payload)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sample_entry(title: &str) -> ArchiveEntry {
        ArchiveEntry::completed(
            Some(title.into()),
            Some("20240101".into()),
            Some(format!("/videos/{title}.mp4")),
            Utc.with_ymd_and_hms(2025, 1, 30, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn load_missing_file_returns_empty_archive() -> Result<()> {
        let dir = tempdir()?;
        let store = ArchiveStore::new(dir.path().join("archive.json"));
        assert!(store.load()?.is_empty());
        Ok(())
    }

    #[test]
    fn load_rejects_corrupt_document() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("archive.json");
        fs::write(&path, "{ not json")?;
        let err = ArchiveStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SyncError::CorruptArchive { .. }));
        Ok(())
    }

    #[test]
    fn load_rejects_wrong_shape() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("archive.json");
        fs::write(&path, "[1, 2, 3]")?;
        let err = ArchiveStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SyncError::CorruptArchive { .. }));
        Ok(())
    }

    #[test]
    fn load_tolerates_missing_and_unknown_fields() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("archive.json");
        fs::write(
            &path,
            r#"{
              "old": {"title": "Legacy"},
              "new": {"title": "New", "upload_date": null, "download_date": "2025-01-01T00:00:00Z",
                      "filepath": "/x.mp4", "thumbnail": "ignored"}
            }"#,
        )?;
        let archive = ArchiveStore::new(&path).load()?;
        assert_eq!(archive.len(), 2);
        let old = archive.get("old").unwrap();
        assert_eq!(old.title.as_deref(), Some("Legacy"));
        assert!(old.download_date.is_none());
        assert!(old.file_path.is_none());
        assert_eq!(archive.get("new").unwrap().file_path.as_deref(), Some("/x.mp4"));
        Ok(())
    }

    #[test]
    fn save_then_load_round_trips() -> Result<()> {
        let dir = tempdir()?;
        let store = ArchiveStore::new(dir.path().join("archive.json"));
        let mut archive = Archive::new();
        archive.record("b", sample_entry("Bravo"));
        archive.record("a", sample_entry("Alpha"));

        store.save(&archive)?;
        let first = fs::read_to_string(store.path())?;
        let loaded = store.load()?;
        assert_eq!(loaded, archive);

        store.save(&loaded)?;
        assert_eq!(fs::read_to_string(store.path())?, first);
        Ok(())
    }

    #[test]
    fn save_writes_archive_field_names() -> Result<()> {
        let dir = tempdir()?;
        let store = ArchiveStore::new(dir.path().join("archive.json"));
        let mut archive = Archive::new();
        archive.record("abc", sample_entry("Alpha"));
        store.save(&archive)?;

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(store.path())?)?;
        let entry = &value["abc"];
        assert_eq!(entry["title"], "Alpha");
        assert_eq!(entry["upload_date"], "20240101");
        assert_eq!(entry["download_date"], "2025-01-30T12:00:00Z");
        assert_eq!(entry["filepath"], "/videos/Alpha.mp4");
        Ok(())
    }

    #[test]
    fn save_leaves_no_temporary_files() -> Result<()> {
        let dir = tempdir()?;
        let store = ArchiveStore::new(dir.path().join("archive.json"));
        let mut archive = Archive::new();
        archive.record("abc", sample_entry("Alpha"));
        store.save(&archive)?;
        store.save(&archive)?;

        let names: Vec<_> = fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["archive.json".to_string()]);
        Ok(())
    }

    #[test]
    fn save_creates_missing_parent_directory() -> Result<()> {
        let dir = tempdir()?;
        let store = ArchiveStore::new(dir.path().join("nested/state/archive.json"));
        store.save(&Archive::new())?;
        assert!(store.path().exists());
        Ok(())
    }

    #[test]
    fn save_fails_with_persistence_error_when_target_is_a_directory() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("archive.json");
        fs::create_dir_all(target.join("occupied"))?;
        let err = ArchiveStore::new(&target).save(&Archive::new()).unwrap_err();
        assert!(matches!(err, SyncError::Persistence { .. }));
        Ok(())
    }

    #[test]
    fn record_is_append_only() {
        let mut archive = Archive::new();
        assert!(archive.record("abc", sample_entry("First")));
        assert!(!archive.record("abc", sample_entry("Second")));
        assert_eq!(archive.get("abc").unwrap().title.as_deref(), Some("First"));
    }

    #[test]
    fn correct_file_path_only_touches_existing_entries() {
        let mut archive = Archive::new();
        archive.record("abc", sample_entry("Alpha"));
        assert!(archive.correct_file_path("abc", "/videos/renamed.mp4".into()));
        assert!(!archive.correct_file_path("abc", "/videos/renamed.mp4".into()));
        assert!(!archive.correct_file_path("missing", "/x".into()));
        assert_eq!(
            archive.get("abc").unwrap().file_path.as_deref(),
            Some("/videos/renamed.mp4")
        );
    }

    #[test]
    fn parse_timestamp_accepts_legacy_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 12, 29, 23, 59, 59).unwrap();
        assert_eq!(parse_timestamp("2024-12-29T23:59:59Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-12-29T23:59:59+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-12-29T23:59:59"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-12-29T23:59:59.250000Z").map(|dt| dt.timestamp()),
            Some(expected.timestamp())
        );
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }
}
