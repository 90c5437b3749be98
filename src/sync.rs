//! The sync run: prune, list, select, fetch, reconcile, repair filenames.
//!
//! The archive is reloaded and saved around every state-changing step instead
//! of being held for the whole run, so a crash loses at most the item that was
//! in flight.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveEntry, ArchiveStore, CompletedDownload};
use crate::config::Settings;
use crate::engine::{
    FetchEngine, FetchOptions, ItemMetadata, PlaylistItem, StatusEvent, UNKNOWN_DATE_TOKEN,
};
use crate::error::Result;
use crate::notifier::Notifier;
use crate::retention::{self, CleanupSummary};
use crate::selector::{self, Selection, SelectionPolicy};

/// Message recorded for submitted items the engine never reported on.
pub const FAILED_TO_DOWNLOAD: &str = "failed to download";

/// Prefix format used when a filename has no usable upload date.
const FALLBACK_PREFIX_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub video_id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub video_id: Option<String>,
    pub title: Option<String>,
    pub error: String,
}

/// What happened during one invocation. Only used to build the final report.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub started_at: DateTime<Utc>,
    started: Instant,
    pub downloaded: Vec<CompletedDownload>,
    pub skipped: Vec<SkippedItem>,
    pub errors: Vec<ErrorRecord>,
    pub cleanup: Option<CleanupSummary>,
    pub interrupted: bool,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            downloaded: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            cleanup: None,
            interrupted: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_downloaded(&self, video_id: &str) -> bool {
        self.downloaded.iter().any(|item| item.video_id == video_id)
    }

    pub fn has_error(&self, video_id: &str) -> bool {
        self.errors
            .iter()
            .any(|record| record.video_id.as_deref() == Some(video_id))
    }

    /// Adds a completed download. A download supersedes an earlier error for
    /// the same id.
    pub fn record_download(&mut self, download: CompletedDownload) -> bool {
        if self.is_downloaded(&download.video_id) {
            return false;
        }
        self.errors
            .retain(|record| record.video_id.as_deref() != Some(download.video_id.as_str()));
        self.downloaded.push(download);
        true
    }

    /// Adds an error unless the id is already downloaded or already errored.
    /// Errors without an id are always kept.
    pub fn record_error(
        &mut self,
        video_id: Option<String>,
        title: Option<String>,
        error: impl Into<String>,
    ) -> bool {
        if let Some(id) = video_id.as_deref()
            && (self.is_downloaded(id) || self.has_error(id))
        {
            return false;
        }
        self.errors.push(ErrorRecord {
            video_id,
            title,
            error: error.into(),
        });
        true
    }

    /// Points this run's download of `video_id` at its new location.
    pub fn correct_file_path(&mut self, video_id: &str, file_path: &str) -> bool {
        match self
            .downloaded
            .iter_mut()
            .find(|item| item.video_id == video_id)
        {
            Some(item) => {
                item.filepath = Some(file_path.to_string());
                true
            }
            None => false,
        }
    }

    pub fn record_skipped(&mut self, item: &PlaylistItem) {
        if let Some(video_id) = &item.id {
            self.skipped.push(SkippedItem {
                video_id: video_id.clone(),
                title: item.title.clone(),
            });
        }
    }
}

/// Everything a run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub playlist_url: String,
    pub selection: SelectionPolicy,
    pub fetch: FetchOptions,
    pub retention_days: Option<i64>,
}

impl SyncJob {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut fetch = FetchOptions::new(&settings.output_dir);
        fetch.format = settings.format.clone();
        fetch.merge_format = settings.merge_format.clone();
        fetch.cookies = settings.cookies.clone();
        Self {
            playlist_url: settings.playlist_url.clone(),
            selection: settings.selection,
            fetch,
            retention_days: settings.retention_days,
        }
    }

    /// Options for the download call. Range and order were already applied
    /// by the selection, so only the cap is passed along.
    fn fetch_options(&self) -> FetchOptions {
        let mut options = self.fetch.clone();
        options.max_downloads = self.selection.cap();
        options.playlist_start = None;
        options.playlist_end = None;
        options.reverse = false;
        options
    }
}

pub struct SyncRunner<E> {
    store: ArchiveStore,
    engine: E,
    notifier: Box<dyn Notifier>,
    job: SyncJob,
    interrupt: Arc<AtomicBool>,
}

impl<E: FetchEngine> SyncRunner<E> {
    pub fn new(store: ArchiveStore, engine: E, notifier: Box<dyn Notifier>, job: SyncJob) -> Self {
        Self {
            store,
            engine,
            notifier,
            job,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops event consumption when raised.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Runs one sync. `stats` holds whatever was recorded even when an error
    /// is returned.
    pub fn run(&self, stats: &mut RunStats) -> Result<()> {
        let mut archive = self.store.load()?;
        info!(path = %self.store.path().display(), entries = archive.len(), "archive loaded");

        if let Some(summary) = retention::prune(&mut archive, self.job.retention_days) {
            if summary.entries_removed > 0 {
                self.store.save(&archive)?;
            }
            info!(
                files_deleted = summary.files_deleted,
                space_freed = summary.space_freed,
                entries_removed = summary.entries_removed,
                "retention pass finished"
            );
            stats.cleanup = Some(summary);
        }

        let request = self.job.selection.listing_request();
        let listing = self.engine.list_playlist(&self.job.playlist_url, &request)?;
        let selection = selector::select(&listing, &archive, &self.job.selection);
        for item in &selection.to_skip {
            info!(
                video_id = item.id.as_deref().unwrap_or(""),
                title = item.title.as_deref().unwrap_or(""),
                "already downloaded, skipping"
            );
            stats.record_skipped(item);
        }

        if selection.is_nothing_new() {
            info!(listed = listing.len(), "nothing new to download");
        } else {
            info!(count = selection.to_fetch.len(), "downloading new items");
            self.fetch(&selection, stats)?;
        }

        if self.interrupted() {
            warn!("interrupted, skipping reconciliation and filename repair");
            stats.interrupted = true;
            return Ok(());
        }

        self.reconcile(&selection, stats)?;
        self.repair_filenames(stats)?;
        Ok(())
    }

    fn fetch(&self, selection: &Selection, stats: &mut RunStats) -> Result<()> {
        if self.interrupted() {
            return Ok(());
        }
        let titles: HashMap<&str, Option<&String>> = selection
            .to_fetch
            .iter()
            .filter_map(|item| Some((item.id.as_deref()?, item.title.as_ref())))
            .collect();

        let events = self
            .engine
            .download(&selection.fetch_urls(), &self.job.fetch_options())?;
        for event in events {
            match event {
                StatusEvent::Downloading { id } => {
                    info!(video_id = id.as_deref().unwrap_or("?"), "downloading");
                }
                StatusEvent::Finished { file_path, item } => {
                    self.record_finished(file_path, item, &titles, stats)?;
                }
                StatusEvent::Error { id, message } => {
                    let title = id
                        .as_deref()
                        .and_then(|id| titles.get(id).copied().flatten())
                        .cloned();
                    if stats.record_error(id.clone(), title, message.clone()) {
                        warn!(video_id = id.as_deref().unwrap_or("?"), error = %message, "download failed");
                    }
                }
            }
            if self.interrupted() {
                break;
            }
        }
        Ok(())
    }

    fn record_finished(
        &self,
        file_path: PathBuf,
        item: ItemMetadata,
        titles: &HashMap<&str, Option<&String>>,
        stats: &mut RunStats,
    ) -> Result<()> {
        let Some(video_id) = item.id.filter(|id| !id.trim().is_empty()) else {
            warn!(path = %file_path.display(), "finished download without an id, not archived");
            return Ok(());
        };

        let mut archive = self.store.load()?;
        if archive.contains(&video_id) {
            debug!(video_id = %video_id, "already archived, ignoring repeated completion");
            return Ok(());
        }

        let title = item
            .title
            .or_else(|| titles.get(video_id.as_str()).copied().flatten().cloned());
        let upload_date = item
            .upload_date
            .filter(|date| !date.is_empty() && date != UNKNOWN_DATE_TOKEN);
        let file_path =
            (!file_path.as_os_str().is_empty()).then(|| file_path.display().to_string());
        let entry = ArchiveEntry::completed(title, upload_date, file_path, Utc::now());
        let download = CompletedDownload::from_entry(&video_id, &entry);

        archive.record(&video_id, entry);
        self.store.save(&archive)?;
        info!(
            video_id = %video_id,
            title = download.title.as_deref().unwrap_or(""),
            "download recorded"
        );

        stats.record_download(download.clone());
        self.notifier.notify(&download);
        Ok(())
    }

    /// Accounts for submitted items the engine dropped without an event.
    fn reconcile(&self, selection: &Selection, stats: &mut RunStats) -> Result<()> {
        if selection.is_nothing_new() {
            return Ok(());
        }
        let archive = self.store.load()?;
        for item in &selection.to_fetch {
            let Some(video_id) = item.id.as_deref() else {
                continue;
            };
            if archive.contains(video_id)
                || stats.is_downloaded(video_id)
                || stats.has_error(video_id)
            {
                continue;
            }
            warn!(video_id, "no completion reported, counting as failed");
            stats.record_error(Some(video_id.to_owned()), item.title.clone(), FAILED_TO_DOWNLOAD);
        }
        Ok(())
    }

    /// Renames files whose name starts with the unknown-date placeholder so
    /// they carry the completion timestamp instead. Covers the whole archive,
    /// not only this run's downloads; renamed downloads of this run are
    /// updated in `stats` too.
    fn repair_filenames(&self, stats: &mut RunStats) -> Result<()> {
        let mut archive = self.store.load()?;
        let candidates: Vec<(String, PathBuf, Option<DateTime<Utc>>)> = archive
            .iter()
            .filter_map(|(video_id, entry)| {
                let path = PathBuf::from(entry.file_path.as_deref()?);
                needs_date_prefix(&path)
                    .then(|| (video_id.clone(), path, entry.downloaded_at()))
            })
            .collect();

        let mut changed = false;
        for (video_id, path, downloaded_at) in candidates {
            match self.engine.resolve_metadata(&video_id) {
                Ok(metadata) => debug!(
                    video_id = %video_id,
                    upload_date = metadata.upload_date.as_deref().unwrap_or(""),
                    "re-resolved metadata"
                ),
                Err(err) => debug!(video_id = %video_id, error = %err, "metadata lookup failed"),
            }

            let prefix = downloaded_at
                .unwrap_or_else(Utc::now)
                .format(FALLBACK_PREFIX_FORMAT)
                .to_string();
            if let Some(renamed) = rename_with_prefix(&path, &prefix) {
                info!(video_id = %video_id, from = %path.display(), to = %renamed.display(), "renamed file");
                let renamed = renamed.display().to_string();
                stats.correct_file_path(&video_id, &renamed);
                changed |= archive.correct_file_path(&video_id, renamed);
            }
        }

        if changed {
            self.store.save(&archive)?;
        }
        Ok(())
    }
}

/// Whether the filename's first space-separated token is the unknown-date
/// placeholder or empty.
fn needs_date_prefix(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    match name.split_once(' ') {
        Some((first, _)) => first.is_empty() || first == UNKNOWN_DATE_TOKEN,
        None => false,
    }
}

/// Replaces the first token of the filename with `prefix`. Returns the new
/// path, or `None` when the file is missing, the target exists or the rename
/// fails.
fn rename_with_prefix(path: &Path, prefix: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let (_, rest) = name.split_once(' ')?;
    let target = path.with_file_name(format!("{prefix} {rest}"));

    if !path.exists() {
        debug!(path = %path.display(), "file missing, not renaming");
        return None;
    }
    if target.exists() {
        warn!(target = %target.display(), "rename target already exists, keeping name");
        return None;
    }
    match fs::rename(path, &target) {
        Ok(()) => Some(target),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "rename failed");
            None
        }
    }
}
