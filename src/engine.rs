//! Contract with the external media-fetching engine.
//!
//! The orchestrator never downloads anything itself. It asks the engine for a
//! read-only playlist listing, hands it an explicit list of URLs to fetch and
//! then consumes the status events the engine reports, one at a time.

use std::path::PathBuf;

use crate::error::Result;

/// One entry of a playlist snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistItem {
    /// `None` when the engine could not resolve an id for the entry.
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: String,
    /// 1-based position in the raw listing returned by the engine.
    pub position: usize,
}

/// Range and ordering instructions for a listing call. Engines number
/// playlist ranges from the first listed entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingRequest {
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub reverse: bool,
}

/// Options bag passed along with the URLs to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub format: String,
    pub output_dir: PathBuf,
    /// Filename template relative to `output_dir`.
    pub filename_template: String,
    pub merge_format: String,
    pub cookies: Option<PathBuf>,
    pub max_downloads: Option<usize>,
    pub playlist_start: Option<usize>,
    pub playlist_end: Option<usize>,
    pub reverse: bool,
    pub ignore_errors: bool,
}

/// Default output template. A missing upload date renders as `NA`, which the
/// fallback rename pass later replaces with the completion timestamp.
pub const DEFAULT_FILENAME_TEMPLATE: &str = "%(upload_date)s %(title)s [%(id)s].%(ext)s";

/// Token an engine writes into a filename when the upload date is unknown.
pub const UNKNOWN_DATE_TOKEN: &str = "NA";

impl FetchOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            format: "bestvideo+bestaudio/best".to_string(),
            output_dir: output_dir.into(),
            filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
            merge_format: "mp4".to_string(),
            cookies: None,
            max_downloads: None,
            playlist_start: None,
            playlist_end: None,
            reverse: false,
            ignore_errors: true,
        }
    }
}

/// Metadata the engine reports for a single item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMetadata {
    pub id: Option<String>,
    pub title: Option<String>,
    pub upload_date: Option<String>,
}

/// Per-item status reported while the engine downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Downloading {
        id: Option<String>,
    },
    Finished {
        file_path: PathBuf,
        item: ItemMetadata,
    },
    Error {
        id: Option<String>,
        message: String,
    },
}

/// Synchronous event stream returned by [`FetchEngine::download`].
pub type EventStream<'a> = Box<dyn Iterator<Item = StatusEvent> + 'a>;

pub trait FetchEngine {
    /// Lists the playlist without downloading anything.
    fn list_playlist(&self, playlist: &str, request: &ListingRequest) -> Result<Vec<PlaylistItem>>;

    /// Starts fetching `urls` one item at a time. Per-item failures are
    /// reported as [`StatusEvent::Error`]; an `Err` means nothing could be
    /// started at all.
    fn download<'a>(&'a self, urls: &[String], options: &FetchOptions) -> Result<EventStream<'a>>;

    /// Re-resolves metadata for a single item by id.
    fn resolve_metadata(&self, video_id: &str) -> Result<ItemMetadata>;
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}
