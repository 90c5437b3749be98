//! End-of-run report, rendered either for humans or as one JSON document.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

use crate::archive::CompletedDownload;
use crate::retention::CleanupSummary;
use crate::sync::{ErrorRecord, RunStats, SkippedItem};

const TITLE_WIDTH: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Seconds.
    pub duration: f64,
}

#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub summary: Summary,
    pub downloaded: &'a [CompletedDownload],
    pub skipped: &'a [SkippedItem],
    pub errors: &'a [ErrorRecord],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupSummary>,
    #[serde(skip)]
    interrupted: bool,
}

impl<'a> Report<'a> {
    pub fn new(stats: &'a RunStats, elapsed: Duration) -> Self {
        Self {
            summary: Summary {
                total: stats.downloaded.len() + stats.skipped.len(),
                downloaded: stats.downloaded.len(),
                skipped: stats.skipped.len(),
                errors: stats.errors.len(),
                duration: elapsed.as_secs_f64(),
            },
            downloaded: &stats.downloaded,
            skipped: &stats.skipped,
            errors: &stats.errors,
            cleanup: stats.cleanup,
            interrupted: stats.interrupted,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_human(&self) -> String {
        let mut out = String::new();
        let summary = &self.summary;

        let _ = writeln!(out);
        let _ = writeln!(out, "===================================");
        if self.interrupted {
            let _ = writeln!(out, "Sync interrupted");
        } else {
            let _ = writeln!(out, "Sync complete");
        }
        let _ = writeln!(out, "===================================");
        let _ = writeln!(out, "Total processed: {}", summary.total);
        let _ = writeln!(out, "Downloaded:      {}", summary.downloaded);
        let _ = writeln!(out, "Skipped:         {}", summary.skipped);
        let _ = writeln!(out, "Errors:          {}", summary.errors);
        let _ = writeln!(out, "Duration:        {}", format_duration(summary.duration));

        if !self.downloaded.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Downloaded videos:");
            let _ = writeln!(out, "  {:<12} {:<TITLE_WIDTH$} {}", "ID", "TITLE", "UPLOADED");
            for item in self.downloaded {
                let _ = writeln!(
                    out,
                    "  {:<12} {:<TITLE_WIDTH$} {}",
                    item.video_id,
                    truncate(item.title.as_deref().unwrap_or("Unknown"), TITLE_WIDTH),
                    item.upload_date.as_deref().unwrap_or("-")
                );
            }
        }

        if !self.errors.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Errors:");
            for record in self.errors {
                let _ = writeln!(
                    out,
                    "  {:<12} {} : {}",
                    record.video_id.as_deref().unwrap_or("?"),
                    truncate(record.title.as_deref().unwrap_or("Unknown"), TITLE_WIDTH),
                    record.error
                );
            }
        }

        if let Some(cleanup) = &self.cleanup {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "Cleanup: {} file(s) deleted, {} freed",
                cleanup.files_deleted,
                format_bytes(cleanup.space_freed)
            );
        }
        out
    }
}

/// `Xm Ys`, seconds rounded down.
pub fn format_duration(seconds: f64) -> String {
    let whole = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!("{}m {}s", whole / 60, whole % 60)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Cuts `text` to at most `width` characters, marking the cut with `...`.
fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}
