//! Decides which playlist entries are new.
//!
//! With a cap on the number of new items, only a bounded window at the start
//! of the listing is requested: `min(max_items * 3, 100)` entries. The window
//! is reversed locally to get newest-first order, archived ids are skipped
//! and collection stops at `max_items`. If more than `window - max_items`
//! entries of that window are already archived, fewer than `max_items` items
//! are selected even when more new ones exist further down the playlist.
//! That under-fetch is the accepted price for a bounded listing call.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::archive::Archive;
use crate::engine::{ListingRequest, PlaylistItem};

pub const OVERSAMPLE_FACTOR: usize = 3;
pub const OVERSAMPLE_CAP: usize = 100;

/// Number of listing entries requested for a cap of `max_items`.
pub fn oversample_window(max_items: usize) -> usize {
    max_items.saturating_mul(OVERSAMPLE_FACTOR).min(OVERSAMPLE_CAP)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub newest_first: bool,
    pub max_items: Option<usize>,
    pub range_start: Option<usize>,
    pub range_end: Option<usize>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            newest_first: true,
            max_items: None,
            range_start: None,
            range_end: None,
        }
    }
}

impl SelectionPolicy {
    /// A cap of zero means no cap.
    pub fn cap(&self) -> Option<usize> {
        self.max_items.filter(|max| *max > 0)
    }

    /// Builds the listing call for this policy.
    ///
    /// Without a cap the engine handles range and ordering itself. With a cap
    /// the engine only sees the oversampled window and ordering happens here.
    pub fn listing_request(&self) -> ListingRequest {
        match self.cap() {
            Some(max) => {
                let start = self.range_start.unwrap_or(1).max(1);
                let mut end = start.saturating_add(oversample_window(max) - 1);
                if let Some(range_end) = self.range_end {
                    end = end.min(range_end);
                }
                ListingRequest {
                    start: Some(start),
                    end: Some(end),
                    reverse: false,
                }
            }
            None => ListingRequest {
                start: self.range_start,
                end: self.range_end,
                reverse: self.newest_first,
            },
        }
    }

    fn reverses_locally(&self) -> bool {
        self.newest_first && self.cap().is_some()
    }

    fn window_len(&self) -> Option<usize> {
        let request = self.listing_request();
        match (self.cap(), request.start, request.end) {
            (Some(_), Some(start), Some(end)) => {
                Some(end.checked_sub(start).map_or(0, |span| span.saturating_add(1)))
            }
            _ => None,
        }
    }
}

/// Outcome of a selection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Already archived, in raw listing order.
    pub to_skip: Vec<PlaylistItem>,
    /// New items, in fetch order.
    pub to_fetch: Vec<PlaylistItem>,
}

impl Selection {
    pub fn is_nothing_new(&self) -> bool {
        self.to_fetch.is_empty()
    }

    pub fn fetch_urls(&self) -> Vec<String> {
        self.to_fetch.iter().map(|item| item.url.clone()).collect()
    }
}

/// Splits a listing into archived and new items according to `policy`.
pub fn select(listing: &[PlaylistItem], archive: &Archive, policy: &SelectionPolicy) -> Selection {
    let window = policy.window_len().unwrap_or(listing.len());
    let mut ordered: Vec<&PlaylistItem> = listing.iter().take(window).collect();
    if policy.reverses_locally() {
        ordered.reverse();
    }

    let cap = policy.cap();
    let mut selection = Selection::default();
    let mut seen = HashSet::new();

    for item in ordered {
        if cap.is_some_and(|max| selection.to_fetch.len() >= max) {
            break;
        }
        let Some(id) = item.id.as_deref() else {
            warn!(position = item.position, url = %item.url, "dropping playlist entry without an id");
            continue;
        };
        if !seen.insert(id.to_owned()) {
            debug!(video_id = id, "playlist lists this item more than once");
            continue;
        }
        if archive.contains(id) {
            selection.to_skip.push(item.clone());
        } else {
            selection.to_fetch.push(item.clone());
        }
    }

    selection.to_skip.sort_by_key(|item| item.position);
    selection
}
