#![forbid(unsafe_code)]

//! Watch-later playlist synchronisation.
//!
//! Everything that touches durable state lives here so the binary stays a thin
//! wrapper: the JSON archive, the selection rules applied to a playlist
//! listing, retention pruning, webhook notifications and the orchestrator that
//! ties them together around an external fetch engine (yt-dlp in production).

pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod report;
pub mod retention;
pub mod selector;
pub mod sync;
pub mod ytdlp;

pub use error::{Result, SyncError};
