//! yt-dlp backed implementation of [`FetchEngine`].
//!
//! Every call shells out to the `yt-dlp` executable. Downloads run in a single
//! child process; its stdout and stderr are read on two threads and turned
//! into [`StatusEvent`]s that the orchestrator consumes as a plain iterator.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::{
    EventStream, FetchEngine, FetchOptions, ItemMetadata, ListingRequest, PlaylistItem,
    StatusEvent, watch_url,
};
use crate::error::{Result, SyncError};

const START_MARKER: &str = "WLSYNC-START ";
const DONE_MARKER: &str = "WLSYNC-DONE ";

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    cookies: Option<PathBuf>,
}

/// `--flat-playlist --dump-single-json` payload. Private or deleted videos
/// can show up as `null` entries or without an id.
#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    #[serde(default)]
    entries: Vec<Option<FlatEntry>>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    playlist_index: Option<usize>,
}

/// Object printed by the `after_move` hook.
#[derive(Debug, Deserialize)]
struct FinishedPayload {
    id: Option<String>,
    title: Option<String>,
    upload_date: Option<String>,
    filepath: Option<String>,
}

/// Subset of `--dump-single-json` for one video.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    upload_date: Option<String>,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies: None,
        }
    }

    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Runs `yt-dlp --version` to fail loudly when the executable is missing.
    pub fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(SyncError::engine(format!(
                "{} is installed but returned a failure status",
                self.program.display()
            ))),
            Err(err) => Err(SyncError::engine(format!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ))),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(cookies) = &self.cookies {
            command.arg("--cookies").arg(cookies);
        }
        command
    }

    fn listing_command(&self, playlist: &str, request: &ListingRequest) -> Command {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--dump-single-json")
            .arg("--ignore-errors")
            .arg("--no-warnings");
        if let Some(start) = request.start {
            command.arg("--playlist-start").arg(start.to_string());
        }
        if let Some(end) = request.end {
            command.arg("--playlist-end").arg(end.to_string());
        }
        if request.reverse {
            command.arg("--playlist-reverse");
        }
        command.arg(playlist);
        command
    }

    fn download_command(&self, urls: &[String], options: &FetchOptions) -> Command {
        let mut command = self.command();
        if self.cookies.is_none()
            && let Some(cookies) = &options.cookies
        {
            command.arg("--cookies").arg(cookies);
        }
        command
            .arg("--format")
            .arg(&options.format)
            .arg("--paths")
            .arg(format!("home:{}", options.output_dir.display()))
            .arg("--output")
            .arg(&options.filename_template)
            .arg("--merge-output-format")
            .arg(&options.merge_format)
            .arg("--no-warnings")
            .arg("--newline")
            .arg("--no-simulate")
            .arg("--print")
            .arg(format!("before_dl:{START_MARKER}%(id)s"))
            .arg("--print")
            .arg(format!(
                "after_move:{DONE_MARKER}%(.{{id,title,upload_date,filepath}})j"
            ));
        if options.ignore_errors {
            command.arg("--ignore-errors");
        }
        if let Some(max) = options.max_downloads {
            command.arg("--max-downloads").arg(max.to_string());
        }
        if let Some(start) = options.playlist_start {
            command.arg("--playlist-start").arg(start.to_string());
        }
        if let Some(end) = options.playlist_end {
            command.arg("--playlist-end").arg(end.to_string());
        }
        if options.reverse {
            command.arg("--playlist-reverse");
        }
        command.arg("--").args(urls);
        command
    }
}

impl FetchEngine for YtDlp {
    fn list_playlist(&self, playlist: &str, request: &ListingRequest) -> Result<Vec<PlaylistItem>> {
        let mut command = self.listing_command(playlist, request);
        debug!(?command, "listing playlist");
        let output = command
            .output()
            .map_err(|err| SyncError::engine(format!("running {}: {err}", self.program.display())))?;

        // With --ignore-errors yt-dlp may exit non-zero yet still print a
        // usable listing, so only an empty stdout is fatal.
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(SyncError::engine(format!(
                "failed to list {playlist} (status {}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !output.status.success() {
            warn!(status = %output.status, "playlist listing reported errors");
        }

        let offset = request.start.unwrap_or(1);
        parse_listing(&output.stdout, offset)
    }

    fn download<'a>(&'a self, urls: &[String], options: &FetchOptions) -> Result<EventStream<'a>> {
        let mut command = self.download_command(urls, options);
        debug!(?command, count = urls.len(), "starting download");
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SyncError::engine(format!("running {}: {err}", self.program.display())))?;
        Ok(Box::new(ChildEvents::spawn(child)?))
    }

    fn resolve_metadata(&self, video_id: &str) -> Result<ItemMetadata> {
        let url = watch_url(video_id);
        let output = self
            .command()
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(&url)
            .output()
            .map_err(|err| SyncError::engine(format!("fetching metadata for {url}: {err}")))?;

        if !output.status.success() {
            return Err(SyncError::engine(format!(
                "metadata command failed for {url} (status {})",
                output.status
            )));
        }

        let info: VideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| SyncError::engine(format!("parsing metadata for {url}: {err}")))?;
        Ok(ItemMetadata {
            id: info.id,
            title: info.fulltitle.or(info.title),
            upload_date: info.upload_date,
        })
    }
}

fn parse_listing(stdout: &[u8], offset: usize) -> Result<Vec<PlaylistItem>> {
    let playlist: FlatPlaylist = serde_json::from_slice(stdout)
        .map_err(|err| SyncError::engine(format!("parsing playlist listing: {err}")))?;

    let items = playlist
        .entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let entry = entry?;
            let id = entry.id.filter(|id| !id.trim().is_empty());
            let url = entry
                .webpage_url
                .or(entry.url)
                .or_else(|| id.as_deref().map(watch_url))
                .unwrap_or_default();
            Some(PlaylistItem {
                id,
                title: entry.title,
                url,
                position: entry.playlist_index.unwrap_or(offset + index),
            })
        })
        .collect();
    Ok(items)
}

fn parse_stdout_line(line: &str) -> Option<StatusEvent> {
    let line = line.trim();
    if let Some(id) = line.strip_prefix(START_MARKER) {
        let id = id.trim();
        return Some(StatusEvent::Downloading {
            id: (!id.is_empty() && id != "NA").then(|| id.to_string()),
        });
    }
    let payload = line.strip_prefix(DONE_MARKER)?;
    match serde_json::from_str::<FinishedPayload>(payload) {
        Ok(done) => Some(StatusEvent::Finished {
            file_path: done.filepath.map(PathBuf::from).unwrap_or_default(),
            item: ItemMetadata {
                id: done.id,
                title: done.title,
                upload_date: done.upload_date,
            },
        }),
        Err(err) => {
            warn!(error = %err, line, "unreadable completion line from yt-dlp");
            None
        }
    }
}

/// Turns `ERROR: [extractor] <id>: message` into an error event. Lines of
/// any other shape keep an unresolved id.
fn parse_stderr_line(line: &str) -> Option<StatusEvent> {
    let message = line.trim().strip_prefix("ERROR:")?.trim();
    let id = message
        .strip_prefix('[')
        .and_then(|rest| rest.split_once("] "))
        .and_then(|(_, rest)| rest.split_once(": "))
        .map(|(id, _)| id.trim())
        .filter(|id| !id.is_empty() && !id.contains(char::is_whitespace))
        .map(str::to_string);
    Some(StatusEvent::Error {
        id,
        message: message.to_string(),
    })
}

/// Events of a running yt-dlp child. Dropping the stream before it is
/// exhausted kills the child.
struct ChildEvents {
    events: Receiver<StatusEvent>,
    child: Child,
    readers: Vec<JoinHandle<()>>,
    exhausted: bool,
}

impl ChildEvents {
    fn spawn(mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SyncError::engine("yt-dlp stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SyncError::engine("yt-dlp stderr not captured"))?;

        let (tx, events) = mpsc::channel();
        let readers = vec![
            spawn_reader(stdout, tx.clone(), parse_stdout_line),
            spawn_reader(stderr, tx, parse_stderr_line),
        ];

        Ok(Self {
            events,
            child,
            readers,
            exhausted: false,
        })
    }

    fn reap(&mut self) {
        match self.child.wait() {
            Ok(status) if status.success() => debug!("yt-dlp finished"),
            Ok(status) => debug!(%status, "yt-dlp exited with errors"),
            Err(err) => warn!(error = %err, "could not wait for yt-dlp"),
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

fn spawn_reader<R>(
    source: R,
    tx: Sender<StatusEvent>,
    parse: fn(&str) -> Option<StatusEvent>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(source).lines().map_while(|line| line.ok()) {
            match parse(&line) {
                Some(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                None => {
                    if !line.trim().is_empty() {
                        debug!(target: "yt-dlp", "{line}");
                    }
                }
            }
        }
    })
}

impl Iterator for ChildEvents {
    type Item = StatusEvent;

    fn next(&mut self) -> Option<StatusEvent> {
        if self.exhausted {
            return None;
        }
        match self.events.recv() {
            Ok(event) => Some(event),
            Err(_) => {
                self.exhausted = true;
                self.reap();
                None
            }
        }
    }
}

impl Drop for ChildEvents {
    fn drop(&mut self) {
        if self.exhausted {
            return;
        }
        if let Ok(None) = self.child.try_wait()
            && let Err(err) = self.child.kill()
        {
            warn!(error = %err, "could not stop yt-dlp");
        }
        let _ = self.child.wait();
    }
}
