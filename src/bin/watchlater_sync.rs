#![forbid(unsafe_code)]

//! Downloads new entries of a watch-later playlist and keeps the JSON archive
//! up to date.
//!
//! Runs once and exits. Configuration comes from flags, the environment and a
//! `.env` file; the final report goes to stdout, logs go to stderr.

use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use watchlater_sync::archive::ArchiveStore;
use watchlater_sync::config::{Settings, SettingsOverrides, resolve_settings};
use watchlater_sync::notifier::build_notifier;
use watchlater_sync::report::Report;
use watchlater_sync::sync::{RunStats, SyncJob, SyncRunner};
use watchlater_sync::ytdlp::YtDlp;

#[derive(Debug, Parser)]
#[command(name = "watchlater_sync", version, about = "Sync a watch-later playlist to disk")]
struct Cli {
    /// Print the final report as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Path of the .env file to read.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    #[arg(long, value_name = "URL")]
    playlist_url: Option<String>,

    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Archive JSON file.
    #[arg(long, value_name = "PATH")]
    archive: Option<PathBuf>,

    /// Netscape cookies file passed to yt-dlp.
    #[arg(long, value_name = "PATH")]
    cookies: Option<PathBuf>,

    #[arg(long, value_name = "URL")]
    webhook_url: Option<String>,

    /// Delete downloads older than this many days.
    #[arg(long, value_name = "DAYS")]
    retention_days: Option<String>,

    /// Download at most this many new videos.
    #[arg(long, value_name = "N")]
    max_videos: Option<String>,

    #[arg(long, value_name = "INDEX")]
    playlist_start: Option<String>,

    #[arg(long, value_name = "INDEX")]
    playlist_end: Option<String>,

    /// Process the playlist in listed order instead of newest first.
    #[arg(long)]
    oldest_first: bool,

    /// yt-dlp format selector.
    #[arg(long)]
    format: Option<String>,

    /// yt-dlp executable.
    #[arg(long, value_name = "PATH")]
    yt_dlp: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            env_path: self.env_file.clone(),
            playlist_url: self.playlist_url.clone(),
            output_dir: self.output_dir.clone(),
            archive_path: self.archive.clone(),
            cookies: self.cookies.clone(),
            webhook_url: self.webhook_url.clone(),
            retention_days: self.retention_days.clone(),
            max_videos: self.max_videos.clone(),
            playlist_start: self.playlist_start.clone(),
            playlist_end: self.playlist_end.clone(),
            oldest_first: self.oldest_first,
            format: self.format.clone(),
            yt_dlp: self.yt_dlp.clone(),
        }
    }
}

fn init_tracing(json: bool) {
    let default_level = if json { "warn" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();
}

fn print_banner(settings: &Settings) {
    println!("===================================");
    println!("Watch Later Sync");
    println!("===================================");
    println!("Playlist: {}", settings.playlist_url);
    println!("Output directory: {}", settings.output_dir.display());
    println!("Archive: {}", settings.archive_path.display());
    if let Some(max) = settings.selection.cap() {
        println!("Max new videos: {max}");
    }
    if let Some(days) = settings.retention_days.filter(|days| *days > 0) {
        println!("Retention: {days} day(s)");
    }
    println!(
        "Order: {}",
        if settings.selection.newest_first {
            "newest first"
        } else {
            "playlist order"
        }
    );
    if settings.webhook.is_some() {
        println!("Webhook: enabled");
    }
    println!();
}

fn emit_report(stats: &RunStats, json: bool) {
    let report = Report::new(stats, stats.elapsed());
    if json {
        match report.to_json() {
            Ok(document) => println!("{document}"),
            Err(err) => error!(error = %err, "could not serialize report"),
        }
    } else {
        print!("{}", report.to_human());
    }
}

/// Resolves settings and wires the runner to yt-dlp, the archive and the
/// notifier.
fn prepare(cli: &Cli) -> Result<SyncRunner<YtDlp>> {
    let settings = resolve_settings(cli.overrides())?;
    if !cli.json {
        print_banner(&settings);
    }

    let engine = YtDlp::new(&settings.yt_dlp).with_cookies(settings.cookies.clone());
    engine.ensure_available()?;
    fs::create_dir_all(&settings.output_dir).with_context(|| {
        format!(
            "creating output directory {}",
            settings.output_dir.display()
        )
    })?;

    Ok(SyncRunner::new(
        ArchiveStore::new(&settings.archive_path),
        engine,
        build_notifier(settings.webhook.as_ref()),
        SyncJob::from_settings(&settings),
    ))
}

/// Runs `work` on the blocking pool, raising `interrupt` on Ctrl+C. The
/// stats recorded so far come back even when `work` fails or panics.
async fn drive<F>(work: F, interrupt: Arc<AtomicBool>) -> (RunStats, Result<()>)
where
    F: FnOnce(&mut RunStats) -> watchlater_sync::Result<()> + Send + 'static,
{
    let shared = Arc::new(Mutex::new(RunStats::new()));
    let task_stats = Arc::clone(&shared);
    let mut task = tokio::task::spawn_blocking(move || {
        let mut stats = task_stats.lock();
        work(&mut *stats)
    });

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = signal::ctrl_c() => {
            warn!("interrupt received, finishing current item");
            interrupt.store(true, Ordering::SeqCst);
            task.await
        }
    };
    let outcome = match joined {
        Ok(outcome) => outcome.context("sync failed"),
        Err(err) => Err(anyhow::Error::new(err).context("sync task panicked")),
    };

    let stats = shared.lock().clone();
    (stats, outcome)
}

/// Runs one sync. A report is printed on every path, including failures
/// before the run started.
async fn run(cli: Cli) -> Result<()> {
    let runner = match prepare(&cli) {
        Ok(runner) => runner,
        Err(err) => {
            emit_report(&RunStats::new(), cli.json);
            return Err(err);
        }
    };
    let interrupt = runner.interrupt_handle();

    let (stats, outcome) = drive(move |stats| runner.run(stats), Arc::clone(&interrupt)).await;

    emit_report(&stats, cli.json);
    if stats.interrupted || interrupt.load(Ordering::SeqCst) {
        info!("sync interrupted by user");
        return Ok(());
    }
    outcome
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchlater_sync::SyncError;

    #[tokio::test]
    async fn panicking_run_still_returns_recorded_stats() {
        let (stats, outcome) = drive(
            |stats| {
                stats.record_error(Some("a".into()), None, "boom");
                panic!("window arithmetic overflowed");
            },
            Arc::new(AtomicBool::new(false)),
        )
        .await;

        assert_eq!(stats.errors.len(), 1);
        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert!(Report::new(&stats, stats.elapsed()).to_json().is_ok());
    }

    #[tokio::test]
    async fn failing_run_keeps_partial_stats() {
        let (stats, outcome) = drive(
            |stats| {
                stats.record_error(None, None, "unable to download webpage");
                Err(SyncError::engine("listing failed"))
            },
            Arc::new(AtomicBool::new(false)),
        )
        .await;

        assert_eq!(stats.errors.len(), 1);
        assert!(format!("{:#}", outcome.unwrap_err()).contains("listing failed"));
    }

    #[tokio::test]
    async fn successful_run_returns_its_stats() {
        let (stats, outcome) = drive(
            |stats| {
                stats.interrupted = true;
                Ok(())
            },
            Arc::new(AtomicBool::new(false)),
        )
        .await;
        assert!(outcome.is_ok());
        assert!(stats.interrupted);
    }
}
