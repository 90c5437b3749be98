#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::warn;

use crate::selector::SelectionPolicy;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PLAYLIST_URL: &str = "https://www.youtube.com/playlist?list=WL";
pub const DEFAULT_OUTPUT_DIR: &str = "./yt_watchlater";
pub const DEFAULT_ARCHIVE_PATH: &str = "./yt_watchlater_archive.json";
pub const DEFAULT_FORMAT: &str = "bestvideo+bestaudio/best";
pub const DEFAULT_MERGE_FORMAT: &str = "mp4";
pub const DEFAULT_YT_DLP: &str = "yt-dlp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: String,
    pub port: Option<u16>,
    pub secret: Option<String>,
}

/// A configuration value that was ignored. The feature it controls stays
/// disabled and the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ignoring {key}={value:?}: {reason}")]
pub struct ConfigValidationError {
    pub key: &'static str,
    pub value: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub playlist_url: String,
    pub output_dir: PathBuf,
    pub archive_path: PathBuf,
    pub cookies: Option<PathBuf>,
    pub webhook: Option<WebhookConfig>,
    pub retention_days: Option<i64>,
    pub selection: SelectionPolicy,
    pub format: String,
    pub merge_format: String,
    pub yt_dlp: PathBuf,
    pub issues: Vec<ConfigValidationError>,
}

/// Values given on the command line. Numeric values stay strings so invalid
/// input is handled like invalid environment values.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub env_path: Option<PathBuf>,
    pub playlist_url: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub cookies: Option<PathBuf>,
    pub webhook_url: Option<String>,
    pub retention_days: Option<String>,
    pub max_videos: Option<String>,
    pub playlist_start: Option<String>,
    pub playlist_end: Option<String>,
    pub oldest_first: bool,
    pub format: Option<String>,
    pub yt_dlp: Option<PathBuf>,
}

/// Resolves settings from CLI overrides, the process environment and the
/// `.env` file, in that order. Every ignored value is logged as a warning.
pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    let settings = build_settings(&file_vars, env_var_string, overrides);
    for issue in &settings.issues {
        warn!("{issue}");
    }
    Ok(settings)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let mut issues = Vec::new();

    let playlist_url = non_blank(overrides.playlist_url)
        .or_else(|| lookup("WATCHLATER_URL"))
        .unwrap_or_else(|| DEFAULT_PLAYLIST_URL.to_string());
    let output_dir = overrides
        .output_dir
        .or_else(|| lookup("OUTPUT_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let archive_path = overrides
        .archive_path
        .or_else(|| lookup("ARCHIVE_JSON").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE_PATH));
    let cookies = overrides
        .cookies
        .or_else(|| lookup("COOKIES_FILE").map(PathBuf::from));

    let webhook = non_blank(overrides.webhook_url)
        .or_else(|| lookup("WEBHOOK_URL"))
        .map(|url| WebhookConfig {
            url,
            port: lookup("WEBHOOK_PORT")
                .and_then(|raw| parse_number::<u16>("WEBHOOK_PORT", &raw, &mut issues)),
            secret: lookup("WEBHOOK_SECRET"),
        });

    let retention_days = non_blank(overrides.retention_days)
        .or_else(|| lookup("RETENTION_DAYS"))
        .and_then(|raw| parse_number::<i64>("RETENTION_DAYS", &raw, &mut issues));
    let max_items = non_blank(overrides.max_videos)
        .or_else(|| lookup("MAX_VIDEOS"))
        .and_then(|raw| parse_positive("MAX_VIDEOS", &raw, &mut issues));
    let range_start = non_blank(overrides.playlist_start)
        .or_else(|| lookup("PLAYLIST_START"))
        .and_then(|raw| parse_positive("PLAYLIST_START", &raw, &mut issues));
    let range_end = non_blank(overrides.playlist_end)
        .or_else(|| lookup("PLAYLIST_END"))
        .and_then(|raw| parse_positive("PLAYLIST_END", &raw, &mut issues));
    let (range_start, range_end) = match (range_start, range_end) {
        (Some(start), Some(end)) if start > end => {
            issues.push(ConfigValidationError {
                key: "PLAYLIST_END",
                value: end.to_string(),
                reason: "smaller than PLAYLIST_START, playlist range ignored",
            });
            (None, None)
        }
        range => range,
    };
    let newest_first = if overrides.oldest_first {
        false
    } else {
        lookup("NEWEST_FIRST")
            .and_then(|raw| parse_bool("NEWEST_FIRST", &raw, &mut issues))
            .unwrap_or(true)
    };

    let format = non_blank(overrides.format)
        .or_else(|| lookup("FORMAT"))
        .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
    let merge_format = lookup("MERGE_FORMAT").unwrap_or_else(|| DEFAULT_MERGE_FORMAT.to_string());
    let yt_dlp = overrides
        .yt_dlp
        .or_else(|| lookup("YT_DLP").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP));

    Settings {
        playlist_url,
        output_dir,
        archive_path,
        cookies,
        webhook,
        retention_days,
        selection: SelectionPolicy {
            newest_first,
            max_items,
            range_start,
            range_end,
        },
        format,
        merge_format,
        yt_dlp,
        issues,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    raw: &str,
    issues: &mut Vec<ConfigValidationError>,
) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            issues.push(ConfigValidationError {
                key,
                value: raw.to_string(),
                reason: "not a valid number",
            });
            None
        }
    }
}

fn parse_positive(
    key: &'static str,
    raw: &str,
    issues: &mut Vec<ConfigValidationError>,
) -> Option<usize> {
    match parse_number::<usize>(key, raw, issues)? {
        0 => {
            issues.push(ConfigValidationError {
                key,
                value: raw.to_string(),
                reason: "must be greater than zero",
            });
            None
        }
        value => Some(value),
    }
}

fn parse_bool(
    key: &'static str,
    raw: &str,
    issues: &mut Vec<ConfigValidationError>,
) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            issues.push(ConfigValidationError {
                key,
                value: raw.to_string(),
                reason: "not a boolean",
            });
            None
        }
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
