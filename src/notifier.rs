//! Best-effort webhook notifications for completed downloads.
//!
//! Nothing in here can fail a run: every transport error, timeout or non-2xx
//! answer is logged as a warning and dropped.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::archive::CompletedDownload;
use crate::config::WebhookConfig;

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub trait Notifier: Send {
    fn notify(&self, download: &CompletedDownload);
}

/// Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _download: &CompletedDownload) {}
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("webhook returned status {0}")]
    Status(u16),
    #[error("webhook request failed: {0}")]
    Transport(String),
}

/// POSTs the completed download as JSON to a configured endpoint.
pub struct WebhookNotifier {
    endpoint: Url,
    secret: Option<String>,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Result<Self, url::ParseError> {
        let endpoint = resolve_endpoint(&config.url, config.port)?;
        let agent = ureq::AgentBuilder::new().timeout(WEBHOOK_TIMEOUT).build();
        Ok(Self {
            endpoint,
            secret: config.secret.clone().filter(|secret| !secret.is_empty()),
            agent,
        })
    }

    pub fn send(&self, download: &CompletedDownload) -> Result<u16, NotificationError> {
        let mut request = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            request = request.set("Authorization", &format!("Bearer {secret}"));
        }

        match request.send_json(download) {
            Ok(response) if (200..300).contains(&response.status()) => Ok(response.status()),
            Ok(response) => Err(NotificationError::Status(response.status())),
            Err(ureq::Error::Status(code, _)) => Err(NotificationError::Status(code)),
            Err(ureq::Error::Transport(transport)) => {
                Err(NotificationError::Transport(transport.to_string()))
            }
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, download: &CompletedDownload) {
        match self.send(download) {
            Ok(status) => {
                info!(video_id = %download.video_id, status, "webhook notification sent");
            }
            Err(err) => {
                warn!(video_id = %download.video_id, endpoint = %self.endpoint, error = %err,
                    "webhook notification failed");
            }
        }
    }
}

/// Returns the webhook notifier, or a no-op one when the webhook is not
/// configured or its URL is unusable.
pub fn build_notifier(config: Option<&WebhookConfig>) -> Box<dyn Notifier> {
    let Some(config) = config else {
        return Box::new(NoopNotifier);
    };
    match WebhookNotifier::new(config) {
        Ok(notifier) => Box::new(notifier),
        Err(err) => {
            warn!(url = %config.url, error = %err, "invalid webhook URL, notifications disabled");
            Box::new(NoopNotifier)
        }
    }
}

/// Builds the final endpoint. A URL without scheme is treated as plain HTTP,
/// and a configured port replaces the default one unless the URL already
/// names a port.
fn resolve_endpoint(raw: &str, port: Option<u16>) -> Result<Url, url::ParseError> {
    let trimmed = raw.trim();
    let mut endpoint = if trimmed.contains("://") {
        Url::parse(trimmed)?
    } else {
        Url::parse(&format!("http://{}", trimmed.trim_start_matches('/')))?
    };
    if let Some(port) = port
        && endpoint.port().is_none()
        && endpoint.set_port(Some(port)).is_err()
    {
        warn!(url = %endpoint, port, "cannot set webhook port on this URL");
    }
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn sample_download() -> CompletedDownload {
        CompletedDownload {
            video_id: "abc123".into(),
            title: Some("A title".into()),
            upload_date: None,
            download_date: Some("2025-01-30T12:00:00Z".into()),
            filepath: Some("/videos/NA A title [abc123].mp4".into()),
        }
    }

    /// Accepts one connection, returns the raw request and answers `status`.
    fn one_shot_server(status_line: &'static str) -> Result<(String, thread::JoinHandle<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some((name, value)) = line.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().unwrap();
                }
                let done = line == "\r\n" || line.is_empty();
                head.push_str(&line);
                if done {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            let mut stream = stream;
            write!(
                stream,
                "{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
            stream.flush().unwrap();
            head + &String::from_utf8(body).unwrap()
        });
        Ok((format!("http://{addr}/hook"), handle))
    }

    #[test]
    fn resolve_endpoint_adds_scheme_and_port() -> Result<()> {
        assert_eq!(
            resolve_endpoint("example.com/hook", None)?.as_str(),
            "http://example.com/hook"
        );
        assert_eq!(
            resolve_endpoint("example.com/hook", Some(8080))?.as_str(),
            "http://example.com:8080/hook"
        );
        assert_eq!(
            resolve_endpoint("https://example.com/hook?x=1", Some(8443))?.as_str(),
            "https://example.com:8443/hook?x=1"
        );
        assert_eq!(
            resolve_endpoint("http://example.com:9000/hook", Some(8080))?.as_str(),
            "http://example.com:9000/hook"
        );
        Ok(())
    }

    #[test]
    fn build_notifier_without_config_is_noop() {
        let notifier = build_notifier(None);
        notifier.notify(&sample_download());
    }

    #[test]
    fn webhook_posts_json_with_bearer_token() -> Result<()> {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK")?;
        let notifier = WebhookNotifier::new(&WebhookConfig {
            url,
            port: None,
            secret: Some("s3cret".into()),
        })?;

        assert_eq!(notifier.send(&sample_download()).unwrap(), 200);
        let request = server.join().unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /hook HTTP/1.1"));
        assert!(lower.contains("authorization: bearer s3cret"));
        assert!(lower.contains("content-type: application/json"));

        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let payload: serde_json::Value = serde_json::from_str(body)?;
        assert_eq!(payload["video_id"], "abc123");
        assert_eq!(payload["title"], "A title");
        assert!(payload["upload_date"].is_null());
        assert_eq!(payload["download_date"], "2025-01-30T12:00:00Z");
        assert_eq!(payload["filepath"], "/videos/NA A title [abc123].mp4");
        Ok(())
    }

    #[test]
    fn webhook_without_secret_sends_no_authorization() -> Result<()> {
        let (url, server) = one_shot_server("HTTP/1.1 204 No Content")?;
        let notifier = WebhookNotifier::new(&WebhookConfig {
            url,
            port: None,
            secret: None,
        })?;
        assert_eq!(notifier.send(&sample_download()).unwrap(), 204);
        let request = server.join().unwrap();
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
        Ok(())
    }

    #[test]
    fn webhook_error_status_is_reported() -> Result<()> {
        let (url, server) = one_shot_server("HTTP/1.1 500 Internal Server Error")?;
        let notifier = WebhookNotifier::new(&WebhookConfig {
            url,
            port: None,
            secret: None,
        })?;
        let err = notifier.send(&sample_download()).unwrap_err();
        assert!(matches!(err, NotificationError::Status(500)));
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn unreachable_webhook_does_not_panic() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        let notifier = WebhookNotifier::new(&WebhookConfig {
            url: format!("http://{addr}/hook"),
            port: None,
            secret: None,
        })?;
        assert!(matches!(
            notifier.send(&sample_download()),
            Err(NotificationError::Transport(_))
        ));
        notifier.notify(&sample_download());
        Ok(())
    }
}
