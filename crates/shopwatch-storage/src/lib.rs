//! Flat-file snapshots, unified diff previews, and HTTP fetch/notify plumbing for shopwatch.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use similar::TextDiff;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shopwatch-storage";

/// Context lines kept around each changed region of a diff preview.
pub const DIFF_CONTEXT_LINES: usize = 2;

/// Preview returned when texts differ but their line-level diff is empty.
pub const NO_VISIBLE_DIFF: &str = "(content changed but no line diff could be rendered)";

/// Appended after a preview cut to its line limit.
pub const TRUNCATION_MARKER: &str = "... (diff truncated)";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reads a snapshot file. A missing file is `Ok(None)`.
pub async fn read_snapshot(path: impl AsRef<Path>) -> anyhow::Result<Option<String>> {
    let path = path.as_ref();
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading snapshot {}", path.display())),
    }
}

/// Replaces a snapshot's content through a temp file and rename, creating parent directories.
pub async fn write_snapshot(path: impl AsRef<Path>, content: &str) -> anyhow::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.snapshot.tmp", Uuid::new_v4()));
    let staged = match write_temp_snapshot(&temp_path, content).await {
        Ok(()) => fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "renaming temp snapshot {} -> {}",
                temp_path.display(),
                path.display()
            )
        }),
        Err(err) => Err(err),
    };
    discard_on_error(&temp_path, staged).await
}

async fn write_temp_snapshot(temp_path: &Path, content: &str) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
    file.write_all(content.as_bytes())
        .await
        .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))
}

/// Removes the temp file when staging or renaming failed; the original error is kept.
async fn discard_on_error<T>(temp_path: &Path, result: anyhow::Result<T>) -> anyhow::Result<T> {
    if result.is_err() {
        let _ = fs::remove_file(temp_path).await;
    }
    result
}

/// Outcome of comparing a scalar value against its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueCheck {
    pub changed: bool,
    /// Previous value, empty on first observation.
    pub old_value: String,
    pub first_observation: bool,
}

/// Compares `new_value` with the persisted value and stores it when it differs.
///
/// The persisted value is trimmed before comparison. With no snapshot yet the value is
/// always stored and reported as changed.
pub async fn check_and_update(
    new_value: &str,
    snapshot_path: impl AsRef<Path>,
) -> anyhow::Result<ValueCheck> {
    let snapshot_path = snapshot_path.as_ref();
    let previous = read_snapshot(snapshot_path).await?;
    let first_observation = previous.is_none();
    let old_value = previous
        .map(|text| text.trim().to_string())
        .unwrap_or_default();

    let changed = first_observation || old_value != new_value;
    if changed {
        write_snapshot(snapshot_path, new_value).await?;
        info!(
            snapshot = %snapshot_path.display(),
            old_value = %old_value,
            new_value,
            first_observation,
            "value snapshot updated"
        );
    }

    Ok(ValueCheck {
        changed,
        old_value,
        first_observation,
    })
}

/// Outcome of comparing full content against its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffCheck {
    pub changed: bool,
    /// Bounded unified diff; empty when unchanged.
    pub preview: String,
}

/// Compares `current_text` with the persisted text and returns a preview of at most
/// `max_lines` diff lines plus a truncation marker.
pub async fn diff_and_update(
    current_text: &str,
    snapshot_path: impl AsRef<Path>,
    max_lines: usize,
) -> anyhow::Result<DiffCheck> {
    let snapshot_path = snapshot_path.as_ref();
    let old_text = read_snapshot(snapshot_path).await?.unwrap_or_default();

    if old_text == current_text {
        debug!(snapshot = %snapshot_path.display(), "content unchanged");
        return Ok(DiffCheck {
            changed: false,
            preview: String::new(),
        });
    }

    write_snapshot(snapshot_path, current_text).await?;

    let diff_lines = unified_diff_lines(&old_text, current_text);
    info!(
        snapshot = %snapshot_path.display(),
        diff_lines = diff_lines.len(),
        "content snapshot updated"
    );
    let preview = if diff_lines.is_empty() {
        NO_VISIBLE_DIFF.to_string()
    } else {
        bounded_preview(&diff_lines, max_lines)
    };

    Ok(DiffCheck {
        changed: true,
        preview,
    })
}

/// Line-oriented unified diff (`--- before` / `+++ after`) ignoring line terminators.
pub fn unified_diff_lines(old_text: &str, new_text: &str) -> Vec<String> {
    let old = rejoin_lines(old_text);
    let new = rejoin_lines(new_text);
    if old == new {
        return Vec::new();
    }

    TextDiff::from_lines(&old, &new)
        .unified_diff()
        .context_radius(DIFF_CONTEXT_LINES)
        .header("before", "after")
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}

fn rejoin_lines(text: &str) -> String {
    text.lines().map(|line| format!("{line}\n")).collect()
}

pub fn bounded_preview(lines: &[String], max_lines: usize) -> String {
    if lines.len() <= max_lines {
        return lines.join("\n");
    }
    let mut kept: Vec<&str> = lines[..max_lines].iter().map(String::as_str).collect();
    kept.push(TRUNCATION_MARKER);
    kept.join("\n")
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Something that can turn a URL into text content.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
        })
    }
}

#[async_trait]
impl ContentSource for HttpFetcher {
    /// `file://<path>` reads a local file; anything else is a GET that must return 2xx.
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return fs::read_to_string(path)
                .await
                .map_err(|source| FetchError::File {
                    path: path.to_string(),
                    source,
                });
        }

        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let text = resp.text().await?;
            debug!(bytes = text.len(), "fetched content");
            Ok(text)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Skipped,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned http status {status}")]
    HttpStatus { status: u16 },
}

/// Delivery of a single text message to a chat channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<Delivery, NotifyError>;
}

/// Posts `{"text": ...}` to an incoming-webhook URL. An empty URL disables delivery.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str, config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            webhook_url: webhook_url.trim().to_string(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.webhook_url.is_empty()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, text: &str) -> Result<Delivery, NotifyError> {
        if !self.is_enabled() {
            info!("webhook url is empty; notification skipped");
            return Ok(Delivery::Skipped);
        }

        let span = info_span!("webhook_post", bytes = text.len());
        async {
            let resp = self
                .client
                .post(&self.webhook_url)
                .json(&serde_json::json!({ "text": text }))
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(NotifyError::HttpStatus {
                    status: status.as_u16(),
                });
            }
            info!("notification delivered");
            Ok(Delivery::Sent)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves one request with `status_line` and returns the URL to hit.
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/")
    }

    fn leftover_temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".snapshot.tmp"))
            .collect()
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_no_temp_file() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("page.html");
        std::fs::create_dir(&target).expect("dir in the way");
        std::fs::write(target.join("keep"), "x").expect("occupy dir");

        assert!(write_snapshot(&target, "<html></html>").await.is_err());
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn staging_error_discards_temp_file() {
        let dir = tempdir().expect("tempdir");
        let temp_path = dir.path().join(".partial.snapshot.tmp");
        std::fs::write(&temp_path, "half written").expect("seed temp");

        let result: anyhow::Result<()> =
            discard_on_error(&temp_path, Err(anyhow::anyhow!("disk full"))).await;
        assert_eq!(result.expect_err("kept").to_string(), "disk full");
        assert!(!temp_path.exists());

        std::fs::write(&temp_path, "complete").expect("seed temp");
        discard_on_error(&temp_path, Ok(())).await.expect("ok passes through");
        assert!(temp_path.exists());
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn first_value_check_reports_change_with_empty_old_value() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/price.txt");

        let first = check_and_update("", &path).await.expect("first");
        assert_eq!(
            first,
            ValueCheck {
                changed: true,
                old_value: String::new(),
                first_observation: true,
            }
        );
        assert!(path.exists());

        let second = check_and_update("", &path).await.expect("second");
        assert!(!second.changed);
        assert!(!second.first_observation);
    }

    #[tokio::test]
    async fn repeated_value_is_unchanged_and_new_value_reports_old() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("price.txt");

        assert!(check_and_update("1200", &path).await.expect("first").changed);
        let same = check_and_update("1200", &path).await.expect("same");
        assert!(!same.changed);
        assert_eq!(same.old_value, "1200");

        let moved = check_and_update("1350", &path).await.expect("moved");
        assert!(moved.changed);
        assert_eq!(moved.old_value, "1200");
        assert_eq!(
            read_snapshot(&path).await.expect("read"),
            Some("1350".to_string())
        );
    }

    #[tokio::test]
    async fn persisted_value_is_trimmed_before_comparison() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("price.txt");
        std::fs::write(&path, "980\n").expect("seed");
        let check = check_and_update("980", &path).await.expect("check");
        assert!(!check.changed);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "980\n");
    }

    #[tokio::test]
    async fn unchanged_content_leaves_snapshot_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("page.html");
        std::fs::write(&path, "a\nb\n").expect("seed");
        let before = std::fs::metadata(&path).expect("meta").modified().expect("mtime");

        let check = diff_and_update("a\nb\n", &path, 40).await.expect("diff");
        assert_eq!(
            check,
            DiffCheck {
                changed: false,
                preview: String::new(),
            }
        );
        let after = std::fs::metadata(&path).expect("meta").modified().expect("mtime");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn first_content_diff_is_all_insertions() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("page.html");

        let check = diff_and_update("one\ntwo\n", &path, 40).await.expect("diff");
        assert!(check.changed);
        let lines: Vec<_> = check.preview.lines().collect();
        assert_eq!(lines[0], "--- before");
        assert_eq!(lines[1], "+++ after");
        assert!(lines[2].starts_with("@@"));
        assert_eq!(&lines[3..], &["+one", "+two"]);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "one\ntwo\n");
    }

    #[tokio::test]
    async fn changed_line_diff_keeps_two_lines_of_context() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("page.html");
        let old: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        let new = old.replace("line 5\n", "line five\n");
        std::fs::write(&path, &old).expect("seed");

        let check = diff_and_update(&new, &path, 40).await.expect("diff");
        let body: Vec<_> = check.preview.lines().skip(3).collect();
        assert_eq!(
            body,
            vec![" line 3", " line 4", "-line 5", "+line five", " line 6", " line 7"]
        );
    }

    #[tokio::test]
    async fn line_ending_only_change_returns_sentinel() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("page.html");
        std::fs::write(&path, "a\nb").expect("seed");

        let check = diff_and_update("a\r\nb\r\n", &path, 40).await.expect("diff");
        assert!(check.changed);
        assert_eq!(check.preview, NO_VISIBLE_DIFF);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "a\r\nb\r\n");
    }

    #[tokio::test]
    async fn long_diff_is_truncated_with_marker() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("page.html");
        let new: String = (0..100).map(|i| format!("row {i}\n")).collect();

        let check = diff_and_update(&new, &path, 10).await.expect("diff");
        let lines: Vec<_> = check.preview.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[10], TRUNCATION_MARKER);
    }

    #[test]
    fn preview_at_limit_is_not_truncated() {
        let lines: Vec<String> = vec!["a".into(), "b".into()];
        assert_eq!(bounded_preview(&lines, 2), "a\nb");
        assert_eq!(bounded_preview(&lines, 1), format!("a\n{TRUNCATION_MARKER}"));
    }

    proptest! {
        #[test]
        fn preview_never_exceeds_limit_plus_marker(
            old in "[ab \n]{0,60}",
            new in "[abc \n]{0,60}",
            max_lines in 0usize..12,
        ) {
            let lines = unified_diff_lines(&old, &new);
            let preview = bounded_preview(&lines, max_lines);
            prop_assert!(preview.lines().count() <= max_lines + 1);
        }
    }

    #[tokio::test]
    async fn file_scheme_reads_local_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("watch_target.txt");
        std::fs::write(&path, "price = 1200\n").expect("seed");

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let text = fetcher
            .fetch_text(&format!("file://{}", path.display()))
            .await
            .expect("fetch");
        assert_eq!(text, "price = 1200\n");

        let missing = fetcher
            .fetch_text(&format!("file://{}", dir.path().join("absent").display()))
            .await;
        assert!(matches!(missing, Err(FetchError::File { .. })));
    }

    #[tokio::test]
    async fn fetch_returns_body_on_success() {
        let url = one_shot_server("200 OK", "<p id=\"price\">980</p>").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let text = fetcher.fetch_text(&url).await.expect("fetch");
        assert_eq!(text, "<p id=\"price\">980</p>");
    }

    #[tokio::test]
    async fn non_success_status_fails_fetch() {
        let url = one_shot_server("503 Service Unavailable", "").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher.fetch_text(&url).await.expect_err("status error");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn empty_webhook_url_skips_delivery() {
        let notifier = WebhookNotifier::new("   ", HttpClientConfig::default()).expect("client");
        assert!(!notifier.is_enabled());
        assert_eq!(notifier.notify("hello").await.expect("skip"), Delivery::Skipped);
    }

    #[tokio::test]
    async fn webhook_delivery_and_rejection() {
        let ok_url = one_shot_server("200 OK", "ok").await;
        let notifier = WebhookNotifier::new(&ok_url, HttpClientConfig::default()).expect("client");
        assert_eq!(notifier.notify("hello").await.expect("sent"), Delivery::Sent);

        let bad_url = one_shot_server("400 Bad Request", "no_text").await;
        let notifier = WebhookNotifier::new(&bad_url, HttpClientConfig::default()).expect("client");
        let err = notifier.notify("hello").await.expect_err("rejected");
        assert!(matches!(err, NotifyError::HttpStatus { status: 400 }));
    }
}
