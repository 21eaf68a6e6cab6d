//! Run orchestration: CSV batch ingest, watched-target checks and change notifications.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use shopwatch_core::{ErrorRecord, NormalizedRecord, SummaryEntry};
use shopwatch_ingest::{
    aggregate, normalize_csv_file, render_summary, write_errors_csv, write_normalized_csv,
    write_summary_csv,
};
use shopwatch_storage::{
    check_and_update, diff_and_update, sha256_hex, ContentSource, Delivery, HttpClientConfig,
    HttpFetcher, Notifier, WebhookNotifier,
};
use tokio::fs;
use tracing::{info, instrument, warn};

pub const CRATE_NAME: &str = "shopwatch-sync";

/// Format of the timestamp embedded in value-change messages.
pub const CHECKED_AT_FORMAT: &str = "%Y-%m-%d %H:%M";

const FIRST_CHECK: &str = "(first check)";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub csv: CsvConfig,
    #[serde(default)]
    pub web: Option<PageWatchConfig>,
    #[serde(default, alias = "github")]
    pub value: Option<ValueWatchConfig>,
    #[serde(default, alias = "slack")]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsvConfig {
    pub input_dir: PathBuf,
    pub normalized_path: PathBuf,
    pub errors_path: PathBuf,
    pub summary_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageWatchConfig {
    pub url: String,
    pub snapshot_path: PathBuf,
    pub price_snapshot_path: PathBuf,
    #[serde(default = "default_max_diff_lines")]
    pub max_diff_lines: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValueWatchConfig {
    pub url: String,
    pub value_snapshot_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_post_timeout_secs")]
    pub post_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            post_timeout_secs: default_post_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
        }
    }
}

fn default_max_diff_lines() -> usize {
    40
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_post_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    "shopwatch/0.1".to_string()
}

fn default_top_n() -> usize {
    5
}

impl AppConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("config is empty or not a valid YAML mapping")
    }

    /// Reads the YAML config at `path` and applies `SHOPWATCH_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config =
            Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SHOPWATCH_WEBHOOK_URL") {
            self.notify.webhook_url = url;
        }
        if let Some(secs) = lookup("SHOPWATCH_FETCH_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http.fetch_timeout_secs = secs;
        }
    }
}

/// CSV files directly inside `dir` (`.csv` or `.CSV`), sorted by path.
pub fn list_csv_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading input dir {}", dir.display()))?;

    let mut files = BTreeSet::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        let path = entry.path();
        let is_csv = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("csv" | "CSV")
        );
        if is_csv && path.is_file() {
            files.insert(path);
        }
    }

    if files.is_empty() {
        bail!("no CSV files found in {}", dir.display());
    }
    Ok(files.into_iter().collect())
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub files: Vec<PathBuf>,
    pub records: Vec<NormalizedRecord>,
    pub errors: Vec<ErrorRecord>,
    pub summary: Vec<SummaryEntry>,
    pub errors_path: PathBuf,
}

impl IngestReport {
    pub fn counts_line(&self) -> String {
        format!(
            "files={} / normalized={} / errors={}",
            self.files.len(),
            self.records.len(),
            self.errors.len()
        )
    }
}

/// Normalizes every CSV in the input dir and writes normalized, error and summary outputs.
pub fn run_ingest(config: &CsvConfig) -> Result<IngestReport> {
    let files = list_csv_files(&config.input_dir)?;

    let mut records = Vec::new();
    let mut errors = Vec::new();
    for path in &files {
        let normalized = normalize_csv_file(path)?;
        if !normalized.errors.is_empty() {
            warn!(
                file = %path.display(),
                rejected = normalized.errors.len(),
                "rows rejected during normalization"
            );
        }
        records.extend(normalized.records);
        errors.extend(normalized.errors);
    }

    let summary = aggregate(&records);
    write_errors_csv(&errors, &config.errors_path)?;
    write_normalized_csv(&records, &config.normalized_path)?;
    write_summary_csv(&summary, &config.summary_path)?;

    info!(
        files = files.len(),
        normalized = records.len(),
        errors = errors.len(),
        "csv ingest complete"
    );

    Ok(IngestReport {
        files,
        records,
        errors,
        summary,
        errors_path: config.errors_path.clone(),
    })
}

/// Digits inside the first `id="price"` element, or an empty string.
pub fn extract_page_price(html: &str) -> String {
    let Ok(selector) = Selector::parse("#price") else {
        return String::new();
    };
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or_default()
}

/// ASCII form of an ASCII or full-width (`０`-`９`) decimal digit.
fn ascii_digit(c: char) -> Option<char> {
    match c {
        '0'..='9' => Some(c),
        '\u{FF10}'..='\u{FF19}' => char::from_u32(u32::from(c) - 0xFF10 + u32::from('0')),
        _ => None,
    }
}

/// Digits of the first `price = <digits>` pair in plain text, or an empty string.
///
/// Full-width digits are accepted and returned as ASCII.
pub fn extract_kv_price(text: &str) -> String {
    for (index, key) in text.match_indices("price") {
        let rest = text[index + key.len()..].trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let digits: String = rest
            .trim_start()
            .chars()
            .map_while(ascii_digit)
            .collect();
        if !digits.is_empty() {
            return digits;
        }
    }
    String::new()
}

/// `new - old` when both are integers and a previous value exists.
pub fn price_delta(old_value: &str, new_value: &str) -> Option<i64> {
    if old_value.is_empty() {
        return None;
    }
    let old: i64 = old_value.trim().parse().ok()?;
    let new: i64 = new_value.trim().parse().ok()?;
    new.checked_sub(old)
}

pub fn format_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

fn signed(delta: i64, grouped: bool) -> String {
    let body = if grouped {
        format_thousands(delta)
    } else {
        delta.to_string()
    };
    if delta >= 0 {
        format!("+{body}")
    } else {
        body
    }
}

fn or_first_check(value: &str) -> &str {
    if value.is_empty() {
        FIRST_CHECK
    } else {
        value
    }
}

/// Price extracted from a watched page changed.
pub fn compose_price_change_message(
    url: &str,
    old_price: &str,
    new_price: &str,
    summary_text: &str,
    ingest: &IngestReport,
) -> String {
    let delta = price_delta(old_price, new_price)
        .map(|d| format!(" ({})", signed(d, false)))
        .unwrap_or_default();
    format!(
        "Price changed\nURL: {url}\nOld price: {}\nNew price: {new_price}{delta}\n\n{summary_text}\n\nCSV ingest: {}\n(error details: {})",
        or_first_check(old_price),
        ingest.counts_line(),
        ingest.errors_path.display(),
    )
}

/// Watched page content changed without a price change.
pub fn compose_page_change_message(
    url: &str,
    diff_preview: &str,
    summary_text: &str,
    ingest: &IngestReport,
) -> String {
    let diff_block = if diff_preview.is_empty() {
        "(no diff)".to_string()
    } else {
        format!("```{diff_preview}```")
    };
    format!(
        "Web page changed\nURL: {url}\n\n{summary_text}\n\nCSV ingest: {}\n(error details: {})\n\nDiff preview (excerpt)\n{diff_block}",
        ingest.counts_line(),
        ingest.errors_path.display(),
    )
}

/// Key=value target changed; `checked_at` is supplied by the caller.
pub fn compose_value_change_message(
    url: &str,
    old_value: &str,
    new_value: &str,
    checked_at: NaiveDateTime,
    ingest: &IngestReport,
) -> String {
    let delta = price_delta(old_value, new_value)
        .map(|d| signed(d, true))
        .unwrap_or_else(|| "-".to_string());
    let new_display = new_value
        .parse::<i64>()
        .map(format_thousands)
        .unwrap_or_else(|_| new_value.to_string());
    format!(
        "[Price change detected]\n\nTarget\n{url}\n\nChange\nOld price: {}\nNew price: {new_display}\nDifference: {delta}\n\nChecked at\n{}\n\nCSV ingest\n- files: {}\n- normalized rows: {}\n- errors: {}",
        or_first_check(old_value),
        checked_at.format(CHECKED_AT_FORMAT),
        ingest.files.len(),
        ingest.records.len(),
        ingest.errors.len(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    NotNeeded,
    Sent,
    Skipped,
}

impl From<Delivery> for NotificationStatus {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Sent => NotificationStatus::Sent,
            Delivery::Skipped => NotificationStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub target: String,
    pub url: String,
    pub content_sha256: String,
    pub extracted_value: String,
    pub value_changed: bool,
    pub content_changed: bool,
    pub notification: NotificationStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub checked_at: String,
    pub files: usize,
    pub normalized: usize,
    pub errors: usize,
    pub targets: Vec<TargetOutcome>,
}

impl RunSummary {
    pub fn notifications_sent(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.notification == NotificationStatus::Sent)
            .count()
    }
}

pub struct SyncPipeline {
    config: AppConfig,
    source: Box<dyn ContentSource>,
    notifier: Box<dyn Notifier>,
}

impl SyncPipeline {
    pub fn new(config: AppConfig) -> Result<Self> {
        let user_agent = Some(config.http.user_agent.clone());
        let source = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http.fetch_timeout_secs),
            user_agent: user_agent.clone(),
        })?;
        let notifier = WebhookNotifier::new(
            &config.notify.webhook_url,
            HttpClientConfig {
                timeout: Duration::from_secs(config.http.post_timeout_secs),
                user_agent,
            },
        )?;
        Ok(Self {
            config,
            source: Box::new(source),
            notifier: Box::new(notifier),
        })
    }

    pub fn with_collaborators(
        mut self,
        source: Box<dyn ContentSource>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        self.source = source;
        self.notifier = notifier;
        self
    }

    /// Ingest, check every configured target in order, then write the optional run report.
    pub async fn run_once(&self, now: NaiveDateTime) -> Result<RunSummary> {
        let ingest = run_ingest(&self.config.csv)?;

        let mut targets = Vec::new();
        if let Some(page) = &self.config.web {
            targets.push(self.watch_page(page, &ingest).await?);
        }
        if let Some(value) = &self.config.value {
            targets.push(self.watch_value(value, &ingest, now).await?);
        }

        let summary = RunSummary {
            checked_at: now.format(CHECKED_AT_FORMAT).to_string(),
            files: ingest.files.len(),
            normalized: ingest.records.len(),
            errors: ingest.errors.len(),
            targets,
        };

        if let Some(report_path) = &self.config.report_path {
            write_run_report(report_path, &summary).await?;
        }
        Ok(summary)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        self.source
            .fetch_text(url)
            .await
            .with_context(|| format!("fetching {url}"))
    }

    async fn deliver(&self, text: &str) -> Result<NotificationStatus> {
        let delivery = self
            .notifier
            .notify(text)
            .await
            .context("delivering notification")?;
        Ok(delivery.into())
    }

    /// Price change wins over a plain content change so one run sends at most one message.
    #[instrument(skip_all, fields(url = %config.url))]
    pub async fn watch_page(
        &self,
        config: &PageWatchConfig,
        ingest: &IngestReport,
    ) -> Result<TargetOutcome> {
        let content = self.fetch(&config.url).await?;
        let price = extract_page_price(&content);
        let price_check = check_and_update(&price, &config.price_snapshot_path).await?;
        let diff = diff_and_update(&content, &config.snapshot_path, config.max_diff_lines).await?;

        let summary_text = render_summary(&ingest.summary, self.config.summary.top_n);
        let message = if price_check.changed && !price.is_empty() {
            Some(compose_price_change_message(
                &config.url,
                &price_check.old_value,
                &price,
                &summary_text,
                ingest,
            ))
        } else if diff.changed {
            Some(compose_page_change_message(
                &config.url,
                &diff.preview,
                &summary_text,
                ingest,
            ))
        } else {
            info!("no change detected; notification skipped");
            None
        };

        let notification = match message {
            Some(text) => self.deliver(&text).await?,
            None => NotificationStatus::NotNeeded,
        };

        Ok(TargetOutcome {
            target: "web".to_string(),
            url: config.url.clone(),
            content_sha256: sha256_hex(content.as_bytes()),
            extracted_value: price,
            value_changed: price_check.changed,
            content_changed: diff.changed,
            notification,
        })
    }

    #[instrument(skip_all, fields(url = %config.url))]
    pub async fn watch_value(
        &self,
        config: &ValueWatchConfig,
        ingest: &IngestReport,
        now: NaiveDateTime,
    ) -> Result<TargetOutcome> {
        let content = self.fetch(&config.url).await?;
        let value = extract_kv_price(&content);
        let check = check_and_update(&value, &config.value_snapshot_path).await?;

        let notification = if check.changed && !value.is_empty() {
            let text =
                compose_value_change_message(&config.url, &check.old_value, &value, now, ingest);
            self.deliver(&text).await?
        } else {
            info!(value = %value, "value unchanged; notification skipped");
            NotificationStatus::NotNeeded
        };

        Ok(TargetOutcome {
            target: "value".to_string(),
            url: config.url.clone(),
            content_sha256: sha256_hex(content.as_bytes()),
            extracted_value: value,
            value_changed: check.changed,
            content_changed: false,
            notification,
        })
    }
}

async fn write_run_report(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run report")?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}
