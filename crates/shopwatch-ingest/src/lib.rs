//! Tolerant CSV ingestion: alias-based field resolution, value parsing and row normalization.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use shopwatch_core::{CanonicalField, ErrorRecord, NormalizedRecord, ReasonCode, RowOutcome};
use tracing::{debug, info_span};

mod summary;

pub use summary::{aggregate, render_summary, write_summary_csv, NO_SUMMARY_DATA, SUMMARY_HEADER};

pub const CRATE_NAME: &str = "shopwatch-ingest";

/// One input row keyed by whatever column names the vendor export used.
pub type RawRecord = HashMap<String, String>;

/// Accepted raw column names per canonical field, in precedence order.
pub const FIELD_ALIASES: [(CanonicalField, &[&str]); 5] = [
    (CanonicalField::Date, &["date", "日付"]),
    (
        CanonicalField::Category,
        &["store", "店舗", "店舗名", "shop", "category"],
    ),
    (CanonicalField::Label, &["product", "商品", "商品名", "label"]),
    (CanonicalField::Quantity, &["qty", "数量", "個数", "quantity"]),
    (
        CanonicalField::UnitValue,
        &["price", "単価", "金額", "価格", "unit_value"],
    ),
];

const DATE_PATTERNS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

pub const NORMALIZED_HEADER: [&str; 6] = [
    "date",
    "category",
    "label",
    "quantity",
    "unit_value",
    "total_value",
];

pub const ERRORS_HEADER: [&str; 8] = [
    "source_file",
    "source_line",
    "reasons",
    "raw_date",
    "raw_category",
    "raw_label",
    "raw_quantity",
    "raw_unit_value",
];

pub fn aliases_for(field: CanonicalField) -> &'static [&'static str] {
    FIELD_ALIASES
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, aliases)| *aliases)
        .unwrap_or(&[])
}

/// First value whose key matches a candidate, trying candidates in order.
///
/// An empty value still counts as present; `None` means no candidate key exists at all.
pub fn resolve<'a>(record: &'a RawRecord, candidate_names: &[&str]) -> Option<&'a str> {
    candidate_names
        .iter()
        .find_map(|name| record.get(*name).map(String::as_str))
}

fn resolve_field(record: &RawRecord, field: CanonicalField) -> &str {
    resolve(record, aliases_for(field)).unwrap_or_default()
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    // chrono's %Y takes any digit count and a sign; only a four-digit year is valid here.
    let four_digit_year = text
        .get(..4)
        .is_some_and(|year| year.bytes().all(|b| b.is_ascii_digit()))
        && matches!(text.as_bytes().get(4), Some(b'-' | b'/'));
    if !four_digit_year {
        return None;
    }
    DATE_PATTERNS
        .iter()
        .find_map(|pattern| NaiveDate::parse_from_str(text, pattern).ok())
}

/// Parses integer or decimal text, truncating any fractional part toward zero.
pub fn parse_integer(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    let value = text.parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    let truncated = value.trunc();
    // 2^63 is exactly representable; anything at or beyond it does not fit.
    if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return None;
    }
    Some(truncated as i64)
}

pub fn normalize_category(text: &str) -> String {
    text.trim().to_lowercase().replace(' ', "_")
}

/// Validates every canonical field of `raw` and produces either a record or a full diagnostic.
///
/// `source_line` is 1-based with the header on line 1. The returned error record has an
/// empty `source_file`; file-level callers attach it.
pub fn normalize_row(raw: &RawRecord, source_line: u64) -> RowOutcome {
    let raw_date = resolve_field(raw, CanonicalField::Date).trim();
    let raw_category = resolve_field(raw, CanonicalField::Category).trim();
    let raw_label = resolve_field(raw, CanonicalField::Label).trim();
    let raw_quantity = resolve_field(raw, CanonicalField::Quantity).trim();
    let raw_unit_value = resolve_field(raw, CanonicalField::UnitValue).trim();

    let date = parse_date(raw_date);
    let category = normalize_category(raw_category);
    let quantity = parse_integer(raw_quantity);
    let unit_value = parse_integer(raw_unit_value);

    let mut reasons = Vec::new();
    if date.is_none() {
        reasons.push(CanonicalField::Date.failure_reason());
    }
    if category.is_empty() {
        reasons.push(CanonicalField::Category.failure_reason());
    }
    if raw_label.is_empty() {
        reasons.push(CanonicalField::Label.failure_reason());
    }
    if quantity.is_none() {
        reasons.push(CanonicalField::Quantity.failure_reason());
    }
    if unit_value.is_none() {
        reasons.push(CanonicalField::UnitValue.failure_reason());
    }

    if let (true, Some(date), Some(quantity), Some(unit_value)) =
        (reasons.is_empty(), date, quantity, unit_value)
    {
        match NormalizedRecord::new(date, category, raw_label, quantity, unit_value) {
            Some(record) => return RowOutcome::Valid(record),
            None => reasons.push(ReasonCode::TotalOverflow),
        }
    }

    RowOutcome::Invalid(ErrorRecord {
        source_file: String::new(),
        source_line,
        reasons,
        raw_date: raw_date.to_string(),
        raw_category: raw_category.to_string(),
        raw_label: raw_label.to_string(),
        raw_quantity: raw_quantity.to_string(),
        raw_unit_value: raw_unit_value.to_string(),
    })
}

/// Normalization result for one input file, each list in source row order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFile {
    pub source_file: String,
    pub records: Vec<NormalizedRecord>,
    pub errors: Vec<ErrorRecord>,
}

/// Normalizes CSV text with a header row. Only malformed CSV or I/O problems are errors.
pub fn normalize_reader<R: Read>(reader: R, source_file: &str) -> Result<NormalizedFile> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = csv_reader
        .headers()
        .with_context(|| format!("reading CSV header of {source_file}"))?
        .clone();

    let mut out = NormalizedFile {
        source_file: source_file.to_string(),
        ..Default::default()
    };

    for (index, result) in csv_reader.records().enumerate() {
        let source_line = index as u64 + 2;
        let row = result
            .with_context(|| format!("reading CSV record {source_line} of {source_file}"))?;
        let raw: RawRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        match normalize_row(&raw, source_line) {
            RowOutcome::Valid(record) => out.records.push(record),
            RowOutcome::Invalid(error) => {
                debug!(source_file, source_line, reasons = %error.joined_reasons(), "rejected row");
                out.errors.push(error.with_source_file(source_file));
            }
        }
    }

    Ok(out)
}

/// Normalizes a CSV file; error records are tagged with the file's base name.
pub fn normalize_csv_file(path: impl AsRef<Path>) -> Result<NormalizedFile> {
    let path = path.as_ref();
    let source_file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let span = info_span!("normalize_csv", file = %path.display());
    let _guard = span.enter();

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    normalize_reader(file, &source_file)
}

pub(crate) fn create_csv_writer(path: &Path) -> Result<csv::Writer<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }
    csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))
}

pub fn write_normalized_csv(records: &[NormalizedRecord], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = create_csv_writer(path)?;
    writer
        .write_record(NORMALIZED_HEADER)
        .with_context(|| format!("writing header to {}", path.display()))?;
    for record in records {
        writer
            .write_record([
                record.date_string(),
                record.category().to_string(),
                record.label().to_string(),
                record.quantity().to_string(),
                record.unit_value().to_string(),
                record.total_value().to_string(),
            ])
            .with_context(|| format!("writing record to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))
}

pub fn write_errors_csv(errors: &[ErrorRecord], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = create_csv_writer(path)?;
    writer
        .write_record(ERRORS_HEADER)
        .with_context(|| format!("writing header to {}", path.display()))?;
    for error in errors {
        writer
            .write_record([
                error.source_file.clone(),
                error.source_line.to_string(),
                error.joined_reasons(),
                error.raw_date.clone(),
                error.raw_category.clone(),
                error.raw_label.clone(),
                error.raw_quantity.clone(),
                error.raw_unit_value.clone(),
            ])
            .with_context(|| format!("writing error record to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))
}
