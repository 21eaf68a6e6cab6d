//! Per-category aggregation of normalized records.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use shopwatch_core::{NormalizedRecord, SummaryEntry};

use crate::create_csv_writer;

pub const SUMMARY_HEADER: [&str; 3] = ["category", "total_quantity", "total_value"];

/// Rendered instead of an empty block when there is nothing to summarize.
pub const NO_SUMMARY_DATA: &str = "(no summary data)";

/// One entry per distinct category, sorted by category ascending.
pub fn aggregate(records: &[NormalizedRecord]) -> Vec<SummaryEntry> {
    let mut totals: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
    for record in records {
        let (quantity, value) = totals.entry(record.category()).or_default();
        *quantity = quantity.saturating_add(record.quantity());
        *value = value.saturating_add(record.total_value());
    }

    totals
        .into_iter()
        .map(|(category, (total_quantity, total_value))| SummaryEntry {
            category: category.to_string(),
            total_quantity,
            total_value,
        })
        .collect()
}

/// Top `top_n` entries by descending total value; ties keep their input order.
pub fn render_summary(summary: &[SummaryEntry], top_n: usize) -> String {
    if summary.is_empty() {
        return NO_SUMMARY_DATA.to_string();
    }

    let mut ranked: Vec<&SummaryEntry> = summary.iter().collect();
    ranked.sort_by(|a, b| b.total_value.cmp(&a.total_value));

    let mut lines = vec![format!("Store summary (top {top_n})")];
    lines.extend(ranked.into_iter().take(top_n).map(|entry| {
        format!(
            "- {}: qty={}, amount={}",
            entry.category, entry.total_quantity, entry.total_value
        )
    }));
    lines.join("\n")
}

pub fn write_summary_csv(summary: &[SummaryEntry], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = create_csv_writer(path)?;
    writer
        .write_record(SUMMARY_HEADER)
        .with_context(|| format!("writing header to {}", path.display()))?;
    for entry in summary {
        writer
            .write_record([
                entry.category.clone(),
                entry.total_quantity.to_string(),
                entry.total_value.to_string(),
            ])
            .with_context(|| format!("writing summary row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))
}
