//! Core domain model for shopwatch: canonical sales records, row diagnostics and summaries.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "shopwatch-core";

/// Canonical output format for [`NormalizedRecord::date`].
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// One of the five attributes every normalized sales row must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Date,
    Category,
    Label,
    Quantity,
    UnitValue,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 5] = [
        CanonicalField::Date,
        CanonicalField::Category,
        CanonicalField::Label,
        CanonicalField::Quantity,
        CanonicalField::UnitValue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::Date => "date",
            CanonicalField::Category => "category",
            CanonicalField::Label => "label",
            CanonicalField::Quantity => "quantity",
            CanonicalField::UnitValue => "unit_value",
        }
    }

    /// Reason-code reported when this field fails to resolve or parse.
    pub fn failure_reason(self) -> ReasonCode {
        match self {
            CanonicalField::Date => ReasonCode::InvalidDate,
            CanonicalField::Category => ReasonCode::EmptyCategory,
            CanonicalField::Label => ReasonCode::EmptyLabel,
            CanonicalField::Quantity => ReasonCode::InvalidQuantity,
            CanonicalField::UnitValue => ReasonCode::InvalidUnitValue,
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable token naming a single row validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InvalidDate,
    EmptyCategory,
    EmptyLabel,
    InvalidQuantity,
    InvalidUnitValue,
    TotalOverflow,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::InvalidDate => "invalid_date",
            ReasonCode::EmptyCategory => "empty_category",
            ReasonCode::EmptyLabel => "empty_label",
            ReasonCode::InvalidQuantity => "invalid_quantity",
            ReasonCode::InvalidUnitValue => "invalid_unit_value",
            ReasonCode::TotalOverflow => "total_overflow",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully validated sales row. Only constructible with every field present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    date: NaiveDate,
    category: String,
    label: String,
    quantity: i64,
    unit_value: i64,
    total_value: i64,
}

impl NormalizedRecord {
    /// Returns `None` when `quantity * unit_value` does not fit in an `i64`.
    pub fn new(
        date: NaiveDate,
        category: impl Into<String>,
        label: impl Into<String>,
        quantity: i64,
        unit_value: i64,
    ) -> Option<Self> {
        let total_value = quantity.checked_mul(unit_value)?;
        Some(Self {
            date,
            category: category.into(),
            label: label.into(),
            quantity,
            unit_value,
            total_value,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// `YYYY-MM-DD`.
    pub fn date_string(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn unit_value(&self) -> i64 {
        self.unit_value
    }

    pub fn total_value(&self) -> i64 {
        self.total_value
    }
}

/// Diagnostic for a rejected input row, keeping the original (trimmed) text of every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub source_file: String,
    pub source_line: u64,
    pub reasons: Vec<ReasonCode>,
    pub raw_date: String,
    pub raw_category: String,
    pub raw_label: String,
    pub raw_quantity: String,
    pub raw_unit_value: String,
}

impl ErrorRecord {
    /// Reason-codes joined with `|` for the error report.
    pub fn joined_reasons(&self) -> String {
        self.reasons
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn with_source_file(mut self, source_file: impl Into<String>) -> Self {
        self.source_file = source_file.into();
        self
    }
}

/// Result of normalizing one raw row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Valid(NormalizedRecord),
    Invalid(ErrorRecord),
}

/// Per-category totals derived from normalized records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub category: String,
    pub total_quantity: i64,
    pub total_value: i64,
}
