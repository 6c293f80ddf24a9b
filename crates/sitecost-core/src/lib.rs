//! Core domain model, scope resolution, and aggregation for sitecost.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sitecost-core";

/// One ledger entry for a construction project.
///
/// Field names track the remote document shape (camelCase) so a document
/// deserializes directly into this struct before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseRecord {
    pub id: String,
    pub project_id: String,
    /// Six-digit year+month the record is filed under.
    #[serde(rename = "yyyyMM")]
    pub yyyy_mm: String,
    pub category: String,
    pub sub_category: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub payee: Option<String>,
    #[serde(default)]
    pub mode_of_payment: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_paid: Option<DateTime<Utc>>,
    pub amount: f64,
    #[serde(default)]
    pub paid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RecordParseError {
    #[error("document does not match the expense shape: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("missing or empty required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid amount {0}")]
    InvalidAmount(f64),
    #[error("cannot derive a yyyyMM month for record `{0}`")]
    MissingMonth(String),
}

impl ExpenseRecord {
    /// Parse and validate one remote document.
    ///
    /// `fallback_yyyy_mm` fills the month when the document carries neither a
    /// payment date, an invoice date, nor its own `yyyyMM`.
    pub fn from_document(
        value: &serde_json::Value,
        fallback_yyyy_mm: &str,
    ) -> Result<Self, RecordParseError> {
        let mut record: ExpenseRecord = serde_json::from_value(value.clone())?;

        if record.id.trim().is_empty() {
            return Err(RecordParseError::MissingField("id"));
        }
        if record.project_id.trim().is_empty() {
            return Err(RecordParseError::MissingField("projectId"));
        }
        if record.category.trim().is_empty() {
            return Err(RecordParseError::MissingField("category"));
        }
        if record.sub_category.trim().is_empty() {
            return Err(RecordParseError::MissingField("subCategory"));
        }
        if !record.amount.is_finite() || record.amount < 0.0 {
            return Err(RecordParseError::InvalidAmount(record.amount));
        }

        let derived = record
            .date_paid
            .or(record.invoice_date)
            .map(|ts| ts.format("%Y%m").to_string());
        if let Some(yyyy_mm) = derived {
            record.yyyy_mm = yyyy_mm;
        } else if !is_yyyy_mm(&record.yyyy_mm) {
            record.yyyy_mm = fallback_yyyy_mm.to_string();
        }
        if !is_yyyy_mm(&record.yyyy_mm) {
            return Err(RecordParseError::MissingMonth(record.id.clone()));
        }

        Ok(record)
    }

    /// Effective payment timestamp: `datePaid`, else `invoiceDate`, else a
    /// synthesized mid-month timestamp from `yyyyMM`.
    pub fn effective_paid_at(&self) -> DateTime<Utc> {
        self.date_paid
            .or(self.invoice_date)
            .or_else(|| mid_month_timestamp(&self.yyyy_mm))
            .unwrap_or(self.created_at)
    }
}

/// 15th of the month at 00:00 UTC, or `None` when `yyyy_mm` is malformed.
pub fn mid_month_timestamp(yyyy_mm: &str) -> Option<DateTime<Utc>> {
    if !is_yyyy_mm(yyyy_mm) {
        return None;
    }
    let year: i32 = yyyy_mm[..4].parse().ok()?;
    let month: u32 = yyyy_mm[4..].parse().ok()?;
    Utc.with_ymd_and_hms(year, month, 15, 0, 0, 0).single()
}

fn is_yyyy_mm(s: &str) -> bool {
    s.len() == 6
        && s.bytes().all(|b| b.is_ascii_digit())
        && matches!(s[4..].parse::<u32>(), Ok(1..=12))
}

/// Sort by effective payment timestamp ascending, ties broken by creation
/// timestamp ascending. Idempotent: re-sorting a sorted slice is a no-op.
pub fn sort_by_payment_date(records: &mut [ExpenseRecord]) {
    records.sort_by(|a, b| {
        a.effective_paid_at()
            .cmp(&b.effective_paid_at())
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// A learned mapping from a free-text description to a classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: String,
    pub name: String,
    /// Normalized lookup key; unique within a coherent dictionary.
    pub name_lower: String,
    pub category: String,
    pub sub_category: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ItemRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: impl Into<String>,
        sub_category: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let name_lower = name.trim().to_lowercase();
        let keywords: Vec<String> = name_lower
            .split_whitespace()
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self {
            id: id.into(),
            name,
            name_lower,
            category: category.into(),
            sub_category: sub_category.into(),
            keywords,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }
}

/// Canonical coordinate identifying which slice of records a reader wants.
/// Absent parts are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scope {
    pub client_id: String,
    pub project_id: String,
    pub year: String,
    pub month: String,
    pub yyyy_mm: String,
}

/// Caller-supplied scope identifier: a bare project id or structured parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeInput {
    Project(String),
    Parts {
        client_id: Option<String>,
        project_id: Option<String>,
        year: Option<String>,
        month: Option<String>,
        yyyy_mm: Option<String>,
    },
}

impl From<&str> for ScopeInput {
    fn from(project_id: &str) -> Self {
        ScopeInput::Project(project_id.to_string())
    }
}

impl From<String> for ScopeInput {
    fn from(project_id: String) -> Self {
        ScopeInput::Project(project_id)
    }
}

impl Scope {
    /// Resolve any caller-supplied identifier into the canonical scope.
    ///
    /// Total: malformed parts normalize to the empty string, never an error.
    /// An explicit six-digit `yyyy_mm` wins; otherwise a four-digit year and
    /// a 1-12 month concatenate (month zero-padded); otherwise `yyyy_mm`
    /// stays empty and month-scoped reads are skipped.
    pub fn resolve(input: impl Into<ScopeInput>) -> Scope {
        match input.into() {
            ScopeInput::Project(project_id) => Scope {
                project_id: project_id.trim().to_string(),
                ..Scope::default()
            },
            ScopeInput::Parts {
                client_id,
                project_id,
                year,
                month,
                yyyy_mm,
            } => {
                let client_id = trimmed(client_id);
                let project_id = trimmed(project_id);
                let year = normalize_year(&trimmed(year));
                let month = normalize_month(&trimmed(month));
                let explicit = trimmed(yyyy_mm);
                let yyyy_mm = if is_yyyy_mm(&explicit) {
                    explicit
                } else if !year.is_empty() && !month.is_empty() {
                    format!("{year}{month}")
                } else {
                    String::new()
                };
                Scope {
                    client_id,
                    project_id,
                    year,
                    month,
                    yyyy_mm,
                }
            }
        }
    }

    pub fn has_project(&self) -> bool {
        !self.project_id.is_empty()
    }

    pub fn has_month(&self) -> bool {
        !self.yyyy_mm.is_empty()
    }
}

fn trimmed(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

fn normalize_year(raw: &str) -> String {
    if raw.len() == 4 && raw.bytes().all(|b| b.is_ascii_digit()) {
        raw.to_string()
    } else {
        String::new()
    }
}

fn normalize_month(raw: &str) -> String {
    match raw.parse::<u32>() {
        Ok(m @ 1..=12) => format!("{m:02}"),
        _ => String::new(),
    }
}

/// Per-month rollup for one calendar year.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthSummary {
    pub yyyy_mm: String,
    /// Category totals, iterated in sorted category order.
    pub by_category: BTreeMap<String, f64>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyBreakdown {
    pub year: i32,
    /// Exactly twelve entries, January through December.
    pub months: Vec<MonthSummary>,
    pub grand_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTotal {
    pub category: String,
    pub sub_category: String,
    pub total: f64,
}

/// Pick the year to aggregate: the requested year when it has data, else the
/// most recent year that does. A caller is never shown an artificially empty
/// view while data exists elsewhere.
pub fn resolve_year(records: &[ExpenseRecord], requested: i32) -> Option<i32> {
    let years: BTreeSet<i32> = records
        .iter()
        .map(|r| r.effective_paid_at().year())
        .collect();
    if years.contains(&requested) {
        Some(requested)
    } else {
        years.into_iter().next_back()
    }
}

/// Month-by-month category table for the resolved year. All twelve months
/// are present even at zero activity. `None` only when `records` is empty.
pub fn monthly_breakdown(records: &[ExpenseRecord], requested: i32) -> Option<MonthlyBreakdown> {
    let year = resolve_year(records, requested)?;
    let mut months: Vec<MonthSummary> = (1..=12)
        .map(|m| MonthSummary {
            yyyy_mm: format!("{year}{m:02}"),
            by_category: BTreeMap::new(),
            total: 0.0,
        })
        .collect();

    let mut grand_total = 0.0;
    for record in records {
        let paid_at = record.effective_paid_at();
        if paid_at.year() != year {
            continue;
        }
        let summary = &mut months[paid_at.month0() as usize];
        *summary.by_category.entry(record.category.clone()).or_insert(0.0) += record.amount;
        summary.total += record.amount;
        grand_total += record.amount;
    }

    Some(MonthlyBreakdown {
        year,
        months,
        grand_total,
    })
}

/// Totals grouped by `(category, subCategory)`, sorted by total descending
/// with ties broken by category then sub-category name.
pub fn category_breakdown(records: &[ExpenseRecord]) -> Vec<CategoryTotal> {
    let mut totals: BTreeMap<(String, String), f64> = BTreeMap::new();
    for record in records {
        *totals
            .entry((record.category.clone(), record.sub_category.clone()))
            .or_insert(0.0) += record.amount;
    }

    let mut out: Vec<CategoryTotal> = totals
        .into_iter()
        .map(|((category, sub_category), total)| CategoryTotal {
            category,
            sub_category,
            total,
        })
        .collect();
    out.sort_by(|a, b| {
        b.total
            .total_cmp(&a.total)
            .then_with(|| a.category.cmp(&b.category))
            .then_with(|| a.sub_category.cmp(&b.sub_category))
    });
    out
}
