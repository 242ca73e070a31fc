// Record Identity Mapper
// Sheet rows and stored rows become FinancialRecords keyed by uuid.

use crate::normalize::{parse_amount, parse_sheet_date_time, AmountStyle};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Expense or income; decides the table and the kind-specific column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Expense,
    Income,
}

impl RecordKind {
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Expense => "expenses",
            RecordKind::Income => "incomes",
        }
    }

    /// Name of the column holding `category` (expenses) or `currency` (incomes)
    pub fn label_column(&self) -> &'static str {
        match self {
            RecordKind::Expense => "category",
            RecordKind::Income => "currency",
        }
    }

    /// Fixed column order of this kind's sheet
    pub fn sheet_columns(&self) -> SheetColumns {
        match self {
            RecordKind::Expense => SheetColumns {
                date_time: 0,
                amount: 1,
                description: 2,
                label: 3,
                uuid: 4,
            },
            RecordKind::Income => SheetColumns {
                date_time: 0,
                amount: 1,
                label: 2,
                description: 3,
                uuid: 4,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetColumns {
    pub date_time: usize,
    pub amount: usize,
    pub description: usize,
    pub label: usize,
    pub uuid: usize,
}

impl SheetColumns {
    fn width(&self) -> usize {
        [self.date_time, self.amount, self.description, self.label, self.uuid]
            .into_iter()
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// An expense or income row.
///
/// `uuid` is the identity shared by sheet and storage. `id` only exists once
/// the row is stored and is what deletions target. `date_time` is the raw
/// string the sheet wrote; `occurred_at` is its parsed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub uuid: String,
    pub date_time: String,
    pub occurred_at: Option<NaiveDateTime>,
    pub description: String,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl FinancialRecord {
    /// Kind-specific label: category for expenses, currency for incomes
    pub fn label(&self, kind: RecordKind) -> Option<&str> {
        match kind {
            RecordKind::Expense => self.category.as_deref(),
            RecordKind::Income => self.currency.as_deref(),
        }
    }
}

/// One row as delivered by a spreadsheet source, cells rendered as text
pub type SheetRow = Vec<String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("row has {found} columns, expected at least {expected}")]
    TooShort { found: usize, expected: usize },

    #[error("row has no uuid")]
    MissingUuid,

    #[error("unparsable date {0:?}")]
    BadDate(String),
}

/// A sheet row that did not make it into the keyed map
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub row: usize,
    pub reason: String,
}

/// Result of mapping a whole sheet
#[derive(Debug, Default)]
pub struct KeyedRecords {
    pub records: HashMap<String, FinancialRecord>,
    pub skipped: Vec<SkippedRow>,
}

// ============================================================================
// MAPPING
// ============================================================================

/// Build a record from one positional sheet row
pub fn record_from_sheet_row(kind: RecordKind, row: &[String]) -> Result<FinancialRecord, RowError> {
    let cols = kind.sheet_columns();
    if row.len() < cols.width() {
        return Err(RowError::TooShort {
            found: row.len(),
            expected: cols.width(),
        });
    }

    let uuid = row[cols.uuid].trim().to_string();
    if uuid.is_empty() {
        return Err(RowError::MissingUuid);
    }

    let date_time = row[cols.date_time].trim().to_string();
    let occurred_at =
        parse_sheet_date_time(&date_time).map_err(|_| RowError::BadDate(date_time.clone()))?;

    let label = row[cols.label].trim().to_string();
    let (category, currency) = match kind {
        RecordKind::Expense => (Some(label), None),
        RecordKind::Income => (None, Some(label)),
    };

    Ok(FinancialRecord {
        id: None,
        uuid,
        date_time,
        occurred_at: Some(occurred_at),
        description: row[cols.description].trim().to_string(),
        amount: parse_amount(&row[cols.amount], AmountStyle::Sheet),
        category,
        currency,
    })
}

/// Map sheet rows by uuid.
///
/// Row 0 is the header and is always skipped. Rows that fail to map are
/// logged and reported in `skipped`; the rest of the sheet still maps.
/// A uuid seen twice keeps the later row.
pub fn sheet_rows_to_map(kind: RecordKind, rows: &[SheetRow]) -> KeyedRecords {
    let mut keyed = KeyedRecords::default();

    for (index, row) in rows.iter().enumerate().skip(1) {
        match record_from_sheet_row(kind, row) {
            Ok(record) => {
                keyed.records.insert(record.uuid.clone(), record);
            }
            Err(e) => {
                warn!(table = kind.table(), row = index, error = %e, "skipping sheet row");
                keyed.skipped.push(SkippedRow {
                    row: index,
                    reason: e.to_string(),
                });
            }
        }
    }

    keyed
}

/// Key already-built records by uuid; later occurrences win
pub fn to_keyed_map<I>(records: I) -> HashMap<String, FinancialRecord>
where
    I: IntoIterator<Item = FinancialRecord>,
{
    records
        .into_iter()
        .map(|record| (record.uuid.clone(), record))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
