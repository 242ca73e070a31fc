// ⚖️ Reconciliation Engine - Sheet vs database diff by uuid
//
//   insert = source rows whose uuid is not stored
//   delete = stored rows whose uuid is not in the source
//
// Rows present on both sides are left alone, even if their amount or
// description changed: uuid equality is record equality here.

use crate::records::FinancialRecord;
use chrono::{Datelike, Local, Months, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationResult {
    pub to_insert: Vec<FinancialRecord>,
    pub to_delete: Vec<FinancialRecord>,
}

impl ReconciliationResult {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_delete.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} to insert, {} to delete",
            self.to_insert.len(),
            self.to_delete.len()
        )
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Diff two uuid-keyed collections.
///
/// Runs in O(|source| + |stored|) and cannot fail. Output order follows
/// hash map iteration and carries no meaning.
///
/// ```
/// use finance_sync::reconciliation::reconcile;
/// use std::collections::HashMap;
///
/// let result = reconcile(HashMap::new(), HashMap::new());
/// assert!(result.is_empty());
/// ```
pub fn reconcile(
    source: HashMap<String, FinancialRecord>,
    mut stored: HashMap<String, FinancialRecord>,
) -> ReconciliationResult {
    let mut to_insert = Vec::new();

    for (uuid, record) in source {
        // Whatever is matched here is neither inserted nor deleted
        if stored.remove(&uuid).is_none() {
            to_insert.push(record);
        }
    }

    ReconciliationResult {
        to_insert,
        to_delete: stored.into_values().collect(),
    }
}

// ============================================================================
// SYNC WINDOWS
// ============================================================================

/// A calendar month used to select stored rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MonthWindow {
    pub year: i32,
    pub month: u32,
}

impl MonthWindow {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(MonthWindow { year, month })
        } else {
            None
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        MonthWindow {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn current() -> Self {
        Self::from_date(Local::now().date_naive())
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    /// "YYYY-MM"
    pub fn period(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// LIKE pattern for ISO date-time strings: "YYYY-MM%"
    pub fn date_pattern(&self) -> String {
        format!("{}%", self.period())
    }

    /// LIKE pattern for legacy "D/M/YYYY ..." strings: "%/M/YYYY%"
    pub fn legacy_pattern(&self) -> String {
        let month = format!("{:02}", self.month);
        format!("%/{}/{:04}%", legacy_month_token(&month), self.year)
    }

    /// This month followed by the `count` months before it, `count` capped
    /// at `MAX_MONTHS_BACK`
    pub fn with_previous(&self, count: u32) -> Vec<MonthWindow> {
        let Some(first) = self.first_day() else {
            return vec![*self];
        };

        (0..=count.min(MAX_MONTHS_BACK))
            .filter_map(|i| first.checked_sub_months(Months::new(i)))
            .map(MonthWindow::from_date)
            .collect()
    }
}

/// Furthest a card view may look back, in months
pub const MAX_MONTHS_BACK: u32 = 120;

/// Legacy rows wrote the month without zero padding: "07" → "7", "11" → "11"
pub fn legacy_month_token(month: &str) -> String {
    match month.strip_prefix('0') {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => month.to_string(),
    }
}

/// Which stored rows a sync compares the sheet against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Only rows of one month, matched under both date-string formats
    Incremental(MonthWindow),
    /// The whole table
    Historical,
}

impl SyncMode {
    pub fn label(&self) -> &'static str {
        match self {
            SyncMode::Incremental(_) => "incremental",
            SyncMode::Historical => "historical",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
