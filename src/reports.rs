// 📊 Reports - month views over expenses and incomes, and the balance
//
// Sums are computed in Rust over Decimal; SQLite only selects rows.

use crate::cards::month_card_totals;
use crate::db::{decimal_column, query_records};
use crate::error::StoreError;
use crate::normalize::{display_date_time, AmountFormatter};
use crate::reconciliation::MonthWindow;
use crate::records::{FinancialRecord, RecordKind};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

// ============================================================================
// VIEWS
// ============================================================================

/// A stored record as shown by the API
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    #[serde(flatten)]
    pub record: FinancialRecord,
    pub formatted_amount: String,
}

impl RecordView {
    fn new(mut record: FinancialRecord, formatter: &dyn AmountFormatter) -> Self {
        record.date_time = display_date_time(&record.date_time);
        let formatted_amount = formatter.format_amount(record.amount);
        RecordView {
            record,
            formatted_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryTotal {
    pub category: String,
    pub total: Decimal,
    pub formatted_total: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpenseSummary {
    pub total: Decimal,
    pub formatted_total: String,
    pub period: String,
    pub categories_summary: Vec<CategoryTotal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncomeList {
    pub income_total: Decimal,
    pub income_total_formatted: String,
    pub incomes_details: Vec<RecordView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub balance: Decimal,
    pub formatted_balance: String,
    pub total_expenses: Decimal,
    pub formatted_expenses: String,
    pub total_incomes: Decimal,
    pub formatted_incomes: String,
    pub monthly_income: Decimal,
    pub formatted_monthly_income: String,
    pub monthly_expenses: Decimal,
    pub formatted_monthly_expenses: String,
    pub monthly_cards_local: Decimal,
    pub formatted_monthly_cards_local: String,
    pub monthly_cards_foreign: Decimal,
    pub formatted_monthly_cards_foreign: String,
}

/// `?exclude=[Rent, Other]` → ["Rent", "Other"]; brackets optional, blanks dropped
pub fn parse_exclude(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

// ============================================================================
// EXPENSES
// ============================================================================

/// Expenses whose parsed date falls in `month`, newest first
pub fn month_expenses(conn: &Connection, month: MonthWindow) -> Result<Vec<FinancialRecord>, StoreError> {
    query_records(
        conn,
        RecordKind::Expense,
        "WHERE substr(date, 1, 7) = ?1 ORDER BY date DESC, id DESC",
        params![month.period()],
    )
}

fn is_excluded(record: &FinancialRecord, exclude: &[String]) -> bool {
    let category = record.category.as_deref().unwrap_or_default();
    exclude.iter().any(|e| e == category)
}

pub fn list_expenses(
    conn: &Connection,
    month: MonthWindow,
    exclude: &[String],
    formatter: &dyn AmountFormatter,
) -> Result<Vec<RecordView>, StoreError> {
    Ok(month_expenses(conn, month)?
        .into_iter()
        .filter(|r| !is_excluded(r, exclude))
        .map(|r| RecordView::new(r, formatter))
        .collect())
}

/// Per-category totals (alphabetical) and their grand total
pub fn expense_summary(
    conn: &Connection,
    month: MonthWindow,
    exclude: &[String],
    formatter: &dyn AmountFormatter,
) -> Result<ExpenseSummary, StoreError> {
    let mut by_category: BTreeMap<String, Decimal> = BTreeMap::new();

    for record in month_expenses(conn, month)? {
        if is_excluded(&record, exclude) {
            continue;
        }
        *by_category
            .entry(record.category.unwrap_or_default())
            .or_insert(Decimal::ZERO) += record.amount;
    }

    let total: Decimal = by_category.values().copied().sum();
    let categories_summary = by_category
        .into_iter()
        .map(|(category, total)| CategoryTotal {
            category,
            formatted_total: formatter.format_amount(total),
            total,
        })
        .collect();

    Ok(ExpenseSummary {
        total,
        formatted_total: formatter.format_amount(total),
        period: month.period(),
        categories_summary,
    })
}

// ============================================================================
// INCOMES
// ============================================================================

/// Incomes in the dual-pattern month window, newest id first
pub fn month_incomes(conn: &Connection, month: MonthWindow) -> Result<Vec<FinancialRecord>, StoreError> {
    query_records(
        conn,
        RecordKind::Income,
        "WHERE date_time LIKE ?1 OR date_time LIKE ?2 ORDER BY id DESC",
        params![month.date_pattern(), month.legacy_pattern()],
    )
}

pub fn list_incomes(
    conn: &Connection,
    month: MonthWindow,
    formatter: &dyn AmountFormatter,
) -> Result<IncomeList, StoreError> {
    let incomes = month_incomes(conn, month)?;
    let total: Decimal = incomes.iter().map(|r| r.amount).sum();

    Ok(IncomeList {
        income_total: total,
        income_total_formatted: formatter.format_amount(total),
        incomes_details: incomes
            .into_iter()
            .map(|r| RecordView::new(r, formatter))
            .collect(),
    })
}

// ============================================================================
// BALANCE
// ============================================================================

fn table_total(conn: &Connection, kind: RecordKind) -> Result<Decimal, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT amount FROM {}", kind.table()))?;
    let amounts = stmt
        .query_map([], |row| decimal_column(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(amounts.into_iter().sum())
}

/// All-time incomes minus all-time expenses, plus the figures for `month`
pub fn balance(
    transactions: &Connection,
    cards: &Connection,
    month: MonthWindow,
    formatter: &dyn AmountFormatter,
) -> Result<Balance, StoreError> {
    let total_expenses = table_total(transactions, RecordKind::Expense)?;
    let total_incomes = table_total(transactions, RecordKind::Income)?;
    let monthly_expenses: Decimal = month_expenses(transactions, month)?
        .iter()
        .map(|r| r.amount)
        .sum();
    let monthly_income: Decimal = month_incomes(transactions, month)?
        .iter()
        .map(|r| r.amount)
        .sum();
    let cards_total = month_card_totals(cards, month)?;
    let balance = total_incomes - total_expenses;

    Ok(Balance {
        balance,
        formatted_balance: formatter.format_amount(balance),
        total_expenses,
        formatted_expenses: formatter.format_amount(total_expenses),
        total_incomes,
        formatted_incomes: formatter.format_amount(total_incomes),
        monthly_income,
        formatted_monthly_income: formatter.format_amount(monthly_income),
        monthly_expenses,
        formatted_monthly_expenses: formatter.format_amount(monthly_expenses),
        monthly_cards_local: cards_total.local,
        formatted_monthly_cards_local: formatter.format_amount(cards_total.local),
        monthly_cards_foreign: cards_total.foreign,
        formatted_monthly_cards_foreign: formatter.format_amount(cards_total.foreign),
    })
}
