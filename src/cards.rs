// 💳 Card Statements - persistence and month views
//
// resumes (1) ──< holders (N) ──< holder_expenses (N, ordered by position)
//
// Statements are written once per ingestion and never updated.

use crate::db::decimal_column;
use crate::error::StoreError;
use crate::normalize::AmountFormatter;
use crate::parser::{ParsedStatement, Totals};
use crate::reconciliation::MonthWindow;
use chrono::NaiveDate;
use regex::Regex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

/// keyword (lowercase) → label, iterated in sorted keyword order
pub type KeywordMap = BTreeMap<String, String>;

/// label → logo file name
pub type LogoMap = HashMap<String, String>;

pub const DEFAULT_LOGO: &str = "default.png";

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardNetwork {
    Visa,
    Mastercard,
}

impl CardNetwork {
    pub const ALL: [CardNetwork; 2] = [CardNetwork::Visa, CardNetwork::Mastercard];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardNetwork::Visa => "visa",
            CardNetwork::Mastercard => "mastercard",
        }
    }
}

impl fmt::Display for CardNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "visa" => Ok(CardNetwork::Visa),
            "mastercard" => Ok(CardNetwork::Mastercard),
            other => Err(format!("unknown card network: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderExpense {
    pub position: u32,
    pub date: String,
    pub description: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Holder {
    pub holder: String,
    pub totals: Totals,
    pub expenses: Vec<HolderExpense>,
}

/// One ingested statement ("resume"), identified by the hash of the raw
/// extraction response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardStatement {
    pub document_number: String,
    pub card_network: CardNetwork,
    pub statement_date: NaiveDate,
    pub totals: Totals,
    pub holders: Vec<Holder>,
}

impl CardStatement {
    /// Positions are 1-based per holder, in the order the service listed them
    pub fn from_parsed(
        document_number: String,
        card_network: CardNetwork,
        statement_date: NaiveDate,
        parsed: ParsedStatement,
    ) -> Self {
        let holders = parsed
            .holders
            .into_iter()
            .map(|h| Holder {
                holder: h.holder,
                totals: h.totals,
                expenses: h
                    .items
                    .into_iter()
                    .zip(1u32..)
                    .map(|(item, position)| HolderExpense {
                        position,
                        date: item.date,
                        description: item.description,
                        amount: item.amount,
                    })
                    .collect(),
            })
            .collect();

        CardStatement {
            document_number,
            card_network,
            statement_date,
            totals: parsed.totals,
            holders,
        }
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

pub fn statement_exists(conn: &Connection, document_number: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM resumes WHERE document_number = ?1",
            params![document_number],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Statement, holders and line items in one transaction
pub fn insert_statement(conn: &mut Connection, statement: &CardStatement) -> Result<(), StoreError> {
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO resumes (document_number, card_network, statement_date, total_local, total_foreign)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            statement.document_number,
            statement.card_network.as_str(),
            statement.statement_date.format("%Y-%m-%d").to_string(),
            statement.totals.local.to_string(),
            statement.totals.foreign.to_string(),
        ],
    )?;

    {
        let mut insert_holder = tx.prepare(
            "INSERT INTO holders (document_number, holder, total_local, total_foreign)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let mut insert_expense = tx.prepare(
            "INSERT INTO holder_expenses (document_number, holder, position, date, description, amount)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;

        for holder in &statement.holders {
            insert_holder.execute(params![
                statement.document_number,
                holder.holder,
                holder.totals.local.to_string(),
                holder.totals.foreign.to_string(),
            ])?;

            for expense in &holder.expenses {
                insert_expense.execute(params![
                    statement.document_number,
                    holder.holder,
                    expense.position,
                    expense.date,
                    expense.description,
                    expense.amount.to_string(),
                ])?;
            }
        }
    }

    tx.commit()?;
    Ok(())
}

/// Statements whose month is one of `months`, optionally of one network,
/// newest first, with holders and line items loaded
pub fn load_statements(
    conn: &Connection,
    months: &[MonthWindow],
    network: Option<CardNetwork>,
) -> Result<Vec<CardStatement>, StoreError> {
    if months.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; months.len()].join(", ");
    let mut sql = format!(
        "SELECT document_number, card_network, statement_date, total_local, total_foreign
         FROM resumes
         WHERE substr(statement_date, 1, 7) IN ({})",
        placeholders
    );
    let mut values: Vec<String> = months.iter().map(|m| m.period()).collect();

    if let Some(network) = network {
        sql.push_str(" AND LOWER(card_network) = ?");
        values.push(network.as_str().to_string());
    }
    sql.push_str(" ORDER BY statement_date DESC, document_number");

    let mut stmt = conn.prepare(&sql)?;
    let headers = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                Totals {
                    local: decimal_column(row, 3)?,
                    foreign: decimal_column(row, 4)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut statements = Vec::with_capacity(headers.len());
    for (document_number, network, date, totals) in headers {
        let Ok(card_network) = network.parse::<CardNetwork>() else {
            warn!(document_number = %document_number, network = %network, "unknown card network, skipping statement");
            continue;
        };
        let Ok(statement_date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
            warn!(document_number = %document_number, date = %date, "unreadable statement date, skipping statement");
            continue;
        };

        let holders = load_holders(conn, &document_number)?;
        statements.push(CardStatement {
            document_number,
            card_network,
            statement_date,
            totals,
            holders,
        });
    }

    Ok(statements)
}

fn load_holders(conn: &Connection, document_number: &str) -> Result<Vec<Holder>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT holder, total_local, total_foreign
         FROM holders WHERE document_number = ?1
         ORDER BY holder",
    )?;
    let mut holders = stmt
        .query_map(params![document_number], |row| {
            Ok(Holder {
                holder: row.get(0)?,
                totals: Totals {
                    local: decimal_column(row, 1)?,
                    foreign: decimal_column(row, 2)?,
                },
                expenses: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT position, date, description, amount
         FROM holder_expenses WHERE document_number = ?1 AND holder = ?2
         ORDER BY position",
    )?;
    for holder in &mut holders {
        holder.expenses = stmt
            .query_map(params![document_number, holder.holder], |row| {
                Ok(HolderExpense {
                    position: row.get(0)?,
                    date: row.get(1)?,
                    description: row.get(2)?,
                    amount: decimal_column(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }

    Ok(holders)
}

/// Keep only the named holder (case-insensitive) in each statement.
/// Returns false when some statement ends up with no holders at all.
pub fn filter_holders(statements: &mut [CardStatement], holder: &str) -> bool {
    let wanted = holder.to_lowercase();
    let mut every_statement_kept_one = true;

    for statement in statements.iter_mut() {
        statement.holders.retain(|h| h.holder.to_lowercase() == wanted);
        if statement.holders.is_empty() {
            every_statement_kept_one = false;
        }
    }

    every_statement_kept_one
}

/// A line item joined with its statement, for month views
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthLineItem {
    pub document_number: String,
    pub holder: String,
    pub description: String,
    pub amount: Decimal,
}

pub fn month_line_items(conn: &Connection, month: MonthWindow) -> Result<Vec<MonthLineItem>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT e.document_number, e.holder, e.description, e.amount
         FROM holder_expenses e
         JOIN holders h ON e.document_number = h.document_number AND e.holder = h.holder
         JOIN resumes r ON h.document_number = r.document_number
         WHERE substr(r.statement_date, 1, 7) = ?1
         ORDER BY e.document_number, e.holder, e.position",
    )?;

    let items = stmt
        .query_map(params![month.period()], |row| {
            Ok(MonthLineItem {
                document_number: row.get(0)?,
                holder: row.get(1)?,
                description: row.get(2)?,
                amount: decimal_column(row, 3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(items)
}

/// Sum of the statement-level totals for one month
pub fn month_card_totals(conn: &Connection, month: MonthWindow) -> Result<Totals, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT total_local, total_foreign FROM resumes
         WHERE substr(statement_date, 1, 7) = ?1",
    )?;

    let rows = stmt
        .query_map(params![month.period()], |row| {
            Ok((decimal_column(row, 0)?, decimal_column(row, 1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().fold(Totals::default(), |acc, (local, foreign)| Totals {
        local: acc.local + local,
        foreign: acc.foreign + foreign,
    }))
}

// ============================================================================
// KEYWORD SUMMARIES (subscriptions, tracked merchants)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordSummary {
    pub service: String,
    pub total_amount: Decimal,
    pub total_amount_formatted: String,
    pub logo_name: String,
}

/// Group line items under the label of the first keyword (in sorted order)
/// their lowercase description contains. Items matching no keyword are
/// dropped. A group whose reference description (the greatest one) mentions
/// USD gets a " USD" suffix. Sorted by total, largest first.
pub fn summarize_by_keyword(
    items: &[MonthLineItem],
    keywords: &KeywordMap,
    logos: &LogoMap,
    formatter: &dyn AmountFormatter,
) -> Vec<KeywordSummary> {
    struct Group<'a> {
        total: Decimal,
        reference: &'a str,
    }

    let mut groups: BTreeMap<&str, Group> = BTreeMap::new();

    for item in items {
        let description = item.description.to_lowercase();
        let Some(label) = keywords
            .iter()
            .find(|(keyword, _)| description.contains(keyword.as_str()))
            .map(|(_, label)| label.as_str())
        else {
            continue;
        };

        let group = groups.entry(label).or_insert(Group {
            total: Decimal::ZERO,
            reference: item.description.as_str(),
        });
        group.total += item.amount;
        if item.description.as_str() > group.reference {
            group.reference = item.description.as_str();
        }
    }

    let mut summaries: Vec<KeywordSummary> = groups
        .into_iter()
        .map(|(label, group)| {
            let mut service = label.to_string();
            if group.reference.to_uppercase().contains("USD") && !service.contains("USD") {
                service.push_str(" USD");
            }

            let logo_key = service.replacen(" USD", "", 1);
            let logo_name = logos
                .get(&logo_key)
                .filter(|logo| !logo.is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_LOGO.to_string());

            KeywordSummary {
                total_amount_formatted: formatter.format_amount(group.total),
                service,
                total_amount: group.total,
                logo_name,
            }
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.total_amount
            .cmp(&a.total_amount)
            .then_with(|| a.service.cmp(&b.service))
    });
    summaries
}

// ============================================================================
// INSTALLMENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Installment {
    pub description: String,
    pub holder: String,
    pub amount: Decimal,
    pub formatted_amount: String,
    pub installment: u32,
    pub total_installments: u32,
    pub remaining_installments: u32,
}

fn installment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // "C.03/06" = installment 3 of 6
    PATTERN.get_or_init(|| Regex::new(r"(?i)\bC\.(\d{1,2})/(\d{1,2})").expect("installment regex"))
}

/// `(current, total)` from a description carrying an installment marker
pub fn parse_installment(description: &str) -> Option<(u32, u32)> {
    let caps = installment_pattern().captures(description)?;
    let current: u32 = caps.get(1)?.as_str().parse().ok()?;
    let total: u32 = caps.get(2)?.as_str().parse().ok()?;

    if current == 0 || current > total {
        return None;
    }
    Some((current, total))
}

/// Installment line items with at most `remaining` installments left,
/// largest amount first
pub fn installments_about_to_expire(
    items: &[MonthLineItem],
    remaining: u32,
    formatter: &dyn AmountFormatter,
) -> Vec<Installment> {
    let mut found: Vec<Installment> = items
        .iter()
        .filter_map(|item| {
            let (current, total) = parse_installment(&item.description)?;
            let left = total - current;
            (left <= remaining).then(|| Installment {
                description: item.description.clone(),
                holder: item.holder.clone(),
                amount: item.amount,
                formatted_amount: formatter.format_amount(item.amount),
                installment: current,
                total_installments: total,
                remaining_installments: left,
            })
        })
        .collect();

    found.sort_by(|a, b| b.amount.cmp(&a.amount));
    found
}
