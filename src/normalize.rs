// Amount/Date Normalizer
// Loosely formatted amounts and dates in, canonical values out.

use crate::error::NormalizeError;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

// ============================================================================
// AMOUNTS
// ============================================================================

/// Which decimal marker convention a raw amount was written with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountStyle {
    /// Spreadsheet values: `.` groups thousands, `,` marks decimals ("1.234,56")
    Sheet,
    /// Locally stored values: the first `.` marks decimals ("1234.56")
    Local,
}

/// Parse a loosely formatted amount, never failing.
///
/// Currency symbols, spaces and separators are dropped. A minus sign is kept
/// only when it comes before any digit. Empty or unparsable input yields 0,
/// so one malformed cell never aborts a batch.
pub fn parse_amount(raw: &str, style: AmountStyle) -> Decimal {
    let prepared = match style {
        AmountStyle::Sheet => raw.replace('.', "").replace(',', "."),
        AmountStyle::Local => raw.to_string(),
    };

    let cleaned = clean_amount(&prepared);
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }

    Decimal::from_str(&cleaned).unwrap_or(Decimal::ZERO)
}

/// Strict variant used for statement line items: blank is 0, anything that
/// is not a plain "1.234,56"-style number is an error.
pub fn parse_statement_amount(raw: &str) -> Result<Decimal, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }

    let cleaned = trimmed.replace('.', "").replace(',', ".");
    Decimal::from_str(&cleaned).map_err(|_| NormalizeError::InvalidAmount(raw.to_string()))
}

fn clean_amount(input: &str) -> String {
    let mut cleaned = String::with_capacity(input.len());
    let mut has_decimal = false;

    for c in input.chars() {
        match c {
            '-' if cleaned.is_empty() => cleaned.push(c),
            '0'..='9' => cleaned.push(c),
            '.' if !has_decimal => {
                cleaned.push(c);
                has_decimal = true;
            }
            _ => {}
        }
    }

    cleaned
}

// ============================================================================
// DATES
// ============================================================================

/// Layouts the spreadsheet writes date-times in, legacy first
pub const SHEET_DATE_TIME_LAYOUTS: [&str; 2] = ["%d/%m/%Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// ISO layout written by newer clients
pub const ISO_DATE_TIME_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";

/// Layout of the parsed `date` column
pub const STORAGE_DATE_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

pub fn parse_date_time(raw: &str, layout: &str) -> Result<NaiveDateTime, NormalizeError> {
    NaiveDateTime::parse_from_str(raw.trim(), layout).map_err(|_| NormalizeError::InvalidFormat {
        raw: raw.to_string(),
        layout: layout.to_string(),
    })
}

pub fn parse_date(raw: &str, layout: &str) -> Result<NaiveDate, NormalizeError> {
    NaiveDate::parse_from_str(raw.trim(), layout).map_err(|_| NormalizeError::InvalidFormat {
        raw: raw.to_string(),
        layout: layout.to_string(),
    })
}

/// Try every sheet layout in turn
pub fn parse_sheet_date_time(raw: &str) -> Result<NaiveDateTime, NormalizeError> {
    let mut last_err = None;
    for layout in SHEET_DATE_TIME_LAYOUTS {
        match parse_date_time(raw, layout) {
            Ok(dt) => return Ok(dt),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| NormalizeError::InvalidFormat {
        raw: raw.to_string(),
        layout: String::new(),
    }))
}

/// Statement file stems are "MM-YYYY"; the statement date is the first of that month
pub fn parse_statement_month(stem: &str) -> Result<NaiveDate, NormalizeError> {
    parse_date(&format!("01-{}", stem.trim()), "%d-%m-%Y").map_err(|_| {
        NormalizeError::InvalidFormat {
            raw: stem.to_string(),
            layout: "MM-YYYY".to_string(),
        }
    })
}

/// Display form of a stored date-time: ISO becomes "D/M/YYYY HH:MM:SS",
/// anything else is returned unchanged.
pub fn display_date_time(raw: &str) -> String {
    match parse_date_time(raw, ISO_DATE_TIME_LAYOUT) {
        Ok(dt) => dt.format("%-d/%-m/%Y %H:%M:%S").to_string(),
        Err(_) => raw.to_string(),
    }
}

/// Statement line-item dates become YYYY-MM-DD when recognizable
pub fn normalize_statement_date(raw: &str) -> String {
    let trimmed = raw.trim();

    let layout = if trimmed.contains('/') {
        match trimmed.rsplit('/').next() {
            Some(year) if year.len() == 2 => "%d/%m/%y",
            _ => "%d/%m/%Y",
        }
    } else {
        "%Y-%m-%d"
    };

    parse_date(trimmed, layout)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| trimmed.to_string())
}

// ============================================================================
// FORMATTING
// ============================================================================

/// Renders money for API responses
pub trait AmountFormatter: Send + Sync {
    fn format_amount(&self, amount: Decimal) -> String;
}

/// Currency symbol + grouped integer part + two decimals
#[derive(Debug, Clone)]
pub struct LocaleFormatter {
    pub symbol: String,
    pub thousands_separator: char,
    pub decimal_separator: char,
}

impl LocaleFormatter {
    /// "$1.234,56"
    pub fn spanish() -> Self {
        LocaleFormatter {
            symbol: "$".to_string(),
            thousands_separator: '.',
            decimal_separator: ',',
        }
    }
}

impl Default for LocaleFormatter {
    fn default() -> Self {
        Self::spanish()
    }
}

impl AmountFormatter for LocaleFormatter {
    fn format_amount(&self, amount: Decimal) -> String {
        let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let negative = rounded.is_sign_negative() && !rounded.is_zero();

        let mut magnitude = rounded.abs();
        magnitude.rescale(2);
        let digits = magnitude.to_string();
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits.as_str(), "00"));

        let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
        for (i, c) in int_part.chars().enumerate() {
            if i > 0 && (int_part.len() - i) % 3 == 0 {
                grouped.push(self.thousands_separator);
            }
            grouped.push(c);
        }

        format!(
            "{}{}{}{}{}",
            self.symbol,
            if negative { "-" } else { "" },
            grouped,
            self.decimal_separator,
            frac_part
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sheet_amount_with_symbol_and_separators() {
        assert_eq!(parse_amount("$1.234,56", AmountStyle::Sheet), dec!(1234.56));
        assert_eq!(parse_amount("-$ 12.000,5", AmountStyle::Sheet), dec!(-12000.5));
        assert_eq!(parse_amount("350", AmountStyle::Sheet), dec!(350));
    }

    #[test]
    fn test_local_amount_keeps_first_decimal_point() {
        assert_eq!(parse_amount("-42.10", AmountStyle::Local), dec!(-42.10));
        assert_eq!(parse_amount("$1,234.56", AmountStyle::Local), dec!(1234.56));
        assert_eq!(parse_amount("1.2.3", AmountStyle::Local), dec!(1.23));
    }

    #[test]
    fn test_malformed_amounts_become_zero() {
        assert_eq!(parse_amount("", AmountStyle::Local), Decimal::ZERO);
        assert_eq!(parse_amount("", AmountStyle::Sheet), Decimal::ZERO);
        assert_eq!(parse_amount("n/a", AmountStyle::Local), Decimal::ZERO);
        assert_eq!(parse_amount("-", AmountStyle::Local), Decimal::ZERO);
    }

    #[test]
    fn test_minus_only_counts_before_digits() {
        assert_eq!(parse_amount("10-5", AmountStyle::Local), dec!(105));
        assert_eq!(parse_amount("$-7", AmountStyle::Local), dec!(-7));
    }

    #[test]
    fn test_local_parse_is_idempotent_on_clean_strings() {
        for raw in ["-42.10", "0", "1234.56", "$ 99,90", "abc", "-0.01", "7.000001"] {
            let once = parse_amount(raw, AmountStyle::Local);
            let twice = parse_amount(&once.to_string(), AmountStyle::Local);
            assert_eq!(once, twice, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_statement_amount_is_strict() {
        assert_eq!(parse_statement_amount("1.234,56").unwrap(), dec!(1234.56));
        assert_eq!(parse_statement_amount("  ").unwrap(), Decimal::ZERO);
        assert_eq!(parse_statement_amount("-15,00").unwrap(), dec!(-15));
        assert!(matches!(
            parse_statement_amount("$ 12,00"),
            Err(NormalizeError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_sheet_date_time_layouts() {
        let legacy = parse_sheet_date_time("17/6/2025 18:11:40").unwrap();
        assert_eq!(legacy.format(STORAGE_DATE_TIME_LAYOUT).to_string(), "2025-06-17 18:11:40");

        let iso = parse_sheet_date_time("2025-07-01T09:00:00").unwrap();
        assert_eq!(iso.format(STORAGE_DATE_TIME_LAYOUT).to_string(), "2025-07-01 09:00:00");

        assert!(matches!(
            parse_sheet_date_time("yesterday"),
            Err(NormalizeError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_parse_date_reports_layout() {
        let err = parse_date("2025/13/40", "%Y-%m-%d").unwrap_err();
        assert_eq!(
            err,
            NormalizeError::InvalidFormat {
                raw: "2025/13/40".to_string(),
                layout: "%Y-%m-%d".to_string(),
            }
        );
    }

    #[test]
    fn test_statement_month_from_file_stem() {
        assert_eq!(
            parse_statement_month("07-2025").unwrap(),
            NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()
        );
        assert!(parse_statement_month("resumen-julio").is_err());
        assert!(parse_statement_month("13-2025").is_err());
    }

    #[test]
    fn test_display_date_time_falls_back_to_raw() {
        assert_eq!(display_date_time("2025-06-02T08:05:09"), "2/6/2025 08:05:09");
        assert_eq!(display_date_time("17/6/2025 18:11:40"), "17/6/2025 18:11:40");
    }

    #[test]
    fn test_normalize_statement_date() {
        assert_eq!(normalize_statement_date("05/06/2025"), "2025-06-05");
        assert_eq!(normalize_statement_date("5/6/25"), "2025-06-05");
        assert_eq!(normalize_statement_date("2025-06-05"), "2025-06-05");
        assert_eq!(normalize_statement_date("05-Jun-25"), "05-Jun-25");
    }

    #[test]
    fn test_spanish_formatter() {
        let fmt = LocaleFormatter::spanish();
        assert_eq!(fmt.format_amount(dec!(1234.56)), "$1.234,56");
        assert_eq!(fmt.format_amount(dec!(0)), "$0,00");
        assert_eq!(fmt.format_amount(dec!(1000000)), "$1.000.000,00");
        assert_eq!(fmt.format_amount(dec!(-999.995)), "$-1.000,00");
        assert_eq!(fmt.format_amount(dec!(12.5)), "$12,50");
    }
}
