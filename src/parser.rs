// 🏗️ Statement Parser - PDF extraction JSON → holders + totals
//
// The extraction service answers with one JSON object keyed by holder name:
//
//   {
//     "Total": {"pesos": "...", "dolares": "..."},          <- grand total
//     "JUAN":  {"Detail": [{fecha, descripcion, importe}], "Total": {...}}
//   }

use crate::error::StatementError;
use crate::normalize::{normalize_statement_date, parse_statement_amount};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Key the grand-total pair is stored under
pub const GRAND_TOTAL_KEY: &str = "Total";

// ============================================================================
// WIRE SHAPES
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct RawTotals {
    #[serde(default)]
    pesos: String,
    #[serde(default)]
    dolares: String,
}

impl RawTotals {
    fn is_complete(&self) -> bool {
        !self.pesos.is_empty() && !self.dolares.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawLineItem {
    #[serde(default)]
    fecha: String,
    #[serde(default)]
    descripcion: String,
    #[serde(default)]
    importe: String,
}

#[derive(Debug, Deserialize)]
struct RawHolder {
    #[serde(rename = "Detail", default)]
    detail: Vec<RawLineItem>,
    #[serde(rename = "Total", default)]
    total: RawTotals,
}

// ============================================================================
// PARSED SHAPES
// ============================================================================

/// Local (pesos) and foreign (dólares) currency totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub local: Decimal,
    pub foreign: Decimal,
}

/// One charge, in statement order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineItem {
    pub date: String,
    pub description: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderStatement {
    pub holder: String,
    pub items: Vec<LineItem>,
    pub totals: Totals,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedStatement {
    pub holders: Vec<HolderStatement>,
    pub totals: Totals,
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// Split an extraction response into per-holder statements and the grand total.
///
/// Each value is first tried as a bare totals pair; only a complete pair
/// under the `"Total"` key counts as the grand total. Anything else is read
/// as a holder record. Values that are not holder records are skipped, as
/// are line items whose amount does not parse.
pub fn classify_statement(payload: &[u8]) -> Result<ParsedStatement, StatementError> {
    let root: Value = serde_json::from_slice(payload)?;
    let Value::Object(entries) = root else {
        return Err(StatementError::NotAnObject);
    };

    let mut parsed = ParsedStatement::default();

    for (name, value) in &entries {
        if name == GRAND_TOTAL_KEY {
            if let Ok(pair) = RawTotals::deserialize(value) {
                if pair.is_complete() {
                    parsed.totals = totals_from_raw(name, &pair);
                    continue;
                }
            }
        }

        let raw = match RawHolder::deserialize(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(holder = %name, error = %e, "skipping unreadable holder entry");
                continue;
            }
        };

        parsed.holders.push(holder_from_raw(name, raw));
    }

    debug!(
        holders = parsed.holders.len(),
        local = %parsed.totals.local,
        foreign = %parsed.totals.foreign,
        "statement classified"
    );

    Ok(parsed)
}

fn holder_from_raw(name: &str, raw: RawHolder) -> HolderStatement {
    let items = raw
        .detail
        .into_iter()
        .filter_map(|item| match parse_statement_amount(&item.importe) {
            Ok(amount) => Some(LineItem {
                date: normalize_statement_date(&item.fecha),
                description: item.descripcion.trim().to_string(),
                amount,
            }),
            Err(e) => {
                warn!(holder = %name, error = %e, "skipping line item");
                None
            }
        })
        .collect();

    HolderStatement {
        holder: name.to_string(),
        items,
        totals: totals_from_raw(name, &raw.total),
    }
}

// Unreadable totals count as 0
fn totals_from_raw(name: &str, raw: &RawTotals) -> Totals {
    let read = |value: &str| {
        parse_statement_amount(value).unwrap_or_else(|e| {
            warn!(holder = %name, error = %e, "unreadable total, using 0");
            Decimal::ZERO
        })
    };

    Totals {
        local: read(&raw.pesos),
        foreign: read(&raw.dolares),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> &'static str {
        r#"{
            "Total": {"pesos": "150.000,50", "dolares": "20,00"},
            "Juan": {
                "Detail": [
                    {"fecha": "05/06/25", "fechaTimestamp": "1749081600", "descripcion": "NETFLIX.COM", "importe": "8.999,00"},
                    {"fecha": "07/06/25", "descripcion": "MERPAGO*TIENDA C.03/06", "importe": "12.000,00"}
                ],
                "Total": {"pesos": "20.999,00", "dolares": "0,00"}
            }
        }"#
    }

    #[test]
    fn test_total_and_holder_are_told_apart() {
        let parsed = classify_statement(sample().as_bytes()).unwrap();

        assert_eq!(parsed.totals.local, dec!(150000.50));
        assert_eq!(parsed.totals.foreign, dec!(20));

        assert_eq!(parsed.holders.len(), 1);
        let juan = &parsed.holders[0];
        assert_eq!(juan.holder, "Juan");
        assert_eq!(juan.totals.local, dec!(20999));
        assert_eq!(juan.items.len(), 2);
        assert_eq!(juan.items[0].description, "NETFLIX.COM");
        assert_eq!(juan.items[0].amount, dec!(8999));
        assert_eq!(juan.items[0].date, "2025-06-05");
    }

    #[test]
    fn test_bad_line_items_skipped_individually() {
        let payload = r#"{
            "Ana": {
                "Detail": [
                    {"fecha": "01/06/2025", "descripcion": "OK", "importe": "10,00"},
                    {"fecha": "02/06/2025", "descripcion": "BAD", "importe": "diez"},
                    {"fecha": "03/06/2025", "descripcion": "BLANK", "importe": ""}
                ],
                "Total": {"pesos": "10,00", "dolares": ""}
            }
        }"#;
        let parsed = classify_statement(payload.as_bytes()).unwrap();

        let descriptions: Vec<&str> = parsed.holders[0]
            .items
            .iter()
            .map(|i| i.description.as_str())
            .collect();
        assert_eq!(descriptions, vec!["OK", "BLANK"]);
        assert_eq!(parsed.holders[0].items[1].amount, Decimal::ZERO);
    }

    #[test]
    fn test_unreadable_holder_is_skipped() {
        let payload = r#"{
            "Ana": "not an object",
            "Luis": {"Detail": [], "Total": {"pesos": "1,00", "dolares": "0,00"}}
        }"#;
        let parsed = classify_statement(payload.as_bytes()).unwrap();

        assert_eq!(parsed.holders.len(), 1);
        assert_eq!(parsed.holders[0].holder, "Luis");
    }

    #[test]
    fn test_incomplete_total_pair_is_not_grand_total() {
        // Only "pesos" present: not a complete pair, so it is read as a holder
        let payload = r#"{"Total": {"pesos": "5,00"}}"#;
        let parsed = classify_statement(payload.as_bytes()).unwrap();

        assert_eq!(parsed.totals, Totals::default());
        assert_eq!(parsed.holders.len(), 1);
        assert_eq!(parsed.holders[0].holder, "Total");
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        assert!(matches!(
            classify_statement(b"[1, 2, 3]"),
            Err(StatementError::NotAnObject)
        ));
        assert!(matches!(
            classify_statement(b"not json"),
            Err(StatementError::Json(_))
        ));
    }
}
