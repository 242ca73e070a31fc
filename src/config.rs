//! Environment configuration
//!
//! Everything is read from the process environment, after loading a `.env`
//! file when one exists. Only the two database paths are required; sheet,
//! PDF and statement-directory settings may be absent and the features that
//! need them report "not configured" when used.

use crate::cards::{CardNetwork, KeywordMap, LogoMap};
use crate::db::ApplyPolicy;
use crate::error::ConfigError;
use crate::reconciliation::SyncMode;
use crate::records::RecordKind;
use crate::sources::{ServiceAccount, GOOGLE_TOKEN_URI};
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Where spreadsheet rows come from
#[derive(Debug, Clone)]
pub enum SheetsConfig {
    Google {
        spreadsheet_id: String,
        account: ServiceAccount,
    },
    /// One `<tab>.csv` per sheet tab
    Csv { dir: PathBuf },
}

/// A1 ranges read by each sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRanges {
    pub expenses_month: String,
    pub expenses_historical: String,
    pub incomes_month: String,
    pub incomes_historical: String,
}

impl Default for SheetRanges {
    fn default() -> Self {
        SheetRanges {
            expenses_month: "GastosMesActual!A:Z".to_string(),
            expenses_historical: "Gastos!A:Z".to_string(),
            incomes_month: "IncomeMesActual!A:Z".to_string(),
            incomes_historical: "Income!A:Z".to_string(),
        }
    }
}

impl SheetRanges {
    pub fn range_for(&self, kind: RecordKind, mode: &SyncMode) -> &str {
        match (kind, mode) {
            (RecordKind::Expense, SyncMode::Incremental(_)) => &self.expenses_month,
            (RecordKind::Expense, SyncMode::Historical) => &self.expenses_historical,
            (RecordKind::Income, SyncMode::Incremental(_)) => &self.incomes_month,
            (RecordKind::Income, SyncMode::Historical) => &self.incomes_historical,
        }
    }
}

/// Keyword and logo maps for the two keyword summaries
#[derive(Debug, Clone, Default)]
pub struct KeywordSettings {
    pub subscriptions: KeywordMap,
    pub subscription_logos: LogoMap,
    pub specific_expenses: KeywordMap,
    pub specific_logos: LogoMap,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub transactions_db_path: PathBuf,
    pub cards_db_path: PathBuf,
    pub sheets: Option<SheetsConfig>,
    pub ranges: SheetRanges,
    pub pdf_extraction_url: Option<String>,
    /// Configured statement directories, visa first
    pub statement_dirs: Vec<(CardNetwork, PathBuf)>,
    pub keywords: KeywordSettings,
    pub apply_policy: ApplyPolicy,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let port = match get("PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                value: raw,
            })?,
            None => DEFAULT_PORT,
        };

        let apply_policy = match get("SYNC_APPLY_MODE") {
            Some(raw) => ApplyPolicy::from_str(&raw).map_err(|_| ConfigError::Invalid {
                name: "SYNC_APPLY_MODE",
                value: raw,
            })?,
            None => ApplyPolicy::default(),
        };

        let format = match get("LOG_FORMAT").as_deref() {
            None | Some("pretty") | Some("text") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    value: other.to_string(),
                })
            }
        };

        let sheets = if let Some(dir) = get("SHEETS_CSV_DIR") {
            Some(SheetsConfig::Csv { dir: dir.into() })
        } else {
            match (get("GS_SPREADSHEET_ID"), get("GS_CLIENT_EMAIL"), get("GS_PRIVATE_KEY")) {
                (Some(spreadsheet_id), Some(client_email), Some(private_key)) => {
                    Some(SheetsConfig::Google {
                        spreadsheet_id,
                        account: ServiceAccount {
                            client_email,
                            private_key,
                            private_key_id: get("GS_PRIVATE_KEY_ID"),
                            token_uri: get("GS_TOKEN_URI")
                                .unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string()),
                        },
                    })
                }
                _ => None,
            }
        };

        let defaults = SheetRanges::default();
        let ranges = SheetRanges {
            expenses_month: get("SHEET_RANGE_EXPENSES_MONTH").unwrap_or(defaults.expenses_month),
            expenses_historical: get("SHEET_RANGE_EXPENSES_HISTORICAL")
                .unwrap_or(defaults.expenses_historical),
            incomes_month: get("SHEET_RANGE_INCOMES_MONTH").unwrap_or(defaults.incomes_month),
            incomes_historical: get("SHEET_RANGE_INCOMES_HISTORICAL")
                .unwrap_or(defaults.incomes_historical),
        };

        let statement_dirs = [
            (CardNetwork::Visa, get("CARD_VISA_PATH")),
            (CardNetwork::Mastercard, get("CARD_MASTERCARD_PATH")),
        ]
        .into_iter()
        .filter_map(|(network, dir)| dir.map(|d| (network, PathBuf::from(d))))
        .collect();

        Ok(AppConfig {
            port,
            transactions_db_path: require("TRANSACTIONS_DB_PATH")?.into(),
            cards_db_path: require("CARDS_DB_PATH")?.into(),
            sheets,
            ranges,
            pdf_extraction_url: get("PDF_EXTRACTION_URL").or_else(|| get("BBVA_PDF_SERVICE")),
            statement_dirs,
            keywords: KeywordSettings {
                subscriptions: parse_keyword_map(&get("SUBSCRIPTION_MAP").unwrap_or_default()),
                subscription_logos: parse_logo_map(&get("SUBSCRIPTION_LOGO_MAP").unwrap_or_default()),
                specific_expenses: parse_keyword_map(
                    &get("SPECIFIC_EXPENSES_MAP").unwrap_or_default(),
                ),
                specific_logos: parse_logo_map(&get("SPECIFIC_LOGO_MAP").unwrap_or_default()),
            },
            apply_policy,
            log: LogConfig {
                level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                format,
            },
        })
    }
}

// "key:value,key2:value2"; pairs without ':' are ignored
fn parse_pairs(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split(',').filter_map(|pair| {
        let (key, value) = pair.split_once(':')?;
        Some((key.trim(), value.trim()))
    })
}

/// Keywords are lowercased so they match lowercased descriptions
pub fn parse_keyword_map(raw: &str) -> KeywordMap {
    parse_pairs(raw)
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_lowercase(), value.to_string()))
        .collect()
}

pub fn parse_logo_map(raw: &str) -> LogoMap {
    parse_pairs(raw)
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
