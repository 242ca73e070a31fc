// Finance Sync - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod config;
pub mod logging;
pub mod normalize;      // Amount/date parsing and display formatting
pub mod records;        // Expense/income records and sheet row mapping
pub mod reconciliation; // Month windows, sync modes, key-based diff
pub mod db;             // SQLite schema and record store
pub mod parser;         // Statement JSON classification
pub mod cards;          // Card statements, keyword summaries, installments
pub mod sources;        // Google Sheets, CSV and PDF extraction clients
pub mod sync;           // Sheet -> store sync, statement ingestion
pub mod reports;        // Expense/income listings, summary, balance
pub mod server;         // axum router and handlers

// Re-export commonly used types
pub use config::{AppConfig, KeywordSettings, LogConfig, LogFormat, SheetRanges, SheetsConfig};
pub use db::{ApplyPolicy, Database, RecordStore, SharedConnection, SqliteRecordStore};
pub use error::{ConfigError, NormalizeError, SourceError, StatementError, StoreError, SyncError};
pub use normalize::{AmountFormatter, LocaleFormatter};
pub use records::{FinancialRecord, RecordKind, SheetRow, SkippedRow};
pub use reconciliation::{reconcile, MonthWindow, ReconciliationResult, SyncMode};
pub use parser::{classify_statement, ParsedStatement, Totals};
pub use cards::{CardNetwork, CardStatement, KeywordMap, LogoMap};
pub use sources::{
    CsvSheetSource, GoogleSheetsClient, PdfExtractionClient, ServiceAccount, SheetSource,
    StatementExtractor,
};
pub use sync::{ingest_statements, sync_records, StatementSyncReport, SyncReport};
pub use server::{build_router, AppState, Settings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
