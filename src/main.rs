use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use finance_sync::config::AppConfig;
use finance_sync::db::{count_records, lock};
use finance_sync::logging::init_tracing;
use finance_sync::reports::balance;
use finance_sync::{
    ingest_statements, sync_records, AppState, Database, LocaleFormatter, MonthWindow, RecordKind,
    SyncMode,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Parser)]
#[command(name = "finance-sync")]
#[command(about = "Sync expenses, incomes and card statements into SQLite")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create both schemas and print row counts
    Init,
    /// Sync one sheet into its table
    Sync {
        #[arg(value_enum)]
        table: Table,
        /// Compare against the whole table instead of the current month
        #[arg(long)]
        historical: bool,
    },
    /// Extract and store new card statements
    Statements,
    /// Print the balance for a month (defaults to the current one)
    Balance {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Table {
    Expenses,
    Incomes,
}

impl From<Table> for RecordKind {
    fn from(table: Table) -> Self {
        match table {
            Table::Expenses => RecordKind::Expense,
            Table::Incomes => RecordKind::Income,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log);

    let db = Database::open(&config.transactions_db_path, &config.cards_db_path)
        .context("failed to open databases")?;

    match args.command {
        Commands::Init => run_init(&db)?,
        Commands::Sync { table, historical } => run_sync(&config, &db, table.into(), historical).await?,
        Commands::Statements => run_statements(&config, &db).await?,
        Commands::Balance { year, month } => run_balance(&db, year, month)?,
    }

    db.close()?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_init(db: &Database) -> Result<()> {
    let conn = lock(db.transactions())?;
    let mut counts = BTreeMap::new();
    for kind in [RecordKind::Expense, RecordKind::Income] {
        counts.insert(kind.table(), count_records(&conn, kind)?);
    }

    print_json(&counts)
}

async fn run_sync(config: &AppConfig, db: &Database, kind: RecordKind, historical: bool) -> Result<()> {
    let state = AppState::from_config(config, db.clone());
    let Some(source) = state.sheets.as_deref() else {
        bail!("no spreadsheet source configured (set GS_SPREADSHEET_ID or SHEETS_CSV_DIR)");
    };

    let mode = if historical {
        SyncMode::Historical
    } else {
        SyncMode::Incremental(MonthWindow::current())
    };
    let store = db.record_store(kind, config.apply_policy);
    let range = config.ranges.range_for(kind, &mode);

    info!(table = kind.table(), mode = mode.label(), range, "starting sync");
    let report = sync_records(source, &store, mode, range).await?;
    print_json(&report)
}

async fn run_statements(config: &AppConfig, db: &Database) -> Result<()> {
    let state = AppState::from_config(config, db.clone());
    let Some(extractor) = state.extractor.as_deref() else {
        bail!("no PDF extraction service configured (set PDF_EXTRACTION_URL)");
    };

    info!(directories = config.statement_dirs.len(), "starting statement ingestion");
    let report = ingest_statements(extractor, db.cards(), &config.statement_dirs).await?;
    print_json(&report)
}

fn run_balance(db: &Database, year: Option<i32>, month: Option<u32>) -> Result<()> {
    let current = MonthWindow::current();
    let Some(window) = MonthWindow::new(year.unwrap_or(current.year), month.unwrap_or(current.month)) else {
        bail!("invalid month");
    };

    let transactions = lock(db.transactions())?;
    let cards = lock(db.cards())?;
    print_json(&balance(&transactions, &cards, window, &LocaleFormatter::spanish())?)
}
