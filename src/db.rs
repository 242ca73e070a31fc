use crate::error::{ApplyStep, StoreError};
use crate::normalize::{parse_amount, parse_date_time, AmountStyle, STORAGE_DATE_TIME_LAYOUT};
use crate::reconciliation::SyncMode;
use crate::records::{FinancialRecord, RecordKind};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub type SharedConnection = Arc<Mutex<Connection>>;

// ============================================================================
// SCHEMAS
// ============================================================================

pub fn setup_transactions_database(conn: &Connection) -> rusqlite::Result<()> {
    // ==========================================================================
    // Expenses / Incomes (uuid = sheet identity, id = storage-only key)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS expenses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT UNIQUE NOT NULL,
            date_time TEXT NOT NULL,
            date TEXT,
            description TEXT,
            amount TEXT,
            category TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incomes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT UNIQUE NOT NULL,
            date_time TEXT NOT NULL,
            date TEXT,
            description TEXT,
            amount TEXT,
            currency TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_date ON expenses(date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incomes_date_time ON incomes(date_time)",
        [],
    )?;

    Ok(())
}

pub fn setup_cards_database(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS resumes (
            document_number TEXT PRIMARY KEY,
            card_network TEXT NOT NULL,
            statement_date TEXT NOT NULL,
            total_local TEXT NOT NULL,
            total_foreign TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS holders (
            document_number TEXT NOT NULL REFERENCES resumes(document_number),
            holder TEXT NOT NULL,
            total_local TEXT NOT NULL,
            total_foreign TEXT NOT NULL,
            PRIMARY KEY (document_number, holder)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS holder_expenses (
            document_number TEXT NOT NULL,
            holder TEXT NOT NULL,
            position INTEGER NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            amount TEXT NOT NULL,
            PRIMARY KEY (document_number, holder, position),
            FOREIGN KEY (document_number, holder) REFERENCES holders(document_number, holder)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_resumes_statement_date ON resumes(statement_date)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// DATABASE HANDLE
// ============================================================================

/// Both SQLite databases, opened once at startup and passed down explicitly
#[derive(Clone)]
pub struct Database {
    transactions: SharedConnection,
    cards: SharedConnection,
}

impl Database {
    pub fn open(transactions_path: &Path, cards_path: &Path) -> Result<Self, StoreError> {
        let transactions = open_connection(transactions_path)?;
        let cards = open_connection(cards_path)?;
        info!(
            transactions = %transactions_path.display(),
            cards = %cards_path.display(),
            "databases opened"
        );
        Self::from_connections(transactions, cards)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connections(Connection::open_in_memory()?, Connection::open_in_memory()?)
    }

    fn from_connections(transactions: Connection, cards: Connection) -> Result<Self, StoreError> {
        setup_transactions_database(&transactions)?;
        setup_cards_database(&cards)?;

        Ok(Database {
            transactions: Arc::new(Mutex::new(transactions)),
            cards: Arc::new(Mutex::new(cards)),
        })
    }

    pub fn transactions(&self) -> &SharedConnection {
        &self.transactions
    }

    pub fn cards(&self) -> &SharedConnection {
        &self.cards
    }

    pub fn record_store(&self, kind: RecordKind, policy: ApplyPolicy) -> SqliteRecordStore {
        SqliteRecordStore {
            conn: Arc::clone(&self.transactions),
            kind,
            policy,
        }
    }

    /// Close both connections. Handles still held elsewhere are only dropped.
    pub fn close(self) -> Result<(), StoreError> {
        for (name, shared) in [("transactions", self.transactions), ("cards", self.cards)] {
            match Arc::try_unwrap(shared) {
                Ok(mutex) => {
                    let conn = mutex.into_inner().map_err(|_| StoreError::Poisoned)?;
                    conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
                    info!(database = name, "database closed");
                }
                Err(_) => debug!(database = name, "database still shared, dropping handle"),
            }
        }
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

pub fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::Poisoned)
}

/// Read a money column stored as TEXT, REAL or INTEGER (older databases
/// wrote REAL). Unreadable values count as 0, same as the amount parser.
pub fn decimal_column(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Text(bytes) => {
            parse_amount(&String::from_utf8_lossy(bytes), AmountStyle::Local)
        }
        ValueRef::Integer(i) => Decimal::from(i),
        ValueRef::Real(f) => Decimal::try_from(f).unwrap_or(Decimal::ZERO),
        ValueRef::Null | ValueRef::Blob(_) => Decimal::ZERO,
    })
}

// ============================================================================
// RECORD STORE
// ============================================================================

/// How the insert and delete sets of one sync are committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyPolicy {
    /// Both sets in one transaction: all or nothing
    #[default]
    Atomic,
    /// Each set commits on its own; a half-applied sync is reported as
    /// `StoreError::PartialSync`
    BestEffort,
}

impl FromStr for ApplyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "atomic" => Ok(ApplyPolicy::Atomic),
            "best-effort" | "best_effort" => Ok(ApplyPolicy::BestEffort),
            other => Err(other.to_string()),
        }
    }
}

/// What an apply left out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Uuids of insert candidates that were already stored (outside the
    /// fetched window); they are left untouched
    pub already_stored: Vec<String>,
}

/// Storage side of a record sync
pub trait RecordStore: Send + Sync {
    fn kind(&self) -> RecordKind;

    /// Stored rows the sheet is compared against
    fn fetch_window(&self, mode: &SyncMode) -> Result<Vec<FinancialRecord>, StoreError>;

    /// Insert one set and delete the other (by primary key). A uuid that is
    /// already stored is not an error; it comes back in the outcome.
    fn apply(&self, insert: &[FinancialRecord], delete: &[FinancialRecord]) -> Result<ApplyOutcome, StoreError>;
}

pub struct SqliteRecordStore {
    conn: SharedConnection,
    kind: RecordKind,
    policy: ApplyPolicy,
}

impl SqliteRecordStore {
    pub fn new(conn: SharedConnection, kind: RecordKind, policy: ApplyPolicy) -> Self {
        SqliteRecordStore { conn, kind, policy }
    }
}

impl RecordStore for SqliteRecordStore {
    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn fetch_window(&self, mode: &SyncMode) -> Result<Vec<FinancialRecord>, StoreError> {
        let conn = lock(&self.conn)?;
        match mode {
            SyncMode::Incremental(window) => query_records(
                &conn,
                self.kind,
                "WHERE date_time LIKE ?1 OR date_time LIKE ?2",
                params![window.date_pattern(), window.legacy_pattern()],
            ),
            SyncMode::Historical => query_records(&conn, self.kind, "", params![]),
        }
    }

    fn apply(&self, insert: &[FinancialRecord], delete: &[FinancialRecord]) -> Result<ApplyOutcome, StoreError> {
        if insert.is_empty() && delete.is_empty() {
            return Ok(ApplyOutcome::default());
        }

        let kind = self.kind;
        let mut conn = lock(&self.conn)?;

        match self.policy {
            ApplyPolicy::Atomic => {
                let tx = conn.transaction()?;
                let already_stored = insert_records(&tx, kind, insert)?;
                delete_records(&tx, kind, delete)?;
                tx.commit()?;
                Ok(ApplyOutcome { already_stored })
            }
            ApplyPolicy::BestEffort => {
                let inserted = run_step(&mut conn, |tx| insert_records(tx, kind, insert));
                let deleted = run_step(&mut conn, |tx| delete_records(tx, kind, delete));

                match (inserted, deleted) {
                    (Ok(already_stored), Ok(())) => Ok(ApplyOutcome { already_stored }),
                    (Ok(_), Err(source)) if !insert.is_empty() => Err(StoreError::PartialSync {
                        completed: ApplyStep::Insert,
                        count: insert.len(),
                        failed: ApplyStep::Delete,
                        source,
                    }),
                    (Err(source), Ok(())) if !delete.is_empty() => Err(StoreError::PartialSync {
                        completed: ApplyStep::Delete,
                        count: delete.len(),
                        failed: ApplyStep::Insert,
                        source,
                    }),
                    (Err(e), _) | (_, Err(e)) => Err(StoreError::Sqlite(e)),
                }
            }
        }
    }
}

fn run_step<T, F>(conn: &mut Connection, step: F) -> rusqlite::Result<T>
where
    F: FnOnce(&Connection) -> rusqlite::Result<T>,
{
    let tx = conn.transaction()?;
    let value = step(&tx)?;
    tx.commit()?;
    Ok(value)
}

// Returns the uuids that were already stored and so not inserted
fn insert_records(conn: &Connection, kind: RecordKind, records: &[FinancialRecord]) -> rusqlite::Result<Vec<String>> {
    let mut already_stored = Vec::new();
    if records.is_empty() {
        return Ok(already_stored);
    }

    let sql = format!(
        "INSERT INTO {} (uuid, date_time, date, description, amount, {})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(uuid) DO NOTHING",
        kind.table(),
        kind.label_column()
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    for record in records {
        let inserted = stmt.execute(params![
            record.uuid,
            record.date_time,
            record
                .occurred_at
                .map(|dt| dt.format(STORAGE_DATE_TIME_LAYOUT).to_string()),
            record.description,
            record.amount.to_string(),
            record.label(kind),
        ])?;
        if inserted == 0 {
            already_stored.push(record.uuid.clone());
        }
    }

    Ok(already_stored)
}

fn delete_records(conn: &Connection, kind: RecordKind, records: &[FinancialRecord]) -> rusqlite::Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let mut by_id = conn.prepare_cached(&format!("DELETE FROM {} WHERE id = ?1", kind.table()))?;
    let mut by_uuid = conn.prepare_cached(&format!("DELETE FROM {} WHERE uuid = ?1", kind.table()))?;

    for record in records {
        match record.id {
            Some(id) => by_id.execute(params![id])?,
            None => by_uuid.execute(params![record.uuid])?,
        };
    }

    Ok(())
}

/// Shared SELECT for both record tables; `filter` is appended verbatim
pub fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    kind: RecordKind,
    filter: &str,
    params: P,
) -> Result<Vec<FinancialRecord>, StoreError> {
    let sql = format!(
        "SELECT id, uuid, date_time, date, description, amount, {}
         FROM {} {}",
        kind.label_column(),
        kind.table(),
        filter
    );

    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params, |row| record_from_row(kind, row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

fn record_from_row(kind: RecordKind, row: &Row) -> rusqlite::Result<FinancialRecord> {
    let date: Option<String> = row.get(3)?;
    let label: Option<String> = row.get(6)?;
    let (category, currency) = match kind {
        RecordKind::Expense => (label, None),
        RecordKind::Income => (None, label),
    };

    Ok(FinancialRecord {
        id: Some(row.get(0)?),
        uuid: row.get(1)?,
        date_time: row.get(2)?,
        occurred_at: date.and_then(|d| parse_date_time(&d, STORAGE_DATE_TIME_LAYOUT).ok()),
        description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        amount: decimal_column(row, 5)?,
        category,
        currency,
    })
}

pub fn count_records(conn: &Connection, kind: RecordKind) -> Result<i64, StoreError> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", kind.table()),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}
