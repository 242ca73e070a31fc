// 🔄 Sync Orchestration
//
//   sheet rows ──map──> source map ─┐
//                                   ├─ reconcile ─> apply(insert, delete)
//   stored window ──map──> stored ──┘
//
//   statement dirs ──> extract ──> sha256 ──> classify ──> insert once

use crate::cards::{insert_statement, statement_exists, CardNetwork, CardStatement};
use crate::db::{lock, RecordStore, SharedConnection};
use crate::error::{StoreError, SyncError};
use crate::normalize::parse_statement_month;
use crate::parser::classify_statement;
use crate::reconciliation::{reconcile, SyncMode};
use crate::records::{sheet_rows_to_map, to_keyed_map, FinancialRecord, RecordKind, SheetRow, SkippedRow};
use crate::sources::{SheetSource, StatementExtractor};
use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

// ============================================================================
// RECORD SYNC
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub sync_id: Uuid,
    pub rows_deleted: usize,
    pub deleted_rows_detail: Vec<FinancialRecord>,
    pub inserted_rows: usize,
    pub inserted_rows_detail: Vec<FinancialRecord>,
    pub skipped_rows: Vec<SkippedRow>,
}

/// Bring one table in line with the sheet.
///
/// Incremental mode only compares against (and so only deletes from) the
/// month window; historical mode compares against the whole table.
pub async fn sync_records(
    source: &dyn SheetSource,
    store: &dyn RecordStore,
    mode: SyncMode,
    range: &str,
) -> Result<SyncReport, SyncError> {
    let sync_id = Uuid::new_v4();
    let kind = store.kind();
    let span = info_span!("sync", %sync_id, table = kind.table(), mode = mode.label());

    async move {
        let rows = source.read_range(range).await?;
        if rows.is_empty() {
            return Err(SyncError::EmptySheet(range.to_string()));
        }

        let keyed = sheet_rows_to_map(kind, &rows);
        let stored = to_keyed_map(store.fetch_window(&mode)?);
        info!(
            sheet_rows = rows.len().saturating_sub(1),
            mapped = keyed.records.len(),
            stored = stored.len(),
            "comparing sheet against storage"
        );

        let result = reconcile(keyed.records, stored);
        info!("{}", result.summary());

        let outcome = store.apply(&result.to_insert, &result.to_delete)?;

        let mut inserted = result.to_insert;
        let mut skipped_rows = keyed.skipped;
        if !outcome.already_stored.is_empty() {
            let already: HashSet<&str> = outcome.already_stored.iter().map(String::as_str).collect();
            inserted.retain(|r| !already.contains(r.uuid.as_str()));

            for uuid in &outcome.already_stored {
                let row = sheet_row_of(kind, &rows, uuid);
                warn!(row, %uuid, "uuid already stored outside the sync window, row left as is");
                skipped_rows.push(SkippedRow {
                    row,
                    reason: format!("uuid {} is already stored outside the sync window", uuid),
                });
            }
            skipped_rows.sort_by_key(|s| s.row);
        }

        Ok(SyncReport {
            sync_id,
            rows_deleted: result.to_delete.len(),
            deleted_rows_detail: result.to_delete,
            inserted_rows: inserted.len(),
            inserted_rows_detail: inserted,
            skipped_rows,
        })
    }
    .instrument(span)
    .await
}

// Last sheet row carrying `uuid` (the one the mapper kept)
fn sheet_row_of(kind: RecordKind, rows: &[SheetRow], uuid: &str) -> usize {
    let column = kind.sheet_columns().uuid;
    rows.iter()
        .rposition(|row| row.get(column).map(|cell| cell.trim()) == Some(uuid))
        .unwrap_or_default()
}

// ============================================================================
// STATEMENT INGESTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Created,
    AlreadyExists,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedStatement {
    pub file_name: String,
    pub card_network: CardNetwork,
    pub statement_date: NaiveDate,
    pub document_number: String,
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatementSyncReport {
    pub sync_id: Uuid,
    pub statements: Vec<IngestedStatement>,
    pub skipped_files: Vec<SkippedFile>,
}

/// `.pdf` files of a directory, sorted by name
pub fn list_statement_files(dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SyncError::Directory {
        path: dir.display().to_string(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect();

    files.sort();
    Ok(files)
}

/// Lowercase hex SHA-256 of the raw extraction response
pub fn document_number(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Extract, classify and store every statement found in `dirs`, one file at
/// a time. Files that cannot be dated, extracted or classified are skipped.
pub async fn ingest_statements(
    extractor: &dyn StatementExtractor,
    cards: &SharedConnection,
    dirs: &[(CardNetwork, PathBuf)],
) -> Result<StatementSyncReport, SyncError> {
    if dirs.is_empty() {
        return Err(SyncError::NotConfigured("statement directory"));
    }

    let sync_id = Uuid::new_v4();
    let span = info_span!("statement_sync", %sync_id);

    async move {
        let mut report = StatementSyncReport {
            sync_id,
            statements: Vec::new(),
            skipped_files: Vec::new(),
        };

        for (network, dir) in dirs {
            for path in list_statement_files(dir)? {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                match ingest_file(extractor, cards, *network, &path).await {
                    Ok(ingested) => report.statements.push(ingested),
                    Err(reason) => {
                        warn!(file = %file_name, %reason, "skipping statement file");
                        report.skipped_files.push(SkippedFile {
                            file: file_name,
                            reason,
                        });
                    }
                }
            }
        }

        info!(
            ingested = report.statements.len(),
            skipped = report.skipped_files.len(),
            "statement sync finished"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

// Err = reason the file was skipped
async fn ingest_file(
    extractor: &dyn StatementExtractor,
    cards: &SharedConnection,
    network: CardNetwork,
    path: &Path,
) -> Result<IngestedStatement, String> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let statement_date = parse_statement_month(&stem).map_err(|e| e.to_string())?;

    let payload = extractor.extract(path).await.map_err(|e| e.to_string())?;
    let hash = document_number(&payload);
    let parsed = classify_statement(&payload).map_err(|e| e.to_string())?;

    let statement = CardStatement::from_parsed(hash, network, statement_date, parsed);
    let (status, error) = match store_statement(cards, &statement) {
        Ok(status) => (status, None),
        Err(e) => {
            warn!(document_number = %statement.document_number, error = %e, "statement insert failed");
            (IngestStatus::Failed, Some(e.to_string()))
        }
    };

    info!(
        document_number = %statement.document_number,
        network = %network,
        date = %statement_date,
        ?status,
        "statement processed"
    );

    Ok(IngestedStatement {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        card_network: network,
        statement_date,
        document_number: statement.document_number,
        status,
        error,
    })
}

fn store_statement(cards: &SharedConnection, statement: &CardStatement) -> Result<IngestStatus, StoreError> {
    let mut conn = lock(cards)?;
    if statement_exists(&conn, &statement.document_number)? {
        return Ok(IngestStatus::AlreadyExists);
    }
    insert_statement(&mut conn, statement)?;
    Ok(IngestStatus::Created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ApplyPolicy, Database};
    use crate::error::{ApplyStep, SourceError};
    use crate::reconciliation::MonthWindow;
    use crate::records::{RecordKind, SheetRow};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, HashSet};

    struct FakeSheet {
        rows: Vec<SheetRow>,
    }

    #[async_trait]
    impl SheetSource for FakeSheet {
        async fn read_range(&self, _range: &str) -> Result<Vec<SheetRow>, SourceError> {
            Ok(self.rows.clone())
        }
    }

    /// Answers per file name; unknown files fail like a 502 from the service
    struct FakeExtractor {
        responses: HashMap<String, String>,
    }

    #[async_trait]
    impl StatementExtractor for FakeExtractor {
        async fn extract(&self, path: &Path) -> Result<Vec<u8>, SourceError> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            self.responses
                .get(&name)
                .map(|body| body.as_bytes().to_vec())
                .ok_or(SourceError::Status {
                    service: "pdf extraction",
                    status: 502,
                    body: "bad gateway".to_string(),
                })
        }
    }

    fn row(cells: &[&str]) -> SheetRow {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn header() -> SheetRow {
        row(&["Fecha", "Monto", "Descripcion", "Tipo", "UUID"])
    }

    fn uuids(records: &[FinancialRecord]) -> HashSet<String> {
        records.iter().map(|r| r.uuid.clone()).collect()
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn july() -> SyncMode {
        SyncMode::Incremental(MonthWindow::new(2025, 7).unwrap())
    }

    async fn seed(db: &Database, rows: Vec<SheetRow>) {
        let store = db.record_store(RecordKind::Expense, ApplyPolicy::Atomic);
        sync_records(&FakeSheet { rows }, &store, SyncMode::Historical, "Gastos!A:Z")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_incremental_sync() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            vec![
                header(),
                row(&["1/7/2025 10:00:00", "10", "A", "Food", "A"]),
                row(&["2/7/2025 10:00:00", "20", "B", "Food", "B"]),
            ],
        )
        .await;

        let store = db.record_store(RecordKind::Expense, ApplyPolicy::Atomic);
        let sheet = FakeSheet {
            rows: vec![
                header(),
                row(&["2/7/2025 10:00:00", "20", "B", "Food", "B"]),
                row(&["2025-07-03T09:00:00", "30", "C", "Food", "C"]),
            ],
        };

        let report = sync_records(&sheet, &store, july(), "GastosMesActual!A:Z")
            .await
            .unwrap();

        assert_eq!(report.inserted_rows, 1);
        assert_eq!(uuids(&report.inserted_rows_detail), set(&["C"]));
        assert_eq!(report.rows_deleted, 1);
        assert_eq!(uuids(&report.deleted_rows_detail), set(&["A"]));
        assert_eq!(report.deleted_rows_detail[0].amount, dec!(10));

        let after = store.fetch_window(&july()).unwrap();
        assert_eq!(uuids(&after), set(&["B", "C"]));
    }

    #[tokio::test]
    async fn test_incremental_sync_leaves_other_months_alone() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            vec![
                header(),
                row(&["1/7/2025 10:00:00", "10", "July", "Food", "july"]),
                row(&["1/6/2025 10:00:00", "10", "June", "Food", "june"]),
            ],
        )
        .await;

        let store = db.record_store(RecordKind::Expense, ApplyPolicy::Atomic);
        let report = sync_records(&FakeSheet { rows: vec![header()] }, &store, july(), "r")
            .await
            .unwrap();

        assert_eq!(uuids(&report.deleted_rows_detail), set(&["july"]));
        let remaining = store.fetch_window(&SyncMode::Historical).unwrap();
        assert_eq!(uuids(&remaining), set(&["june"]));
    }

    #[tokio::test]
    async fn test_row_stored_under_previous_month_does_not_block_sync() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            vec![header(), row(&["30/6/2025 22:00:00", "10", "X", "Food", "X"])],
        )
        .await;

        // Month tab still holds June's last row on the first of July
        let store = db.record_store(RecordKind::Expense, ApplyPolicy::Atomic);
        let sheet = FakeSheet {
            rows: vec![
                header(),
                row(&["30/6/2025 22:00:00", "10", "X", "Food", "X"]),
                row(&["1/7/2025 09:00:00", "30", "C", "Food", "C"]),
            ],
        };

        let report = sync_records(&sheet, &store, july(), "GastosMesActual!A:Z")
            .await
            .unwrap();

        assert_eq!(report.inserted_rows, 1);
        assert_eq!(uuids(&report.inserted_rows_detail), set(&["C"]));
        assert_eq!(report.skipped_rows.len(), 1);
        assert_eq!(report.skipped_rows[0].row, 1);
        assert!(report.skipped_rows[0].reason.contains("X"));

        let stored = store.fetch_window(&SyncMode::Historical).unwrap();
        assert_eq!(uuids(&stored), set(&["X", "C"]));
    }

    #[tokio::test]
    async fn test_skipped_rows_are_reported() {
        let db = Database::open_in_memory().unwrap();
        let store = db.record_store(RecordKind::Expense, ApplyPolicy::Atomic);
        let sheet = FakeSheet {
            rows: vec![
                header(),
                row(&["garbage", "10", "x", "y", "bad"]),
                row(&["1/7/2025 10:00:00", "10", "x", "y", "good"]),
            ],
        };

        let report = sync_records(&sheet, &store, SyncMode::Historical, "r").await.unwrap();

        assert_eq!(report.inserted_rows, 1);
        assert_eq!(report.skipped_rows.len(), 1);
        assert_eq!(report.skipped_rows[0].row, 1);
    }

    #[tokio::test]
    async fn test_empty_sheet_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        let store = db.record_store(RecordKind::Income, ApplyPolicy::Atomic);

        let result = sync_records(&FakeSheet { rows: vec![] }, &store, july(), "IncomeMesActual!A:Z").await;
        assert!(matches!(result, Err(SyncError::EmptySheet(range)) if range == "IncomeMesActual!A:Z"));
    }

    #[tokio::test]
    async fn test_best_effort_sync_surfaces_partial_sync() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            vec![header(), row(&["1/7/2025 10:00:00", "10", "A", "Food", "A"])],
        )
        .await;
        lock(db.transactions())
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER block_deletes BEFORE DELETE ON expenses
                 BEGIN SELECT RAISE(ABORT, 'deletes blocked'); END;",
            )
            .unwrap();

        let store = db.record_store(RecordKind::Expense, ApplyPolicy::BestEffort);
        let sheet = FakeSheet {
            rows: vec![header(), row(&["2/7/2025 10:00:00", "20", "B", "Food", "B"])],
        };
        let result = sync_records(&sheet, &store, july(), "r").await;

        assert!(matches!(
            result,
            Err(SyncError::Store(StoreError::PartialSync {
                completed: ApplyStep::Insert,
                failed: ApplyStep::Delete,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_report_json_shape() {
        let db = Database::open_in_memory().unwrap();
        let store = db.record_store(RecordKind::Income, ApplyPolicy::Atomic);
        let sheet = FakeSheet {
            rows: vec![
                row(&["Fecha", "Monto", "Moneda", "Descripcion", "UUID"]),
                row(&["1/7/2025 10:00:00", "500.000", "ARS", "Sueldo", "i-1"]),
            ],
        };

        let report = sync_records(&sheet, &store, july(), "r").await.unwrap();
        let json = serde_json::to_value(&report).unwrap();

        for key in [
            "sync_id",
            "rows_deleted",
            "deleted_rows_detail",
            "inserted_rows",
            "inserted_rows_detail",
            "skipped_rows",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["inserted_rows_detail"][0]["currency"], "ARS");
    }

    const STATEMENT: &str = r#"{
        "Total": {"pesos": "1.500,00", "dolares": "10,00"},
        "Juan": {
            "Detail": [{"fecha": "05/07/2025", "descripcion": "NETFLIX", "importe": "1.500,00"}],
            "Total": {"pesos": "1.500,00", "dolares": "10,00"}
        }
    }"#;

    #[tokio::test]
    async fn test_statement_ingestion_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["07-2025.pdf", "08-2025.pdf", "resumen.pdf", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"%PDF").unwrap();
        }

        let extractor = FakeExtractor {
            responses: [("07-2025.pdf".to_string(), STATEMENT.to_string())]
                .into_iter()
                .collect(),
        };
        let db = Database::open_in_memory().unwrap();
        let dirs = vec![(CardNetwork::Visa, dir.path().to_path_buf())];

        let first = ingest_statements(&extractor, db.cards(), &dirs).await.unwrap();
        assert_eq!(first.statements.len(), 1);
        assert_eq!(first.statements[0].status, IngestStatus::Created);
        assert_eq!(
            first.statements[0].statement_date,
            NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()
        );
        assert_eq!(first.statements[0].document_number, document_number(STATEMENT.as_bytes()));

        // 08-2025 fails extraction, resumen has no month; notes.txt is not listed
        let skipped: Vec<&str> = first.skipped_files.iter().map(|s| s.file.as_str()).collect();
        assert_eq!(skipped, vec!["08-2025.pdf", "resumen.pdf"]);

        let second = ingest_statements(&extractor, db.cards(), &dirs).await.unwrap();
        assert_eq!(second.statements[0].status, IngestStatus::AlreadyExists);

        let conn = lock(db.cards()).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM resumes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_missing_statement_directory() {
        let extractor = FakeExtractor {
            responses: HashMap::new(),
        };
        let db = Database::open_in_memory().unwrap();

        let missing = vec![(CardNetwork::Mastercard, PathBuf::from("/nonexistent/statements"))];
        assert!(matches!(
            ingest_statements(&extractor, db.cards(), &missing).await,
            Err(SyncError::Directory { .. })
        ));

        assert!(matches!(
            ingest_statements(&extractor, db.cards(), &[]).await,
            Err(SyncError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_document_number_is_lowercase_hex() {
        let hash = document_number(b"{}");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
