use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use finance_sync::db::lock;
use finance_sync::{
    build_router, AppState, CsvSheetSource, Database, KeywordSettings, Settings, SourceError,
    StatementExtractor,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn bare_app() -> Router {
    build_router(AppState::new(Database::open_in_memory().unwrap(), Settings::default()))
}

const EXPENSES_CSV: &str = "\
Fecha,Monto,Descripcion,Tipo,UUID
1/7/2025 10:00:00,\"1.234,50\",Supermercado,Food,exp-1
2025-07-02T09:30:00,100,Alquiler,Rent,exp-2
15/6/2025 08:00:00,50,Cafe,Food,exp-3
";

const INCOMES_CSV: &str = "\
Fecha,Monto,Moneda,Descripcion,UUID
1/7/2025 09:00:00,\"2.000,00\",ARS,Sueldo,inc-1
";

/// App reading sheets from CSV files, already synced once
async fn synced_app() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("Gastos.csv"), EXPENSES_CSV).unwrap();
    std::fs::write(dir.path().join("Income.csv"), INCOMES_CSV).unwrap();

    let state = AppState::new(Database::open_in_memory().unwrap(), Settings::default())
        .with_sheet_source(Arc::new(CsvSheetSource::new(dir.path())));
    let app = build_router(state);

    let (status, _) = get(&app, "/expenses/sync/historical").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(&app, "/incomes/sync/historical").await;
    assert_eq!(status, StatusCode::OK);

    (dir, app)
}

#[tokio::test]
async fn health_check_works() {
    let (status, body) = get(&bare_app(), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn malformed_month_is_rejected() {
    let app = bare_app();

    let (status, body) = get(&app, "/expenses?year=2025&month=13").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid month");

    let (status, body) = get(&app, "/incomes?year=abcd&month=7").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid year");

    let (status, _) = get(&app, "/cards/expenses?year=2025").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sync_without_sources_is_a_server_error() {
    let app = bare_app();

    let (status, body) = get(&app, "/expenses/sync/month").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("not configured"));

    let (status, _) = get(&app, "/cards/sync/resumes").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn storage_failures_do_not_leak_sql() {
    let db = Database::open_in_memory().unwrap();
    lock(db.transactions())
        .unwrap()
        .execute_batch("DROP TABLE expenses")
        .unwrap();
    let app = build_router(AppState::new(db, Settings::default()));

    let (status, body) = get(&app, "/expenses?year=2025&month=7").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "database error");
    assert!(!body.to_string().contains("SELECT"));
}

#[tokio::test]
async fn historical_sync_from_csv_is_idempotent() {
    let (_dir, app) = synced_app().await;

    let (status, body) = get(&app, "/expenses/sync/historical").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted_rows"], 0);
    assert_eq!(body["rows_deleted"], 0);
    assert!(body["sync_id"].is_string());
}

#[tokio::test]
async fn expenses_are_listed_by_month_with_exclusions() {
    let (_dir, app) = synced_app().await;

    let (status, body) = get(&app, "/expenses?year=2025&month=7").await;
    assert_eq!(status, StatusCode::OK);
    let expenses = body["expenses"].as_array().unwrap();
    assert_eq!(expenses.len(), 2);
    // newest first
    assert_eq!(expenses[0]["uuid"], "exp-2");
    assert_eq!(expenses[0]["date_time"], "2/7/2025 09:30:00");
    assert_eq!(expenses[1]["formatted_amount"], "$1.234,50");

    let (_, body) = get(&app, "/expenses?year=2025&month=7&exclude=%5BRent%5D").await;
    let expenses = body["expenses"].as_array().unwrap();
    assert_eq!(expenses.len(), 1);
    assert_eq!(expenses[0]["uuid"], "exp-1");
}

#[tokio::test]
async fn expense_summary_groups_by_category() {
    let (_dir, app) = synced_app().await;

    let (status, body) = get(&app, "/expenses/summary?year=2025&month=7").await;
    assert_eq!(status, StatusCode::OK);

    let summary = &body["summary"];
    assert_eq!(summary["period"], "2025-07");
    assert_eq!(summary["formatted_total"], "$1.334,50");

    let categories = summary["categories_summary"].as_array().unwrap();
    assert_eq!(categories.len(), 2);
    assert_eq!(categories[0]["category"], "Food");
    assert_eq!(categories[1]["formatted_total"], "$100,00");
}

#[tokio::test]
async fn incomes_are_listed_with_total() {
    let (_dir, app) = synced_app().await;

    let (status, body) = get(&app, "/incomes?year=2025&month=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["income_total_formatted"], "$2.000,00");
    assert_eq!(body["incomes_details"].as_array().unwrap().len(), 1);
    assert_eq!(body["incomes_details"][0]["currency"], "ARS");

    let (_, body) = get(&app, "/incomes?year=2025&month=6").await;
    assert!(body["incomes_details"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn balance_covers_all_time_totals() {
    let (_dir, app) = synced_app().await;

    let (status, body) = get(&app, "/balance").await;
    assert_eq!(status, StatusCode::OK);
    // 2000 - (1234.50 + 100 + 50)
    assert_eq!(body["formatted_balance"], "$615,50");
    assert_eq!(body["formatted_expenses"], "$1.384,50");
    assert_eq!(body["formatted_incomes"], "$2.000,00");
}

// ============================================================================
// CARDS
// ============================================================================

const STATEMENT_JSON: &str = r#"{
    "Total": {"pesos": "1.500,00", "dolares": "10,00"},
    "JUAN": {
        "Detail": [
            {"fecha": "05/07/25", "descripcion": "NETFLIX.COM", "importe": "1.000,00"},
            {"fecha": "06/07/25", "descripcion": "MERCADO C.05/06", "importe": "500,00"}
        ],
        "Total": {"pesos": "1.500,00", "dolares": "0,00"}
    }
}"#;

struct CannedExtractor;

#[async_trait]
impl StatementExtractor for CannedExtractor {
    async fn extract(&self, _path: &Path) -> Result<Vec<u8>, SourceError> {
        Ok(STATEMENT_JSON.as_bytes().to_vec())
    }
}

/// App with one July 2025 Visa statement ingested
async fn cards_app(keywords: KeywordSettings) -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("07-2025.pdf"), b"%PDF").unwrap();

    let settings = Settings {
        statement_dirs: vec![(finance_sync::CardNetwork::Visa, dir.path().to_path_buf())],
        keywords,
        ..Settings::default()
    };
    let state = AppState::new(Database::open_in_memory().unwrap(), settings)
        .with_extractor(Arc::new(CannedExtractor));
    let app = build_router(state);

    let (status, body) = get(&app, "/cards/sync/resumes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["statements"][0]["status"], "created");

    (dir, app)
}

#[tokio::test]
async fn statement_sync_skips_known_documents() {
    let (_dir, app) = cards_app(KeywordSettings::default()).await;

    let (status, body) = get(&app, "/cards/sync/resumes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["statements"][0]["status"], "already_exists");
}

#[tokio::test]
async fn card_expenses_filter_by_network_and_holder() {
    let (_dir, app) = cards_app(KeywordSettings::default()).await;

    let (status, body) = get(&app, "/cards/expenses?year=2025&month=7&card_type=VISA").await;
    assert_eq!(status, StatusCode::OK);
    let statements = body.as_array().unwrap();
    assert_eq!(statements.len(), 1);
    assert_eq!(statements[0]["card_network"], "visa");
    let expenses = statements[0]["holders"][0]["expenses"].as_array().unwrap();
    assert_eq!(expenses.len(), 2);
    assert_eq!(expenses[0]["position"], 1);

    let (_, body) = get(&app, "/cards/expenses?year=2025&month=7&card_type=mastercard").await;
    assert!(body.as_array().unwrap().is_empty());

    let (_, body) = get(&app, "/cards/expenses?year=2025&month=7&holder=juan").await;
    assert_eq!(body[0]["holders"][0]["holder"], "JUAN");

    let (_, body) = get(&app, "/cards/expenses?year=2025&month=7&holder=pedro").await;
    assert_eq!(body["result"], "No holders found for the specified filter");

    let (_, body) = get(&app, "/cards/expenses?year=2025&month=8&months_back=1").await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn card_expenses_limit_how_far_back_they_look() {
    let (_dir, app) = cards_app(KeywordSettings::default()).await;

    let (status, body) = get(&app, "/cards/expenses?year=2035&month=7&months_back=120").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = get(&app, "/cards/expenses?year=2025&month=7&months_back=40000").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "months_back must be at most 120");
}

#[tokio::test]
async fn subscriptions_need_a_keyword_map() {
    let (_dir, app) = cards_app(KeywordSettings::default()).await;

    let (status, body) = get(&app, "/cards/subscriptions?year=2025&month=7").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "subscription map is empty");
}

#[tokio::test]
async fn subscriptions_are_summarized_by_keyword() {
    let mut keywords = KeywordSettings::default();
    keywords
        .subscriptions
        .insert("netflix".to_string(), "Netflix".to_string());
    keywords
        .subscription_logos
        .insert("Netflix".to_string(), "netflix.png".to_string());
    let (_dir, app) = cards_app(keywords).await;

    let (status, body) = get(&app, "/cards/subscriptions?year=2025&month=7").await;
    assert_eq!(status, StatusCode::OK);
    let summaries = body.as_array().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["service"], "Netflix");
    assert_eq!(summaries[0]["total_amount_formatted"], "$1.000,00");
    assert_eq!(summaries[0]["logo_name"], "netflix.png");
}

#[tokio::test]
async fn installments_close_to_their_end_are_listed() {
    let (_dir, app) = cards_app(KeywordSettings::default()).await;

    let (status, body) = get(&app, "/cards/installments?year=2025&month=7").await;
    assert_eq!(status, StatusCode::OK);
    let found = body.as_array().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["installment"], 5);
    assert_eq!(found[0]["remaining_installments"], 1);
    assert_eq!(found[0]["formatted_amount"], "$500,00");

    let (status, _) = get(&app, "/cards/installments?year=2025&month=7&remaining=x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
